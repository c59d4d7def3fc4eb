//! In-process transport.
//!
//! Connects nodes living in one process through a simulated network that can
//! delay, drop and partition traffic. Every request and response is passed
//! through the wire codec on the way, so what nodes exchange here is exactly
//! what a socket transport would have to carry.

use super::call::{Call, Handler, Router};
use super::rpc::{Request, Response};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rlog_common::error::Result;
use rlog_common::types::Address;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// How the simulated network treats each message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkModel {
    pub drop_rate: f64,      // Probability a call is answered with nothing
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl NetworkModel {
    pub const RELIABLE: Self = Self {
        drop_rate: 0.0,
        min_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
}

impl Default for NetworkModel {
    fn default() -> Self {
        Self::RELIABLE
    }
}

enum Fate {
    Lost,
    Dropped(Duration),
    Delivered(Duration),
}

pub struct LocalNetwork {
    handlers: RwLock<HashMap<Address, Arc<dyn Handler>>>,
    isolated: RwLock<HashSet<Address>>,
    model: Mutex<NetworkModel>,
    rng: Mutex<StdRng>,
}

impl LocalNetwork {
    pub fn new(model: NetworkModel, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            isolated: RwLock::new(HashSet::new()),
            model: Mutex::new(model),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Makes `handler` reachable at `address`.
    pub fn register(&self, address: Address, handler: Arc<dyn Handler>) {
        self.handlers.write().insert(address, handler);
    }

    /// A router for the node at `from`; partitions apply to both directions.
    pub fn router_for(self: &Arc<Self>, from: impl Into<Address>) -> Arc<dyn Router> {
        Arc::new(LocalRouter {
            network: Arc::clone(self),
            from: from.into(),
        })
    }

    /// Cuts `address` off from every other node. Its calls are never answered.
    pub fn isolate(&self, address: &str) {
        self.isolated.write().insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.isolated.write().remove(address);
    }

    pub fn set_model(&self, model: NetworkModel) {
        *self.model.lock() = model;
    }

    fn fate(&self, from: &str, to: &str) -> Fate {
        if from != to {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                return Fate::Lost;
            }
        }

        let model = *self.model.lock();
        let mut rng = self.rng.lock();
        let delay = if model.max_delay > model.min_delay {
            rng.gen_range(model.min_delay..model.max_delay)
        } else {
            model.min_delay
        };
        if model.drop_rate > 0.0 && rng.gen_bool(model.drop_rate.min(1.0)) {
            Fate::Dropped(delay)
        } else {
            Fate::Delivered(delay)
        }
    }
}

struct LocalRouter {
    network: Arc<LocalNetwork>,
    from: Address,
}

#[async_trait]
impl Router for LocalRouter {
    async fn route(&self, address: &Address, call: Arc<Call>) {
        let handler = self.network.handlers.read().get(address).cloned();
        let Some(handler) = handler else {
            warn!(%address, "no node registered");
            call.write(None);
            return;
        };

        match self.network.fate(&self.from, address) {
            Fate::Lost => {
                trace!(from = %self.from, to = %address, kind = call.request().kind(), "lost");
            }
            Fate::Dropped(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    call.write(None);
                });
            }
            Fate::Delivered(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = deliver(handler.as_ref(), &call) {
                        warn!(%err, "codec failure");
                        call.write(None);
                    }
                });
            }
        }
    }
}

fn deliver(handler: &dyn Handler, call: &Call) -> Result<()> {
    let remote = Call::new(Request::decode(&call.request().encode()?)?);
    handler.handle(&remote);
    let response = match remote.take_response() {
        Some(response) => Some(Response::decode(&response.encode()?)?),
        None => None,
    };
    call.write(response);
    Ok(())
}
