//! Quorum fan-out.
//!
//! Sends one request to every member of the address book concurrently and
//! waits until each of those calls has completed, by answer or by deadline.
//! This is an all-complete barrier: callers count successes afterwards.

use super::call::{wait_then_cancel, Call, Router};
use super::cluster::ClusterState;
use super::rpc::{Request, Response};
use rlog_common::types::{Address, NodeId};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A peer and whatever it answered, `None` for lost, late or skipped calls.
pub type Reply = (NodeId, Option<Response>);

/// Builds one request per peer right away (`None` skips the peer) and returns
/// a future that resolves once every call completed.
///
/// All calls share a deadline of `cluster.rpc_timeout` (none when zero) and
/// are also cut short when `ctx` is cancelled. The future owns everything it
/// needs, so it can be spawned and forgotten.
pub fn batch_rpc<F>(
    router: &Arc<dyn Router>,
    cluster: &ClusterState,
    ctx: &CancellationToken,
    mut request_for: F,
) -> impl Future<Output = Vec<Reply>> + Send + 'static
where
    F: FnMut(NodeId) -> Option<Request>,
{
    let router = Arc::clone(router);
    let ctx = ctx.child_token();
    let timeout = cluster.rpc_timeout;
    let outgoing: Vec<(NodeId, Address, Option<Request>)> = cluster
        .address_book
        .iter()
        .map(|(&peer, address)| (peer, address.clone(), request_for(peer)))
        .collect();

    async move {
        // releases the deadline timer and any straggling waiters
        let _guard = ctx.clone().drop_guard();

        if !timeout.is_zero() {
            let deadline = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => deadline.cancel(),
                    _ = deadline.cancelled() => {}
                }
            });
        }

        let mut replies = Vec::with_capacity(outgoing.len());
        let mut tasks = JoinSet::new();
        for (peer, address, request) in outgoing {
            let Some(request) = request else {
                replies.push((peer, None));
                continue;
            };
            let router = Arc::clone(&router);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let call = Arc::new(Call::new(request));
                tokio::spawn(wait_then_cancel(Arc::clone(&call), ctx));
                router.route(&address, Arc::clone(&call)).await;
                call.done().await;
                (peer, call.take_response())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(reply) => replies.push(reply),
                Err(err) => warn!(%err, "rpc task failed"),
            }
        }
        replies
    }
}
