//! One request/response slot, completed exactly once.
//!
//! A lost, late or cancelled RPC completes with `None`, which callers cannot
//! tell apart from a peer that answered nothing. That is the whole timeout
//! story: there is no separate transport error type.

use super::rpc::{Request, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use rlog_common::types::Address;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct Call {
    request: Request,
    response: Mutex<Option<Response>>,
    written: AtomicBool,
    done: watch::Sender<bool>,
}

impl Call {
    pub fn new(request: Request) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            request,
            response: Mutex::new(None),
            written: AtomicBool::new(false),
            done,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Completes the call. Only the first write counts; returns whether this one did.
    pub fn write(&self, response: Option<Response>) -> bool {
        if self
            .written
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.response.lock() = response;
        self.done.send_replace(true);
        true
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the call has been written, whether before or after this is polled.
    pub async fn done(&self) {
        let mut rx = self.done.subscribe();
        while !*rx.borrow_and_update() {
            // the sender lives in `self`, so the channel cannot close under us
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Takes the response out of a completed call.
    pub fn take_response(&self) -> Option<Response> {
        self.response.lock().take()
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("request", &self.request.kind())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Races `ctx` against the call: if `ctx` fires first the call is completed with `None`.
pub async fn wait_then_cancel(call: Arc<Call>, ctx: CancellationToken) {
    tokio::select! {
        _ = call.done() => {}
        _ = ctx.cancelled() => {
            call.write(None);
        }
    }
}

/// Serves calls addressed to one node.
pub trait Handler: Send + Sync {
    fn handle(&self, call: &Call);
}

/// Moves calls to the node listening at an address.
///
/// Implementations must either get the call written eventually or leave it to
/// the caller's deadline; they should not block beyond handing it off.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, address: &Address, call: Arc<Call>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::rpc::{DecideRequest, DecideResponse, UpdateRequest};
    use std::time::Duration;

    fn update_call() -> Call {
        Call::new(Request::Update(UpdateRequest { decided_id: 0 }))
    }

    #[test]
    fn test_first_write_wins() {
        let call = update_call();
        assert!(!call.is_done());

        assert!(call.write(Some(Response::Decide(DecideResponse))));
        assert!(!call.write(None));

        assert!(call.is_done());
        assert_eq!(call.take_response(), Some(Response::Decide(DecideResponse)));
    }

    #[tokio::test]
    async fn test_done_after_write() {
        let call = update_call();
        call.write(None);
        // must not hang when the write happened before waiting
        call.done().await;
        assert_eq!(call.take_response(), None);
    }

    #[tokio::test]
    async fn test_done_wakes_waiter() {
        let call = Arc::new(Call::new(Request::Decide(DecideRequest {
            from_id: 0,
            entries: vec![],
        })));
        let writer = Arc::clone(&call);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            writer.write(Some(Response::Decide(DecideResponse)));
        });

        call.done().await;
        assert!(call.take_response().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_then_cancel_on_deadline() {
        let call = Arc::new(update_call());
        let ctx = CancellationToken::new();
        let waiter = tokio::spawn(wait_then_cancel(Arc::clone(&call), ctx.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        waiter.await.unwrap();

        assert!(call.is_done());
        assert_eq!(call.take_response(), None);
        // a late answer is dropped
        assert!(!call.write(Some(Response::Decide(DecideResponse))));
    }

    #[tokio::test]
    async fn test_wait_then_cancel_leaves_answered_call() {
        let call = Arc::new(update_call());
        call.write(Some(Response::Decide(DecideResponse)));

        wait_then_cancel(Arc::clone(&call), CancellationToken::new()).await;
        assert_eq!(call.take_response(), Some(Response::Decide(DecideResponse)));
    }
}
