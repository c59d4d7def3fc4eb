use super::acceptor::AcceptorState;
use super::call::{Call, Handler, Router};
use super::cluster::ClusterState;
use super::log::Value;
use super::proposer::ProposerState;
use super::rpc::{Request, Response};
use super::state_machine::StateMachine;
use parking_lot::Mutex;
use rlog_common::types::{LogId, NodeId, ProposalId};
use std::sync::Arc;

/// One member of the replicated log, acting as both proposer and acceptor.
///
/// Inbound calls reach the node through its [`Handler`] impl and may arrive
/// concurrently; acceptor state is only touched under one lock. Proposals
/// from this node run one at a time.
pub struct Node<S> {
    node_id: NodeId,
    router: Arc<dyn Router>,
    cluster: ClusterState,
    acceptor: Mutex<AcceptorState<S>>,
    pub(super) proposer: tokio::sync::Mutex<ProposerState>,
}

impl<S: StateMachine> Node<S> {
    /// Create a node with an empty log around `object`
    pub fn new(node_id: NodeId, router: Arc<dyn Router>, cluster: ClusterState, object: S) -> Self {
        Self {
            node_id,
            router,
            cluster,
            acceptor: Mutex::new(AcceptorState::new(object)),
            proposer: tokio::sync::Mutex::new(ProposerState::default()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    pub(crate) fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Runs `f` inside the acceptor critical section.
    pub(crate) fn lock_acceptor<R>(&self, f: impl FnOnce(&mut AcceptorState<S>) -> R) -> R {
        let mut acceptor = self.acceptor.lock();
        f(&mut acceptor)
    }

    /// Read-only look at the acceptor state.
    pub fn inspect<R>(&self, f: impl FnOnce(&AcceptorState<S>) -> R) -> R {
        let acceptor = self.acceptor.lock();
        f(&acceptor)
    }

    /// Access to the replicated state machine, e.g. for reads or watches.
    pub fn with_state_machine<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        self.lock_acceptor(|acceptor| f(&mut acceptor.object))
    }

    pub fn decided_id(&self) -> LogId {
        self.inspect(|acceptor| acceptor.value.decided_id)
    }

    pub fn start_id(&self) -> LogId {
        self.inspect(|acceptor| acceptor.value.start_id)
    }

    pub fn promised(&self) -> ProposalId {
        self.inspect(|acceptor| acceptor.promised)
    }

    /// Copy of the current log window.
    pub fn value(&self) -> Value {
        self.inspect(|acceptor| acceptor.value.clone())
    }
}

impl<S: StateMachine> Handler for Node<S> {
    fn handle(&self, call: &Call) {
        let response = match call.request() {
            Request::Prepare(req) => Response::Prepare(self.on_prepare(req)),
            Request::Accept(req) => Response::Accept(self.on_accept(req)),
            Request::Decide(req) => Response::Decide(self.on_decide(req)),
            Request::Update(req) => Response::Update(self.on_update(req)),
        };
        call.write(Some(response));
    }
}

//
// Unit Tests
//
#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::rpc::{
        AcceptRequest, DecideRequest, PrepareRequest, UpdateRequest, UpdateResponse,
    };
    use crate::paxos::state_machine::{KeyValueStore, KvCommand};
    use async_trait::async_trait;
    use rlog_common::types::{Address, ClusterConfig};

    struct Unreachable;

    #[async_trait]
    impl Router for Unreachable {
        async fn route(&self, _address: &Address, call: Arc<Call>) {
            call.write(None);
        }
    }

    fn test_node() -> Node<KeyValueStore> {
        Node::new(
            NodeId(0),
            Arc::new(Unreachable),
            ClusterState::from(&ClusterConfig::local(3)),
            KeyValueStore::default(),
        )
    }

    fn serve(node: &Node<KeyValueStore>, request: Request) -> Response {
        let call = Call::new(request);
        node.handle(&call);
        call.take_response().unwrap()
    }

    #[test]
    fn test_handle_dispatches_each_kind() {
        let node = test_node();
        let pid = ProposalId::new(1, NodeId(1));
        let command = KvCommand::set("key", 1, "value").encode().unwrap();

        let prepare = serve(
            &node,
            Request::Prepare(PrepareRequest {
                proposal_id: pid,
                from_id: 0,
            }),
        );
        assert!(matches!(prepare, Response::Prepare(ref r) if r.success));

        let accept = serve(
            &node,
            Request::Accept(AcceptRequest {
                proposal_id: pid,
                from_id: 0,
                entries: vec![command.clone()],
            }),
        );
        assert!(matches!(accept, Response::Accept(ref r) if r.success));
        assert_eq!(node.decided_id(), 0);

        let decide = serve(
            &node,
            Request::Decide(DecideRequest {
                from_id: 0,
                entries: vec![command],
            }),
        );
        assert!(matches!(decide, Response::Decide(_)));
        assert_eq!(node.decided_id(), 1);
        assert_eq!(node.with_state_machine(|kv| kv.get("key")).unwrap().value, "value");

        let update = serve(&node, Request::Update(UpdateRequest { decided_id: 1 }));
        assert_eq!(update, Response::Update(UpdateResponse::UpToDate));
    }

    #[test]
    fn test_promised_never_decreases() {
        let node = test_node();
        let ballots = [3u64, 1, 5, 2, 5, 4];
        let mut last = ProposalId::ZERO;
        for (i, counter) in ballots.into_iter().enumerate() {
            let pid = ProposalId::new(counter, NodeId((i % 3) as u8));
            let request = if i % 2 == 0 {
                Request::Prepare(PrepareRequest {
                    proposal_id: pid,
                    from_id: 0,
                })
            } else {
                Request::Accept(AcceptRequest {
                    proposal_id: pid,
                    from_id: 0,
                    entries: vec![],
                })
            };
            serve(&node, request);
            assert!(node.promised() >= last);
            last = node.promised();
        }
        assert_eq!(last.counter(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_propose_without_quorum_is_cancelled() {
        let node = test_node();
        let ctx = tokio_util::sync::CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let mut retry = || std::time::Duration::from_millis(10);
        let result = node.propose(&ctx, "lonely".into(), &mut retry).await;

        assert!(matches!(result, Err(rlog_common::error::RlogError::Cancelled)));
        assert_eq!(node.decided_id(), 0);
    }
}
