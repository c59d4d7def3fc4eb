//! Active side of the protocol.
//!
//! `propose` drives prepare, accept and decide rounds until the command is
//! part of a quorum-accepted value. `update` pulls decided entries, or a whole
//! snapshot, from peers that are ahead.
//!
//! Proposal rounds work on the *decided prefix* of the local log: the
//! proposer asks a quorum for anything accepted past it, keeps the tail with
//! the newest ballot, appends its command and asks the quorum to accept the
//! result. Decide messages are sent in the background; peers that miss them
//! heal through `update`.

use super::acceptor::AcceptorState;
use super::batch::batch_rpc;
use super::log::Value;
use super::node::Node;
use super::retry::RetryPolicy;
use super::rpc::{
    AcceptRequest, DecideRequest, PrepareRequest, Request, Response, UpdateRequest, UpdateResponse,
};
use super::snapshot::Snapshot;
use super::state_machine::StateMachine;
use rlog_common::error::{Result, RlogError};
use rlog_common::types::{Command, CounterId, LogId, NodeId, ProposalId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consensus state a node keeps as a proposer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposerState {
    pub counter_id: CounterId,                 // Last counter used, or seen from a peer
    pub accept_id_map: HashMap<NodeId, LogId>, // Last decided position each peer reported
}

impl ProposerState {
    /// Mints a ballot higher than any this node used or saw.
    pub fn next_proposal(&mut self, node_id: NodeId) -> ProposalId {
        self.counter_id += 1;
        ProposalId::new(self.counter_id, node_id)
    }

    /// Learns from the header every prepare/accept response carries.
    pub fn process_header(&mut self, peer: NodeId, promise: ProposalId, accept_id: LogId) {
        if self.counter_id < promise.counter() {
            self.counter_id = promise.counter();
        }
        self.accept_id_map.insert(peer, accept_id);
    }

    /// Where the value sent to `peer` should start, or `None` when the peer's
    /// position is outside `value`'s window and it must catch up on its own.
    pub fn from_id_for(&self, peer: NodeId, value: &Value) -> Option<LogId> {
        let from_id = self
            .accept_id_map
            .get(&peer)
            .copied()
            .unwrap_or(value.decided_id);
        value.covers(from_id).then_some(from_id)
    }
}

impl<S: StateMachine> Node<S> {
    /// Replicates `command`, retrying until it is accepted by a quorum or `ctx`
    /// is cancelled.
    ///
    /// Commands should be unique across calls: a command already present in a
    /// recovered tail is not appended again. Proposals on one node run one at
    /// a time.
    pub async fn propose<P>(
        &self,
        ctx: &CancellationToken,
        command: Command,
        retry: &mut P,
    ) -> Result<()>
    where
        P: RetryPolicy + ?Sized,
    {
        let mut proposer = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(RlogError::Cancelled),
            guard = self.proposer.lock() => guard,
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.propose_once(&mut proposer, ctx, &command).await {
                return Ok(());
            }

            let threshold = self.cluster().retry_until_update;
            if threshold > 0 && attempts >= threshold {
                // our log may be too old for any quorum to promise on
                self.update(ctx).await?;
            }

            let backoff = retry.next_backoff();
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(RlogError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn propose_once(
        &self,
        proposer: &mut ProposerState,
        ctx: &CancellationToken,
        command: &Command,
    ) -> bool {
        let mut decided = self.lock_acceptor(|acceptor| acceptor.value.decided());
        let proposal_id = proposer.next_proposal(self.node_id());

        // 1. Prepare
        let prepare = Request::Prepare(PrepareRequest {
            proposal_id,
            from_id: decided.decided_id,
        });
        let replies = tokio::select! {
            biased;
            _ = ctx.cancelled() => return false,
            replies = batch_rpc(
                self.router(),
                self.cluster(),
                ctx,
                |_| Some(prepare.clone()),
            ) => replies,
        };

        let mut promises = Vec::new();
        for (peer, reply) in replies {
            if let Some(Response::Prepare(response)) = reply {
                proposer.process_header(peer, response.promise, response.accept_id);
                if response.success {
                    promises.push(response);
                }
            }
        }
        if !self.cluster().is_quorum(promises.len()) {
            debug!(
                node = %self.node_id(),
                proposal = %proposal_id,
                promises = promises.len(),
                "prepare rejected"
            );
            return false;
        }
        info!(node = %self.node_id(), proposal = %proposal_id, %command, "prepare ok");

        // 2. Recover the newest accepted tail, then add the command once
        let mut addon = promises
            .into_iter()
            .max_by(|a, b| {
                a.accepted
                    .cmp(&b.accepted)
                    .then(a.entries.len().cmp(&b.entries.len()))
            })
            .map(|promise| promise.entries)
            .unwrap_or_default();
        if !addon.iter().any(|entry| entry == command) {
            addon.push(command.clone());
        }
        decided.append(&addon);
        decided.decided_id += addon.len() as LogId;

        // 3. Accept
        let replies = tokio::select! {
            biased;
            _ = ctx.cancelled() => return false,
            replies = batch_rpc(self.router(), self.cluster(), ctx, |peer| {
                let from_id = proposer.from_id_for(peer, &decided)?;
                Some(Request::Accept(AcceptRequest {
                    proposal_id,
                    from_id,
                    entries: decided.tail(from_id).to_vec(),
                }))
            }) => replies,
        };

        let mut accepted = 0;
        for (peer, reply) in replies {
            if let Some(Response::Accept(response)) = reply {
                proposer.process_header(peer, response.promise, response.accept_id);
                if response.success {
                    accepted += 1;
                }
            }
        }
        if !self.cluster().is_quorum(accepted) {
            debug!(
                node = %self.node_id(),
                proposal = %proposal_id,
                accepted,
                "accept rejected"
            );
            return false;
        }
        info!(
            node = %self.node_id(),
            proposal = %proposal_id,
            %command,
            next_id = decided.decided_id,
            entries = addon.len(),
            "accept ok"
        );

        // 4. Decide in the background
        let mut decides: HashMap<NodeId, Request> = self
            .cluster()
            .address_book
            .keys()
            .filter_map(|&peer| {
                let from_id = proposer.from_id_for(peer, &decided)?;
                let request = Request::Decide(DecideRequest {
                    from_id,
                    entries: decided.tail(from_id).to_vec(),
                });
                Some((peer, request))
            })
            .collect();
        tokio::spawn(batch_rpc(
            self.router(),
            self.cluster(),
            &CancellationToken::new(),
            move |peer| decides.remove(&peer),
        ));
        true
    }

    /// Pulls whatever peers decided beyond our decided position.
    pub async fn update(&self, ctx: &CancellationToken) -> Result<()> {
        let request = Request::Update(UpdateRequest {
            decided_id: self.decided_id(),
        });
        let replies = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(RlogError::Cancelled),
            replies = batch_rpc(
                self.router(),
                self.cluster(),
                ctx,
                |_| Some(request.clone()),
            ) => replies,
        };

        for (peer, reply) in replies {
            match reply {
                Some(Response::Update(UpdateResponse::Decide(decide))) => {
                    // replayed through the same path inbound decisions take
                    self.on_decide(&DecideRequest {
                        from_id: decide.from_id,
                        entries: decide.entries,
                    });
                }
                Some(Response::Update(UpdateResponse::Restore(snapshot))) => {
                    self.lock_acceptor(|acceptor| self.restore_from(acceptor, peer, snapshot));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn restore_from(&self, acceptor: &mut AcceptorState<S>, peer: NodeId, snapshot: Snapshot) {
        let (start_id, decided_id) = (acceptor.value.start_id, acceptor.value.decided_id);
        match acceptor.install_snapshot(snapshot) {
            Ok(true) => info!(
                node = %self.node_id(),
                %peer,
                start_id = %format!("{} -> {}", start_id, acceptor.value.start_id),
                decided_id = %format!("{} -> {}", decided_id, acceptor.value.decided_id),
                "installed snapshot"
            ),
            Ok(false) => {}
            Err(err) => warn!(node = %self.node_id(), %peer, %err, "cannot install snapshot"),
        }
    }
}
