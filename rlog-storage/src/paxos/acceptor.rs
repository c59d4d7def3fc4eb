//! Passive side of the protocol.
//!
//! The acceptor promises not to take part in older ballots, stores the value
//! of the newest ballot it accepted, applies decided entries to the state
//! machine and serves catch-up requests from lagging peers. All of it runs
//! under the node's acceptor lock, so handlers for concurrent inbound calls
//! are serialized with respect to each other.

use super::cluster::Compaction;
use super::log::Value;
use super::node::Node;
use super::rpc::{
    AcceptRequest, AcceptResponse, DecideRequest, DecideResponse, PrepareRequest, PrepareResponse,
    UpdateDecide, UpdateRequest, UpdateResponse,
};
use super::state_machine::StateMachine;
use rlog_common::error::Result;
use rlog_common::types::{Command, LogId, ProposalId};
use tracing::{debug, error, info};

/// Consensus state a node keeps as an acceptor.
///
/// Invariant: `accepted <= promised`, and `value` is always consistent.
#[derive(Debug)]
pub struct AcceptorState<S> {
    pub promised: ProposalId, // Highest ballot promised
    pub accepted: ProposalId, // Ballot of the undecided tail in `value`
    pub value: Value,         // Log window
    pub object: S,            // State machine with every decided entry applied
}

impl<S: StateMachine> AcceptorState<S> {
    pub fn new(object: S) -> Self {
        Self {
            promised: ProposalId::ZERO,
            accepted: ProposalId::ZERO,
            value: Value::default(),
            object,
        }
    }

    /// Replaces the undecided tail with `entries` accepted under `accepted`.
    pub fn accept_entries(&mut self, accepted: ProposalId, entries: &[Command]) {
        self.value.truncate_to_decided();
        self.value.append(entries);
        self.accepted = accepted;
    }

    /// Decides `entries` right after the current decided prefix, commits them
    /// to the state machine and compacts. Returns the `start_id` before compaction.
    ///
    /// Whatever part of the accepted tail agrees with `entries` and extends
    /// past them stays accepted under `accepted`.
    pub fn decide_and_compact(&mut self, entries: &[Command], compaction: Compaction) -> LogId {
        self.value.decide(entries);
        self.object.commit(entries);
        self.value.compact(compaction.block, compaction.ratio)
    }

    pub fn on_prepare(&mut self, req: &PrepareRequest) -> PrepareResponse {
        let mut response = PrepareResponse {
            promise: self.promised,
            accept_id: self.value.decided_id,
            success: false,
            accepted: ProposalId::ZERO,
            entries: Vec::new(),
        };

        // 1. Reject stale or duplicate ballots
        if req.proposal_id <= self.promised {
            return response;
        }
        self.promised = req.proposal_id;

        // 2. Report the accepted tail, unless the position was compacted away
        if self.value.covers(req.from_id) {
            response.success = true;
            response.accepted = self.accepted;
            response.entries = self.value.tail(req.from_id).to_vec();
        }
        response
    }

    pub fn on_accept(&mut self, req: &AcceptRequest) -> AcceptResponse {
        let mut response = AcceptResponse {
            promise: self.promised,
            accept_id: self.value.decided_id,
            success: false,
        };

        // 1. Reject ballots older than the promise
        if req.proposal_id < self.promised {
            return response;
        }
        self.promised = req.proposal_id;

        // 2. Our decided prefix must reach the request's starting point.
        //    Everything before our decided position is already identical.
        if let Some(offset) = self.value.decided_id.checked_sub(req.from_id) {
            let suffix = req.entries.get(offset as usize..).unwrap_or(&[]);
            self.accept_entries(req.proposal_id, suffix);
            response.success = true;
        }
        response
    }

    /// Returns how many entries were newly decided.
    pub fn on_decide(&mut self, req: &DecideRequest, compaction: Compaction) -> usize {
        let Some(offset) = self.value.decided_id.checked_sub(req.from_id) else {
            // gap between our decided prefix and the request
            return 0;
        };
        match req.entries.get(offset as usize..) {
            Some(entries) if !entries.is_empty() => {
                self.decide_and_compact(entries, compaction);
                entries.len()
            }
            _ => 0,
        }
    }

    pub fn on_update(&self, req: &UpdateRequest) -> Result<UpdateResponse> {
        if self.value.decided_id <= req.decided_id {
            return Ok(UpdateResponse::UpToDate);
        }
        if self.value.start_id > req.decided_id {
            return Ok(UpdateResponse::Restore(self.capture_snapshot()?));
        }
        let decided = self.value.decided();
        Ok(UpdateResponse::Decide(UpdateDecide {
            from_id: req.decided_id,
            entries: decided.tail(req.decided_id).to_vec(),
        }))
    }
}

impl<S: StateMachine> Node<S> {
    pub(crate) fn on_prepare(&self, req: &PrepareRequest) -> PrepareResponse {
        self.lock_acceptor(|acceptor| {
            let response = acceptor.on_prepare(req);
            debug!(
                node = %self.node_id(),
                proposal = %req.proposal_id,
                from_id = req.from_id,
                success = response.success,
                "handled prepare"
            );
            response
        })
    }

    pub(crate) fn on_accept(&self, req: &AcceptRequest) -> AcceptResponse {
        self.lock_acceptor(|acceptor| {
            let response = acceptor.on_accept(req);
            debug!(
                node = %self.node_id(),
                proposal = %req.proposal_id,
                from_id = req.from_id,
                entries = req.entries.len(),
                success = response.success,
                "handled accept"
            );
            response
        })
    }

    pub(crate) fn on_decide(&self, req: &DecideRequest) -> DecideResponse {
        let compaction = self.cluster().compaction;
        self.lock_acceptor(|acceptor| {
            let before = acceptor.value.start_id;
            let decided = acceptor.on_decide(req, compaction);
            if decided > 0 {
                info!(
                    node = %self.node_id(),
                    decided,
                    decided_id = acceptor.value.decided_id,
                    "decided entries"
                );
            }
            if acceptor.value.start_id > before {
                info!(
                    node = %self.node_id(),
                    from = before,
                    to = acceptor.value.start_id,
                    "compacted log"
                );
            }
        });
        DecideResponse
    }

    pub(crate) fn on_update(&self, req: &UpdateRequest) -> UpdateResponse {
        self.lock_acceptor(|acceptor| acceptor.on_update(req))
            .unwrap_or_else(|err| {
                error!(node = %self.node_id(), %err, "cannot snapshot state machine");
                UpdateResponse::UpToDate
            })
    }
}
