use super::snapshot::Snapshot;
use rlog_common::error::Result;
use rlog_common::types::{Command, LogId, ProposalId};
use serde::{Deserialize, Serialize};

/// Phase 1: proposer asks for a promise and for everything accepted past `from_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub proposal_id: ProposalId, // Ballot being prepared
    pub from_id: LogId,          // Proposer's decided position
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub promise: ProposalId,   // Acceptor's promise when the request arrived
    pub accept_id: LogId,      // Acceptor's decided position
    pub success: bool,         // True if the promise was granted
    pub accepted: ProposalId,  // Ballot of the acceptor's accepted tail, if success
    pub entries: Vec<Command>, // Acceptor's tail from `from_id`, if success
}

/// Phase 2: proposer asks acceptors to store the value from `from_id` on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub proposal_id: ProposalId,
    pub from_id: LogId,
    pub entries: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub promise: ProposalId,
    pub accept_id: LogId,
    pub success: bool,
}

/// Phase 3: fire-and-forget commit notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideRequest {
    pub from_id: LogId,
    pub entries: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideResponse;

/// Catch-up: "I have decided everything below `decided_id`"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub decided_id: LogId,
}

/// Replay of decided entries the asker is missing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDecide {
    pub from_id: LogId,
    pub entries: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateResponse {
    /// The asker already knows everything this node has decided.
    UpToDate,
    /// The asker is behind but still inside this node's log window.
    Decide(UpdateDecide),
    /// The asker is behind this node's compaction point.
    Restore(Snapshot),
}

/// Every request a node serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Prepare(PrepareRequest),
    Accept(AcceptRequest),
    Decide(DecideRequest),
    Update(UpdateRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Prepare(PrepareResponse),
    Accept(AcceptResponse),
    Decide(DecideResponse),
    Update(UpdateResponse),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Prepare(_) => "prepare",
            Request::Accept(_) => "accept",
            Request::Decide(_) => "decide",
            Request::Update(_) => "update",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
