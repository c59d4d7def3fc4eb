// Paxos replicated log: one Node plays both the proposer and the acceptor role
pub mod acceptor;
pub mod batch;
pub mod call;
pub mod cluster;
pub mod log;
pub mod node;
pub mod proposer;
pub mod retry;
pub mod rpc;
pub mod snapshot;
pub mod state_machine;
pub mod transport;
