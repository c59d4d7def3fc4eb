pub mod paxos;

pub use paxos::node::Node;
pub use paxos::state_machine::{KeyValueStore, StateMachine};
