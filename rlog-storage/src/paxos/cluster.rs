use rlog_common::types::{Address, ClusterConfig, LogId, NodeId};
use std::collections::BTreeMap;
use std::time::Duration;

/// Log compaction policy: once the window holds more than `block * ratio`
/// entries, whole blocks of `block` entries are folded away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Compaction {
    pub block: LogId,
    pub ratio: LogId,
}

/// Static per-node view of the cluster, fixed for the node's lifetime.
#[derive(Debug, Clone)]
pub struct ClusterState {
    pub address_book: BTreeMap<NodeId, Address>, // Every member, this node included
    pub rpc_timeout: Duration,                   // Zero waits forever
    pub compaction: Compaction,
    pub retry_until_update: u32,                 // Failed attempts before Propose pulls updates
}

impl ClusterState {
    pub fn len(&self) -> usize {
        self.address_book.len()
    }

    pub fn is_empty(&self) -> bool {
        self.address_book.is_empty()
    }

    /// Strict majority of the address book.
    pub fn is_quorum(&self, successes: usize) -> bool {
        successes > self.address_book.len() / 2
    }
}

impl From<&ClusterConfig> for ClusterState {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            address_book: config
                .nodes
                .iter()
                .map(|node| (node.node_id, node.address()))
                .collect(),
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
            compaction: Compaction {
                block: config.compaction_block,
                ratio: config.compaction_ratio,
            },
            retry_until_update: config.retry_until_update,
        }
    }
}
