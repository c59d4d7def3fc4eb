use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport-level address of a cluster member (e.g. `"127.0.0.1:7000"`).
pub type Address = String;

/// Opaque application mutation carried by the log.
pub type Command = String;

/// Position in the replicated log.
pub type LogId = u64;

/// Per-node proposal counter, the high bits of a [`ProposalId`].
pub type CounterId = u64;

/// Cluster member identity. One byte, so a cluster holds at most 256 nodes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u8);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// Ballot number, `(counter << 8) | node`.
///
/// Comparing two ids compares counters first and breaks ties by node id, which
/// gives a total order across the cluster as long as node ids are unique.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProposalId(pub u64);

impl ProposalId {
    /// No proposal seen yet.
    pub const ZERO: Self = Self(0);

    pub const fn new(counter: CounterId, node: NodeId) -> Self {
        Self((counter << 8) | node.0 as u64)
    }

    pub const fn counter(self) -> CounterId {
        self.0 >> 8
    }

    pub const fn node(self) -> NodeId {
        NodeId((self.0 & 0xff) as u8)
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proposal({}.{})", self.counter(), self.node().0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

impl NodeAddress {
    pub fn address(&self) -> Address {
        format!("{}:{}", self.host, self.port)
    }
}

/// Static cluster description as read from a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    pub rpc_timeout_ms: u64,      // 0 = wait forever
    pub compaction_block: u64,    // entries dropped per compaction step, 0 = off
    pub compaction_ratio: u64,    // keep at most block * ratio entries
    pub retry_until_update: u32,  // failed proposals before pulling updates, 0 = never
}

impl ClusterConfig {
    /// An `n`-node loopback cluster on consecutive ports starting at 7000.
    pub fn local(n: u8) -> Self {
        Self {
            nodes: (0..n)
                .map(|i| NodeAddress {
                    host: "127.0.0.1".into(),
                    port: 7000 + i as u16,
                    node_id: NodeId(i),
                })
                .collect(),
            rpc_timeout_ms: 50,
            compaction_block: 64,
            compaction_ratio: 4,
            retry_until_update: 2,
        }
    }
}
