use crate::error::{Result, RlogError};
use crate::types::ClusterConfig;
use std::collections::HashSet;
use std::fs;

/// Loads a cluster configuration from a JSON file.
pub fn load_config(path: &str) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

impl ClusterConfig {
    /// Checks the invariants the consensus core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(RlogError::Config("cluster has no nodes".into()));
        }

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.node_id) {
                return Err(RlogError::Config(format!(
                    "duplicate node id {}",
                    node.node_id
                )));
            }
            if !addresses.insert(node.address()) {
                return Err(RlogError::Config(format!(
                    "duplicate address {}",
                    node.address()
                )));
            }
        }

        if self.compaction_block > 0 && self.compaction_ratio < 2 {
            return Err(RlogError::Config(format!(
                "compaction ratio must be at least 2, got {}",
                self.compaction_ratio
            )));
        }
        Ok(())
    }
}
