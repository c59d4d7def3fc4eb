use rlog_common::error::{Result, RlogError};
use rlog_common::types::Command;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

/// Deterministic application state driven by the replicated log.
/// Given the same command sequence, every replica must end in the same state.
pub trait StateMachine: Send + 'static {
    /// Applies newly decided commands, in log order
    fn commit(&mut self, commands: &[Command]);

    /// Produces a binary snapshot of the current state
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the current state wholesale with a snapshot
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}

//
// Sample implementation: versioned in-memory key-value store
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KvOperation {
    Set,
    Del,
}

/// A key-value mutation as it travels through the log (JSON text)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvCommand {
    pub uuid: Uuid,             // Lets the proposer watch for the outcome
    pub operation: KvOperation,
    pub key: String,
    pub version: u64,           // Must exceed the stored version to apply
    pub value: String,
}

impl KvCommand {
    pub fn set(key: impl Into<String>, version: u64, value: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            operation: KvOperation::Set,
            key: key.into(),
            version,
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>, version: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            operation: KvOperation::Del,
            key: key.into(),
            version,
            value: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Command> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(command: &str) -> Result<Self> {
        Ok(serde_json::from_str(command)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvEntry {
    pub version: u64,
    pub value: String,
}

/// In-memory key-value store with optimistic versioning.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: BTreeMap<String, KvEntry>,
    watchers: HashMap<Uuid, oneshot::Sender<bool>>,
}

impl KeyValueStore {
    pub fn get(&self, key: &str) -> Option<KvEntry> {
        self.data.get(key).cloned()
    }

    pub fn entries(&self) -> BTreeMap<String, KvEntry> {
        self.data.clone()
    }

    /// Resolves with whether the command carrying `uuid` applied, once it commits here.
    pub fn watch(&mut self, uuid: Uuid) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.watchers.insert(uuid, tx);
        rx
    }

    pub fn unwatch(&mut self, uuid: &Uuid) {
        self.watchers.remove(uuid);
    }

    fn apply(&mut self, command: KvCommand) -> bool {
        let current = self.data.get(&command.key).map(|e| e.version).unwrap_or(0);
        let consistent = command.version > current;
        if consistent {
            match command.operation {
                KvOperation::Set => {
                    self.data.insert(
                        command.key,
                        KvEntry {
                            version: command.version,
                            value: command.value,
                        },
                    );
                }
                KvOperation::Del => {
                    self.data.remove(&command.key);
                }
            }
        }
        consistent
    }
}

impl StateMachine for KeyValueStore {
    fn commit(&mut self, commands: &[Command]) {
        for raw in commands {
            let command = match KvCommand::decode(raw) {
                Ok(command) => command,
                Err(err) => {
                    warn!(%err, "skipping undecodable command");
                    continue;
                }
            };
            let watcher = self.watchers.remove(&command.uuid);
            let consistent = self.apply(command);
            if let Some(tx) = watcher {
                // receiver may have given up
                let _ = tx.send(consistent);
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.data).map_err(|e| RlogError::Snapshot(e.to_string()))
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        self.data =
            serde_json::from_slice(snapshot).map_err(|e| RlogError::Snapshot(e.to_string()))?;
        Ok(())
    }
}

//
// Tests
//
#[cfg(test)]
mod tests {
    use super::*;

    fn commit(kv: &mut KeyValueStore, command: &KvCommand) {
        kv.commit(&[command.encode().unwrap()]);
    }

    #[test]
    fn test_set_get_delete() {
        let mut kv = KeyValueStore::default();

        // Set a value
        commit(&mut kv, &KvCommand::set("foo", 1, "bar"));
        assert_eq!(kv.get("foo").unwrap().value, "bar");

        // Delete it
        commit(&mut kv, &KvCommand::delete("foo", 2));

        // Ensure it's gone
        assert_eq!(kv.get("foo"), None);
    }

    #[test]
    fn test_stale_version_is_ignored() {
        let mut kv = KeyValueStore::default();
        commit(&mut kv, &KvCommand::set("k", 2, "two"));
        commit(&mut kv, &KvCommand::set("k", 2, "again"));
        commit(&mut kv, &KvCommand::set("k", 1, "older"));

        assert_eq!(
            kv.get("k"),
            Some(KvEntry {
                version: 2,
                value: "two".into()
            })
        );
    }

    #[test]
    fn test_garbage_command_is_skipped() {
        let mut kv = KeyValueStore::default();
        let good = KvCommand::set("a", 1, "x").encode().unwrap();
        kv.commit(&["not json".to_string(), good]);
        assert_eq!(kv.entries().len(), 1);
    }

    #[test]
    fn test_watch_reports_outcome() {
        let mut kv = KeyValueStore::default();
        let first = KvCommand::set("w", 1, "v1");
        let stale = KvCommand::set("w", 1, "v1-again");

        let mut first_rx = kv.watch(first.uuid);
        let mut stale_rx = kv.watch(stale.uuid);
        commit(&mut kv, &first);
        commit(&mut kv, &stale);

        assert_eq!(first_rx.try_recv(), Ok(true));
        assert_eq!(stale_rx.try_recv(), Ok(false));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut kv = KeyValueStore::default();
        commit(&mut kv, &KvCommand::set("alpha", 1, "beta"));

        let snap = kv.snapshot().unwrap();

        let mut restored = KeyValueStore::default();
        restored.restore(&snap).unwrap();

        assert_eq!(restored.entries(), kv.entries());
        assert!(restored.restore(b"{broken").is_err());
    }
}
