use super::acceptor::AcceptorState;
use super::log::Value;
use super::state_machine::StateMachine;
use rlog_common::error::Result;
use rlog_common::types::{Command, LogId};
use serde::{Deserialize, Serialize};

/// Whole-state transfer for a peer that fell behind the compaction point.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: Vec<u8>,        // Serialized state machine, all decided commands applied
    pub start_id: LogId,       // Sender's compaction point
    pub decided_id: LogId,     // Sender's decided position
    pub entries: Vec<Command>, // Sender's decided entries from start_id
}

impl<S: StateMachine> AcceptorState<S> {
    /// Captures the decided part of this node's state.
    pub fn capture_snapshot(&self) -> Result<Snapshot> {
        let decided = self.value.decided();
        Ok(Snapshot {
            state: self.object.snapshot()?,
            start_id: decided.start_id,
            decided_id: decided.decided_id,
            entries: decided.entries,
        })
    }

    /// Replaces the local log window and state machine with `snapshot` when it
    /// is strictly ahead. Returns whether it was installed.
    ///
    /// On a restore failure nothing changes.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<bool> {
        if snapshot.decided_id <= self.value.decided_id {
            return Ok(false);
        }
        self.object.restore(&snapshot.state)?;
        let carried = self.accepted_beyond(&snapshot);
        self.value = Value {
            start_id: snapshot.start_id,
            decided_id: snapshot.decided_id,
            entries: snapshot.entries,
        };
        self.value.append(&carried);
        Ok(true)
    }

    /// Our accepted entries past `snapshot.decided_id`, provided every position
    /// both windows hold agrees with the snapshot; empty otherwise.
    fn accepted_beyond(&self, snapshot: &Snapshot) -> Vec<Command> {
        let value = &self.value;
        if value.end_id() <= snapshot.decided_id {
            return Vec::new();
        }
        let from = value.decided_id.max(snapshot.start_id);
        let agrees = (from..snapshot.decided_id).all(|id| {
            let ours = value.entries.get((id - value.start_id) as usize);
            let theirs = snapshot.entries.get((id - snapshot.start_id) as usize);
            ours.is_some() && ours == theirs
        });
        if !agrees {
            return Vec::new();
        }
        value.tail(snapshot.decided_id).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::state_machine::{KeyValueStore, KvCommand};
    use rlog_common::types::{NodeId, ProposalId};

    fn store_with(commands: &[KvCommand]) -> (KeyValueStore, Vec<Command>) {
        let encoded: Vec<Command> = commands.iter().map(|c| c.encode().unwrap()).collect();
        let mut kv = KeyValueStore::default();
        kv.commit(&encoded);
        (kv, encoded)
    }

    #[test]
    fn test_capture_excludes_undecided_entries() {
        let (kv, encoded) =
            store_with(&[KvCommand::set("a", 1, "x"), KvCommand::set("b", 1, "y")]);
        let mut state = AcceptorState::new(kv);
        state.value = Value {
            start_id: 0,
            decided_id: 2,
            entries: encoded,
        };
        state.value.append(&["accepted-only".to_string()]);

        let snapshot = state.capture_snapshot().unwrap();
        assert_eq!(snapshot.decided_id, 2);
        assert_eq!(snapshot.entries.len(), 2);
    }

    #[test]
    fn test_install_replaces_state() {
        let (kv, encoded) = store_with(&[
            KvCommand::set("a", 1, "x"),
            KvCommand::set("b", 1, "y"),
            KvCommand::set("c", 1, "z"),
        ]);
        let mut source = AcceptorState::new(kv);
        source.value = Value {
            start_id: 2,
            decided_id: 3,
            entries: encoded[2..].to_vec(),
        };
        let snapshot = source.capture_snapshot().unwrap();

        let mut target = AcceptorState::new(KeyValueStore::default());
        assert!(target.install_snapshot(snapshot.clone()).unwrap());
        assert_eq!(target.value, source.value);
        assert_eq!(target.object.entries(), source.object.entries());

        // a second install of the same snapshot is not ahead anymore
        assert!(!target.install_snapshot(snapshot).unwrap());
    }

    /// A node that decided `e0` and accepted `tail` past it.
    fn lagging(e0: &Command, tail: &[Command]) -> AcceptorState<KeyValueStore> {
        let mut kv = KeyValueStore::default();
        kv.commit(std::slice::from_ref(e0));
        let mut state = AcceptorState::new(kv);
        state.value = Value {
            start_id: 0,
            decided_id: 1,
            entries: vec![e0.clone()],
        };
        state.accept_entries(ProposalId::new(4, NodeId(1)), tail);
        state
    }

    #[test]
    fn test_install_keeps_agreeing_accepted_tail() {
        let (kv, encoded) = store_with(&[
            KvCommand::set("a", 1, "x"),
            KvCommand::set("b", 1, "y"),
            KvCommand::set("c", 1, "z"),
        ]);
        let mut source = AcceptorState::new(kv);
        source.value = Value {
            start_id: 0,
            decided_id: 2,
            entries: encoded[..2].to_vec(),
        };
        let snapshot = source.capture_snapshot().unwrap();

        let mut target = lagging(&encoded[0], &encoded[1..]);
        assert!(target.install_snapshot(snapshot.clone()).unwrap());
        assert_eq!(target.value.decided_id, 2);
        assert_eq!(target.value.tail(2), &encoded[2..]);
        assert_eq!(target.accepted, ProposalId::new(4, NodeId(1)));

        // a tail that disagrees with the decided entries is dropped
        let conflicting = KvCommand::set("b", 1, "other").encode().unwrap();
        let mut target = lagging(&encoded[0], &[conflicting, encoded[2].clone()]);
        assert!(target.install_snapshot(snapshot).unwrap());
        assert_eq!(target.value, source.value);
    }

    #[test]
    fn test_failed_restore_leaves_state() {
        let mut target = AcceptorState::new(KeyValueStore::default());
        let snapshot = Snapshot {
            state: b"not json".to_vec(),
            start_id: 4,
            decided_id: 6,
            entries: vec!["e".into(), "f".into()],
        };

        assert!(target.install_snapshot(snapshot).is_err());
        assert_eq!(target.value, Value::default());
    }
}
