use rlog_common::types::{Command, LogId};
use serde::{Deserialize, Serialize};

/// A node's window onto the replicated log.
///
/// `entries[i]` holds the command at `LogId = start_id + i`. Everything below
/// `decided_id` is committed; entries past it were accepted but not decided.
/// Entries below `start_id` have been compacted into the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub start_id: LogId,       // LogId of entries[0]
    pub decided_id: LogId,     // first LogId not yet decided
    pub entries: Vec<Command>, // decided prefix followed by accepted suffix
}

impl Value {
    /// One past the last LogId this window holds.
    pub fn end_id(&self) -> LogId {
        self.start_id + self.entries.len() as LogId
    }

    /// `start_id <= decided_id <= end_id`
    pub fn is_consistent(&self) -> bool {
        self.start_id <= self.decided_id && self.decided_id <= self.end_id()
    }

    /// Whether `from` is a position this window can serve a tail for.
    pub fn covers(&self, from: LogId) -> bool {
        self.start_id <= from && from <= self.end_id()
    }

    /// Copy of the decided prefix, dropping accepted-but-undecided entries.
    pub fn decided(&self) -> Value {
        Value {
            start_id: self.start_id,
            decided_id: self.decided_id,
            entries: self.entries[..self.decided_len()].to_vec(),
        }
    }

    /// Drops accepted-but-undecided entries in place.
    pub fn truncate_to_decided(&mut self) {
        let len = self.decided_len();
        self.entries.truncate(len);
    }

    pub fn append(&mut self, entries: &[Command]) {
        self.entries.extend_from_slice(entries);
    }

    /// Marks `entries`, which start at `decided_id`, as decided.
    ///
    /// The accepted suffix is kept as long as it agrees with `entries` and is
    /// dropped from the first disagreement on.
    pub fn decide(&mut self, entries: &[Command]) {
        let base = self.decided_len();
        let agreed = self.entries[base..]
            .iter()
            .zip(entries)
            .take_while(|(ours, decided)| ours == decided)
            .count();
        if agreed < entries.len() {
            self.entries.truncate(base + agreed);
            self.entries.extend_from_slice(&entries[agreed..]);
        }
        self.decided_id += entries.len() as LogId;
    }

    /// Entries from `from` to the end of the window; empty when `from` is not covered.
    pub fn tail(&self, from: LogId) -> &[Command] {
        if !self.covers(from) {
            return &[];
        }
        &self.entries[(from - self.start_id) as usize..]
    }

    /// Drops `block`-sized prefixes while the window holds more than
    /// `block * ratio` decided entries. Undecided entries are never dropped.
    /// Returns the `start_id` before compaction.
    pub fn compact(&mut self, block: LogId, ratio: LogId) -> LogId {
        let before = self.start_id;
        if block > 0 && ratio >= 2 {
            let limit = block.saturating_mul(ratio);
            while self.decided_len() as LogId > limit {
                self.start_id += block;
                self.entries.drain(..block as usize);
            }
        }
        before
    }

    fn decided_len(&self) -> usize {
        (self.decided_id.saturating_sub(self.start_id) as usize).min(self.entries.len())
    }
}
