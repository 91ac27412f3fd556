//! The replicated log.
//!
//! A [`Log`] holds a contiguous run of entries `base+1 ..= last_op`. Entries
//! at or below `base` have been folded into a snapshot and pruned. A fresh log
//! has `base == 0` and no entries.

use serde::{Deserialize, Serialize};

use crate::types::{Command, LogEntry, OpNumber};

/// A contiguous, possibly compacted, run of log entries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Log {
    base: OpNumber,
    entries: Vec<LogEntry>,
}

/// Result of [`Log::suffix`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suffix {
    pub log: Log,

    /// True if `from` predates the retained entries: the receiver also needs
    /// the snapshot covering `log.base()`.
    pub needs_snapshot: bool,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty log whose entries up to `base` live in a snapshot.
    pub fn with_base(base: OpNumber) -> Self {
        Self {
            base,
            entries: Vec::new(),
        }
    }

    pub fn base(&self) -> OpNumber {
        self.base
    }

    /// Highest op number in the log, or `base` if no entries are retained.
    pub fn last_op(&self) -> OpNumber {
        self.entries.last().map_or(self.base, |e| e.op_number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Appends an entry at `last_op + 1`.
    ///
    /// Re-adding an entry that is already present is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the entry would leave a gap, or if it conflicts with a
    /// retained entry at the same op number.
    pub fn add(&mut self, entry: LogEntry) {
        let next = self.last_op().next();
        assert!(
            entry.op_number <= next,
            "log gap: appending {} after {}",
            entry.op_number,
            self.last_op()
        );

        if entry.op_number < next {
            if let Some(existing) = self.get(entry.op_number) {
                assert!(
                    existing.view == entry.view && existing.command == entry.command,
                    "conflicting entry at {}",
                    entry.op_number
                );
            }
            return;
        }

        self.entries.push(entry);
    }

    /// Returns the entry at `op`, if retained.
    pub fn get(&self, op: OpNumber) -> Option<&LogEntry> {
        if !self.has_entry(op) {
            return None;
        }
        let index = self.base.distance_to(op) as usize - 1;
        let entry = self.entries.get(index);
        debug_assert!(entry.is_none_or(|e| e.op_number == op));
        entry
    }

    /// Returns the command at `op`, if retained.
    pub fn command(&self, op: OpNumber) -> Option<&Command> {
        self.get(op).map(|e| &e.command)
    }

    /// True if `op` is retained: above the compaction base and at most `last_op`.
    pub fn has_entry(&self, op: OpNumber) -> bool {
        op > self.base && op <= self.last_op()
    }

    /// Entries after `from`.
    ///
    /// If `from` predates the base, the whole retained log is returned with
    /// `needs_snapshot` set.
    pub fn suffix(&self, from: OpNumber) -> Suffix {
        if from < self.base {
            return Suffix {
                log: self.clone(),
                needs_snapshot: true,
            };
        }

        let from = from.min(self.last_op());
        let skip = self.base.distance_to(from) as usize;
        Suffix {
            log: Log {
                base: from,
                entries: self.entries[skip..].to_vec(),
            },
            needs_snapshot: false,
        }
    }

    /// Removes every entry above `op`.
    pub fn truncate_after(&mut self, op: OpNumber) {
        if op <= self.base {
            self.entries.clear();
            return;
        }
        let keep = self.base.distance_to(op) as usize;
        self.entries.truncate(keep);
    }

    /// Prunes every entry at or below `op` and moves the base up to it.
    ///
    /// Pruning beyond `last_op` leaves an empty log based at `op`.
    pub fn truncate_through(&mut self, op: OpNumber) {
        if op <= self.base {
            return;
        }
        let drop = (self.base.distance_to(op) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.base = op;
    }

    /// Deterministic digest of the retained entries at or below `through`.
    ///
    /// Two replicas that compacted at the same op produce the same digest
    /// exactly when their logs agree.
    pub fn content_hash(&self, through: OpNumber) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.base.as_u64().to_le_bytes());
        for entry in self.entries.iter().take_while(|e| e.op_number <= through) {
            hasher.update(&entry.op_number.as_u64().to_le_bytes());
            hasher.update(&entry.view.as_u64().to_le_bytes());
            match entry.command.session {
                Some(session) => {
                    hasher.update(&[1]);
                    hasher.update(&session.client_id.as_u64().to_le_bytes());
                    hasher.update(&session.request_number.to_le_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
            hasher.update(&(entry.command.payload.len() as u64).to_le_bytes());
            hasher.update(&entry.command.payload);
        }
        *hasher.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ViewNumber;
    use proptest::prelude::*;

    fn entry(op: u64, view: u64) -> LogEntry {
        LogEntry::new(
            OpNumber::new(op),
            ViewNumber::new(view),
            Command::new(format!("cmd-{op}")),
        )
    }

    fn log_of(n: u64) -> Log {
        let mut log = Log::new();
        for op in 1..=n {
            log.add(entry(op, 0));
        }
        log
    }

    #[test]
    fn add_and_get() {
        let log = log_of(3);
        assert_eq!(log.last_op(), OpNumber::new(3));
        assert_eq!(log.get(OpNumber::new(2)), Some(&entry(2, 0)));
        assert_eq!(log.get(OpNumber::new(4)), None);
        assert_eq!(log.get(OpNumber::ZERO), None);
    }

    #[test]
    fn add_is_idempotent() {
        let mut log = log_of(3);
        log.add(entry(2, 0));
        assert_eq!(log.len(), 3);
    }

    #[test]
    #[should_panic(expected = "log gap")]
    fn add_rejects_gaps() {
        let mut log = log_of(1);
        log.add(entry(3, 0));
    }

    #[test]
    #[should_panic(expected = "conflicting entry")]
    fn add_rejects_conflicts() {
        let mut log = log_of(2);
        log.add(entry(2, 1));
    }

    #[test]
    fn has_entry_respects_compaction() {
        let mut log = log_of(5);
        log.truncate_through(OpNumber::new(3));

        assert!(!log.has_entry(OpNumber::new(3)));
        assert!(log.has_entry(OpNumber::new(4)));
        assert_eq!(log.get(OpNumber::new(5)), Some(&entry(5, 0)));
        assert_eq!(log.base(), OpNumber::new(3));
        assert_eq!(log.last_op(), OpNumber::new(5));
    }

    #[test]
    fn suffix_before_base_needs_snapshot() {
        let mut log = log_of(5);
        log.truncate_through(OpNumber::new(2));

        let suffix = log.suffix(OpNumber::new(1));
        assert!(suffix.needs_snapshot);
        assert_eq!(suffix.log.base(), OpNumber::new(2));
        assert_eq!(suffix.log.len(), 3);

        let suffix = log.suffix(OpNumber::new(4));
        assert!(!suffix.needs_snapshot);
        assert_eq!(suffix.log.base(), OpNumber::new(4));
        assert_eq!(suffix.log.entries(), &[entry(5, 0)]);
    }

    #[test]
    fn suffix_past_end_is_empty() {
        let log = log_of(2);
        let suffix = log.suffix(OpNumber::new(9));
        assert!(suffix.log.is_empty());
        assert_eq!(suffix.log.last_op(), OpNumber::new(2));
    }

    #[test]
    fn truncate_through_past_end_rebases() {
        let mut log = log_of(2);
        log.truncate_through(OpNumber::new(7));
        assert!(log.is_empty());
        assert_eq!(log.last_op(), OpNumber::new(7));
    }

    #[test]
    fn truncate_after_drops_tail() {
        let mut log = log_of(5);
        log.truncate_after(OpNumber::new(3));
        assert_eq!(log.last_op(), OpNumber::new(3));
        log.add(entry(4, 2));
        assert_eq!(log.get(OpNumber::new(4)).map(|e| e.view), Some(ViewNumber::new(2)));
    }

    #[test]
    fn hash_distinguishes_views() {
        let a = log_of(2);
        let mut b = log_of(1);
        b.add(entry(2, 1));
        assert_ne!(a.content_hash(OpNumber::new(2)), b.content_hash(OpNumber::new(2)));
        assert_eq!(a.content_hash(OpNumber::new(1)), b.content_hash(OpNumber::new(1)));
    }

    proptest! {
        #[test]
        fn prop_suffix_rejoins_prefix(n in 0u64..40, from in 0u64..50) {
            let log = log_of(n);
            let suffix = log.suffix(OpNumber::new(from));
            prop_assert!(!suffix.needs_snapshot);

            let mut rebuilt = log.clone();
            rebuilt.truncate_after(suffix.log.base());
            for e in suffix.log.entries() {
                rebuilt.add(e.clone());
            }
            prop_assert_eq!(rebuilt, log);
        }

        #[test]
        fn prop_hash_ignores_entries_past_through(n in 1u64..30, extra in 1u64..10) {
            let short = log_of(n);
            let long = log_of(n + extra);
            prop_assert_eq!(
                short.content_hash(OpNumber::new(n)),
                long.content_hash(OpNumber::new(n))
            );
        }
    }
}
