//! Log store seam consumed by the client request pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::server::{LogEntry, LogIndex};
use crate::utils::LodestoneError;

/// Durable log storage interface.
///
/// Slot indices start at 1 and are assigned contiguously by
/// `store_log_entry`. Implementations are free to buffer appends until
/// `end_of_append_batch` marks the batch boundary.
pub trait LogStore: Send + Sync {
    /// Stores one entry and returns its assigned slot index.
    fn store_log_entry(
        &self,
        entry: &LogEntry,
    ) -> Result<LogIndex, LodestoneError>;

    /// Signals that a batch of `count` entries starting at `first` has been
    /// fully appended (e.g. so the store may flush once per batch).
    fn end_of_append_batch(&self, first: LogIndex, count: u64);

    /// Next slot index to be assigned.
    fn next_slot(&self) -> LogIndex;

    /// Index of the last stored entry, or 0 if the log is empty.
    fn last_index(&self) -> LogIndex {
        self.next_slot() - 1
    }

    /// Reads the entry at the given slot, if present.
    fn entry_at(&self, index: LogIndex) -> Option<LogEntry>;

    /// Reads entries in `[lo, hi)`, clamped to what the log holds.
    fn entries_in_range(&self, lo: LogIndex, hi: LogIndex) -> Vec<LogEntry>;
}

/// Simple in-memory log store.
pub struct MemLogStore {
    /// Stored entries; slot index = vec position + 1.
    entries: Mutex<Vec<LogEntry>>,

    /// When set, the next `store_log_entry` call fails (and clears the flag).
    fail_next_store: AtomicBool,
}

impl MemLogStore {
    /// Creates an empty in-memory log.
    pub fn new() -> Self {
        MemLogStore {
            entries: Mutex::new(Vec::new()),
            fail_next_store: AtomicBool::new(false),
        }
    }

    /// Makes the next `store_log_entry` call fail. Intended for tests of the
    /// append failure path.
    pub fn fail_next_store(&self) {
        self.fail_next_store.store(true, Ordering::Release);
    }
}

impl Default for MemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemLogStore {
    fn store_log_entry(
        &self,
        entry: &LogEntry,
    ) -> Result<LogIndex, LodestoneError> {
        if self.fail_next_store.swap(false, Ordering::AcqRel) {
            return Err(LodestoneError::msg("injected log store failure"));
        }
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry.clone());
        Ok(entries.len() as LogIndex)
    }

    fn end_of_append_batch(&self, _first: LogIndex, _count: u64) {
        // nothing buffered in the in-memory store
    }

    fn next_slot(&self) -> LogIndex {
        self.entries.lock().unwrap().len() as LogIndex + 1
    }

    fn entry_at(&self, index: LogIndex) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries
            .lock()
            .unwrap()
            .get(index as usize - 1)
            .cloned()
    }

    fn entries_in_range(&self, lo: LogIndex, hi: LogIndex) -> Vec<LogEntry> {
        if lo == 0 || lo >= hi {
            return Vec::new();
        }
        let entries = self.entries.lock().unwrap();
        let hi = std::cmp::min(hi as usize - 1, entries.len());
        if lo as usize - 1 >= hi {
            return Vec::new();
        }
        entries[lo as usize - 1..hi].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(b: u8) -> LogEntry {
        LogEntry::app_data(vec![b])
    }

    #[test]
    fn indices_contiguous() -> Result<(), LodestoneError> {
        let store = MemLogStore::new();
        assert_eq!(store.next_slot(), 1);
        for i in 1..=5u8 {
            assert_eq!(store.store_log_entry(&entry(i))?, i as LogIndex);
        }
        store.end_of_append_batch(1, 5);
        assert_eq!(store.next_slot(), 6);
        assert_eq!(store.last_index(), 5);
        Ok(())
    }

    #[test]
    fn read_back_ranges() -> Result<(), LodestoneError> {
        let store = MemLogStore::new();
        for i in 1..=4u8 {
            store.store_log_entry(&entry(i))?;
        }
        assert_eq!(store.entry_at(3).unwrap().payload, vec![3]);
        assert!(store.entry_at(0).is_none());
        assert!(store.entry_at(9).is_none());
        let range = store.entries_in_range(2, 4);
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].payload, vec![2]);
        assert_eq!(range[1].payload, vec![3]);
        assert!(store.entries_in_range(4, 4).is_empty());
        assert_eq!(store.entries_in_range(3, 100).len(), 2);
        Ok(())
    }

    #[test]
    fn injected_failure_fires_once() {
        let store = MemLogStore::new();
        store.fail_next_store();
        assert!(store.store_log_entry(&entry(1)).is_err());
        assert!(store.store_log_entry(&entry(1)).is_ok());
        assert_eq!(store.next_slot(), 2);
    }
}
