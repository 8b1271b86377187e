use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::{DeltaChange, DeltaEntry, DeltaKey};
use crate::types::{Datum, Timestamp};

/// Per-DiskRowSet in-memory delta buffer: updates, deletes and reinserts
/// against already-flushed rows, ordered by `(ordinal, ts, seq)`.
///
/// One writer (the serial applier) mutates it; readers take a short read lock
/// to copy out the slice they overlay on a scan. Flushing serializes the
/// whole map into a redo delta file and swaps in an empty store.
pub struct DeltaMemStore {
    entries: RwLock<BTreeMap<DeltaKey, DeltaChange>>,
    size: AtomicUsize,
}

impl DeltaMemStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
        }
    }

    pub fn apply_update(&self, ordinal: u32, ts: Timestamp, seq: u32, cols: Vec<(u32, Datum)>) {
        self.push(DeltaKey::new(ordinal, ts, seq), DeltaChange::Update(cols));
    }

    pub fn apply_delete(&self, ordinal: u32, ts: Timestamp, seq: u32) {
        self.push(DeltaKey::new(ordinal, ts, seq), DeltaChange::Delete);
    }

    pub fn apply_reinsert(&self, ordinal: u32, ts: Timestamp, seq: u32, image: Vec<Datum>) {
        self.push(DeltaKey::new(ordinal, ts, seq), DeltaChange::Reinsert(image));
    }

    fn push(&self, key: DeltaKey, change: DeltaChange) {
        self.size
            .fetch_add(change.size_bytes() + std::mem::size_of::<DeltaKey>(), Ordering::Relaxed);
        let prev = self.entries.write().insert(key, change);
        debug_assert!(prev.is_none(), "duplicate delta key {:?}", key);
    }

    /// Copy out every entry in stream order.
    pub fn snapshot(&self) -> Vec<DeltaEntry> {
        self.entries
            .read()
            .iter()
            .map(|(key, change)| DeltaEntry::new(*key, change.clone()))
            .collect()
    }

    /// Copy out the entries addressing one ordinal, in stream order.
    pub fn entries_for(&self, ordinal: u32) -> Vec<DeltaEntry> {
        self.entries
            .read()
            .range(DeltaKey::new(ordinal, 0, 0)..DeltaKey::new(ordinal + 1, 0, 0))
            .map(|(key, change)| DeltaEntry::new(*key, change.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Approximate heap footprint, for flush picking and back-pressure.
    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

impl Default for DeltaMemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datum;

    #[test]
    fn test_stream_order() {
        let dms = DeltaMemStore::new();
        dms.apply_delete(3, 10, 0);
        dms.apply_update(0, 12, 0, vec![(0, Datum::I32(1))]);
        dms.apply_update(0, 7, 1, vec![]);
        let keys: Vec<_> = dms.snapshot().into_iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![
                DeltaKey::new(0, 7, 1),
                DeltaKey::new(0, 12, 0),
                DeltaKey::new(3, 10, 0),
            ]
        );
    }

    #[test]
    fn test_entries_for() {
        let dms = DeltaMemStore::new();
        dms.apply_delete(1, 5, 0);
        dms.apply_reinsert(1, 5, 1, vec![Datum::I32(9)]);
        dms.apply_delete(2, 6, 0);
        assert_eq!(dms.entries_for(1).len(), 2);
        assert_eq!(dms.entries_for(0).len(), 0);
        assert!(dms.size_bytes() > 0);
    }
}
