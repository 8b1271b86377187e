use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;

use crate::delta::DeltaChange;
use crate::error::RowError;
use crate::history::{HistEvent, KeyHistory};
use crate::types::{Datum, KeyBytes, Timestamp};

/// In-memory row store for freshly inserted rows, ordered by encoded primary
/// key. A concurrent skip list carries the rows; each row guards its own
/// mutation history with a short lock. The serial applier is the only writer;
/// readers walk the map lock-free and only briefly lock individual rows.
///
/// A row's history starts with its insert (full image) and chains every later
/// mutation applied while the row remains in memory, including delete and
/// reinsert edges, so that flushing can materialize the complete undo history
/// of every generation the MemRowSet has seen.
pub struct MemRowSet {
    rows: SkipMap<KeyBytes, RwLock<MemRow>>,
    size: AtomicUsize,
    frozen: AtomicBool,
}

struct MemRow {
    history: KeyHistory,
}

impl MemRowSet {
    pub fn new() -> Self {
        Self {
            rows: SkipMap::new(),
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Insert a new row. Fails with `AlreadyPresent` if a live row exists for
    /// the key; against a tombstoned in-memory row the insert becomes a
    /// reinsert edge on the same history.
    pub fn insert(
        &self,
        key: KeyBytes,
        key_datums: Vec<Datum>,
        image: Vec<Datum>,
        ts: Timestamp,
        seq: u32,
    ) -> Result<(), RowError> {
        debug_assert!(!self.is_frozen(), "insert into a frozen MemRowSet");
        self.bump_size(&image);
        if let Some(entry) = self.rows.get(&key) {
            let mut row = entry.value().write();
            if row.history.is_live_latest() {
                return Err(RowError::AlreadyPresent);
            }
            row.history.push(ts, seq, HistEvent::Reinsert(image));
            return Ok(());
        }
        let mut history = KeyHistory::new(key.clone(), key_datums);
        history.push(ts, seq, HistEvent::Insert(image));
        self.rows.insert(key, RwLock::new(MemRow { history }));
        Ok(())
    }

    /// Apply an update or delete to a live in-memory row.
    pub fn mutate(
        &self,
        key: &[u8],
        change: &DeltaChange,
        ts: Timestamp,
        seq: u32,
    ) -> Result<(), RowError> {
        debug_assert!(!self.is_frozen(), "mutation of a frozen MemRowSet");
        let Some(entry) = self.rows.get(key) else {
            return Err(RowError::NotFound);
        };
        let mut row = entry.value().write();
        if !row.history.is_live_latest() {
            return Err(RowError::NotFound);
        }
        let event = match change {
            DeltaChange::Update(cols) => HistEvent::Update(cols.clone()),
            DeltaChange::Delete => HistEvent::Delete,
            DeltaChange::Reinsert(_) => unreachable!("reinserts route through insert"),
        };
        self.size.fetch_add(change.size_bytes(), Ordering::Relaxed);
        row.history.push(ts, seq, event);
        Ok(())
    }

    /// Latest state of a key: `None` if the MemRowSet has never seen it,
    /// `Some(None)` if its newest generation is tombstoned, `Some(Some(img))`
    /// if live.
    pub fn latest_state(&self, key: &[u8]) -> Option<Option<Vec<Datum>>> {
        self.rows
            .get(key)
            .map(|entry| entry.value().read().history.latest_state())
    }

    /// Value-column image visible at `ts`, if the key is live there.
    pub fn state_at(&self, key: &[u8], ts: Timestamp) -> Option<Vec<Datum>> {
        self.rows
            .get(key)
            .and_then(|entry| entry.value().read().history.state_at(ts))
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.rows.contains_key(key)
    }

    /// Rows live at `ts`, in key order, as `(key datums, value image)`.
    pub fn collect_visible(&self, ts: Timestamp) -> Vec<(KeyBytes, Vec<Datum>, Vec<Datum>)> {
        let mut out = Vec::new();
        for entry in self.rows.iter() {
            let row = entry.value().read();
            if let Some(image) = row.history.state_at(ts) {
                out.push((
                    entry.key().clone(),
                    row.history.key_datums.clone(),
                    image,
                ));
            }
        }
        out
    }

    /// Every history in key order, for flushing.
    pub fn histories(&self) -> Vec<KeyHistory> {
        self.rows
            .iter()
            .map(|entry| entry.value().read().history.clone())
            .collect()
    }

    /// Redirect future writes elsewhere; this MemRowSet is being flushed.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.rows.len()
    }

    /// Approximate heap footprint, for flush picking and back-pressure.
    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn bump_size(&self, image: &[Datum]) {
        let bytes = 32 + image.iter().map(|d| d.size_bytes()).sum::<usize>();
        self.size.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Default for MemRowSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datum;

    fn key(k: i32) -> (KeyBytes, Vec<Datum>) {
        (
            ((k as u32) ^ (1 << 31)).to_be_bytes().to_vec(),
            vec![Datum::I32(k)],
        )
    }

    fn img(v: i32) -> Vec<Datum> {
        vec![Datum::I32(v)]
    }

    #[test]
    fn test_insert_then_read() {
        let mrs = MemRowSet::new();
        let (k, kd) = key(1);
        mrs.insert(k.clone(), kd, img(5), 1, 0).unwrap();
        assert_eq!(mrs.latest_state(&k), Some(Some(img(5))));
        assert_eq!(mrs.state_at(&k, 0), None);
        assert_eq!(mrs.state_at(&k, 1), Some(img(5)));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mrs = MemRowSet::new();
        let (k, kd) = key(1);
        mrs.insert(k.clone(), kd.clone(), img(5), 1, 0).unwrap();
        assert_eq!(
            mrs.insert(k, kd, img(6), 2, 0),
            Err(RowError::AlreadyPresent)
        );
    }

    #[test]
    fn test_delete_then_reinsert() {
        let mrs = MemRowSet::new();
        let (k, kd) = key(1);
        mrs.insert(k.clone(), kd.clone(), img(5), 1, 0).unwrap();
        mrs.mutate(&k, &DeltaChange::Delete, 2, 0).unwrap();
        assert_eq!(mrs.latest_state(&k), Some(None));
        // Reinsert lands on the same history.
        mrs.insert(k.clone(), kd, img(7), 3, 0).unwrap();
        assert_eq!(mrs.latest_state(&k), Some(Some(img(7))));
        assert_eq!(mrs.state_at(&k, 2), None);
        assert_eq!(mrs.state_at(&k, 1), Some(img(5)));
        assert_eq!(mrs.entry_count(), 1);
    }

    #[test]
    fn test_mutate_missing_or_dead() {
        let mrs = MemRowSet::new();
        let (k, kd) = key(1);
        assert_eq!(
            mrs.mutate(&k, &DeltaChange::Delete, 1, 0),
            Err(RowError::NotFound)
        );
        mrs.insert(k.clone(), kd, img(5), 1, 0).unwrap();
        mrs.mutate(&k, &DeltaChange::Delete, 2, 0).unwrap();
        assert_eq!(
            mrs.mutate(&k, &DeltaChange::Update(vec![]), 3, 0),
            Err(RowError::NotFound)
        );
    }

    #[test]
    fn test_collect_visible_key_order() {
        let mrs = MemRowSet::new();
        for k in [3, 1, 2] {
            let (kb, kd) = key(k);
            mrs.insert(kb, kd, img(k * 10), k as u64, 0).unwrap();
        }
        let visible = mrs.collect_visible(u64::MAX);
        let keys: Vec<_> = visible.iter().map(|(_, kd, _)| kd[0].clone()).collect();
        assert_eq!(keys, vec![Datum::I32(1), Datum::I32(2), Datum::I32(3)]);
        // Snapshot at ts 2 hides the insert at ts 3.
        assert_eq!(mrs.collect_visible(2).len(), 2);
    }
}
