//! Canonical per-key mutation history.
//!
//! Every layer of the engine is a different physical encoding of the same
//! logical object: the ordered list of mutations a key has seen, each stamped
//! with `(commit ts, batch seq)`. A MemRowSet row holds the list directly; a
//! DiskRowSet stores it split around a per-row anchor into a base image, an
//! undo stream and a redo stream. This module owns that logical object, the
//! lossless split, and its inverse. Compaction neutrality reduces to: decode,
//! merge, re-split.

use crate::delta::{DeltaChange, DeltaEntry, DeltaKey};
use crate::types::{Datum, KeyBytes, Timestamp};

/// One mutation event in a key's life. Images cover value columns only; the
/// key columns are immutable and live beside the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistEvent {
    /// First creation of the key (full value-column image).
    Insert(Vec<Datum>),
    /// In-place change of some value columns. May be empty (no-op update).
    Update(Vec<(u32, Datum)>),
    /// Tombstone for the current generation.
    Delete,
    /// Revival of a tombstoned key (full value-column image).
    Reinsert(Vec<Datum>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub ts: Timestamp,
    pub seq: u32,
    pub event: HistEvent,
}

impl HistoryEntry {
    pub fn new(ts: Timestamp, seq: u32, event: HistEvent) -> Self {
        Self { ts, seq, event }
    }
}

/// The full mutation history of one key, ordered by `(ts, seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHistory {
    pub key: KeyBytes,
    pub key_datums: Vec<Datum>,
    pub entries: Vec<HistoryEntry>,
}

/// A history split around its anchor: the representation a DiskRowSet
/// persists. `base_image` is the last live value-column image; everything
/// before the anchor is inverted into `undo` (stored newest-first),
/// everything after it stays forward in `redo` (oldest-first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitHistory {
    pub key: KeyBytes,
    pub key_datums: Vec<Datum>,
    pub base_image: Vec<Datum>,
    /// Timestamp of the event that produced `base_image`.
    pub anchor_ts: Timestamp,
    /// Inverted events at or below the anchor, `(ts desc, seq desc)`.
    pub undo: Vec<(Timestamp, u32, DeltaChange)>,
    /// Forward events above the anchor, `(ts asc, seq asc)`.
    pub redo: Vec<(Timestamp, u32, DeltaChange)>,
}

impl KeyHistory {
    pub fn new(key: KeyBytes, key_datums: Vec<Datum>) -> Self {
        Self {
            key,
            key_datums,
            entries: Vec::new(),
        }
    }

    /// Value-column image visible at snapshot `ts`, or `None` if the key is
    /// absent or tombstoned there. Mutations with `entry.ts <= ts` apply.
    pub fn state_at(&self, ts: Timestamp) -> Option<Vec<Datum>> {
        let mut state = None;
        for entry in &self.entries {
            if entry.ts > ts {
                break;
            }
            apply_event(&mut state, &entry.event);
        }
        state
    }

    pub fn latest_state(&self) -> Option<Vec<Datum>> {
        self.state_at(Timestamp::MAX)
    }

    pub fn is_live_latest(&self) -> bool {
        self.latest_state().is_some()
    }

    /// Greatest mutation timestamp in the history (0 for an empty history).
    pub fn max_ts(&self) -> Timestamp {
        self.entries.last().map(|e| e.ts).unwrap_or(0)
    }

    /// Append an event; `(ts, seq)` must not precede the current tail.
    pub fn push(&mut self, ts: Timestamp, seq: u32, event: HistEvent) {
        debug_assert!(
            self.entries
                .last()
                .map(|last| (last.ts, last.seq) < (ts, seq))
                .unwrap_or(true),
            "history mutations must arrive in (ts, seq) order"
        );
        self.entries.push(HistoryEntry::new(ts, seq, event));
    }

    /// Interleave another history of the same key into this one. Sources
    /// never share a `(ts, seq)` stamp, so the merge is a strict interleave.
    pub fn merge(&mut self, other: KeyHistory) {
        debug_assert_eq!(self.key, other.key);
        let mut merged = Vec::with_capacity(self.entries.len() + other.entries.len());
        let mut left = std::mem::take(&mut self.entries).into_iter().peekable();
        let mut right = other.entries.into_iter().peekable();
        loop {
            match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => {
                    if (l.ts, l.seq) <= (r.ts, r.seq) {
                        merged.push(left.next().unwrap());
                    } else {
                        merged.push(right.next().unwrap());
                    }
                }
                (Some(_), None) => merged.push(left.next().unwrap()),
                (None, Some(_)) => merged.push(right.next().unwrap()),
                (None, None) => break,
            }
        }
        self.entries = merged;
    }

    /// Split the history around its anchor: the last event that left the key
    /// live. Returns `None` for a history that was never live (cannot occur
    /// through the write path, which only creates histories via insert).
    pub fn split(&self) -> Option<SplitHistory> {
        let mut state: Option<Vec<Datum>> = None;
        let mut anchor: Option<(usize, Vec<Datum>)> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            apply_event(&mut state, &entry.event);
            if let Some(image) = &state {
                anchor = Some((idx, image.clone()));
            }
        }
        let (anchor_idx, base_image) = anchor?;

        // Invert everything up to and including the anchor.
        let mut undo = Vec::with_capacity(anchor_idx + 1);
        let mut prev: Option<Vec<Datum>> = None;
        for entry in &self.entries[..=anchor_idx] {
            let inverse = invert_event(&prev, &entry.event);
            undo.push((entry.ts, entry.seq, inverse));
            apply_event(&mut prev, &entry.event);
        }
        undo.reverse();

        // Everything past the anchor stays forward. By construction the key
        // is never live after the anchor, so this tail is at most a delete.
        let redo = self.entries[anchor_idx + 1..]
            .iter()
            .map(|entry| (entry.ts, entry.seq, forward_change(&entry.event)))
            .collect();

        Some(SplitHistory {
            key: self.key.clone(),
            key_datums: self.key_datums.clone(),
            base_image,
            anchor_ts: self.entries[anchor_idx].ts,
            undo,
            redo,
        })
    }

    /// Rebuild a history from its persisted parts. `undo` arrives newest-first
    /// (file order), `redo` oldest-first. The inverse of [`Self::split`]
    /// composed with any number of redo appends.
    pub fn assemble(
        key: KeyBytes,
        key_datums: Vec<Datum>,
        base_image: &[Datum],
        undo: &[(Timestamp, u32, DeltaChange)],
        redo: &[(Timestamp, u32, DeltaChange)],
    ) -> Self {
        // Walk backward from the base image, recovering each forward event
        // from its inverse.
        let mut state: Option<Vec<Datum>> = Some(base_image.to_vec());
        let mut reversed: Vec<HistoryEntry> = Vec::with_capacity(undo.len());
        for (ts, seq, inverse) in undo {
            let event = match inverse {
                DeltaChange::Delete => {
                    // Forward event created the row with the image we are
                    // currently looking at.
                    let image = state.clone().expect("undo delete below an absent row");
                    state = None;
                    HistEvent::Reinsert(image)
                }
                DeltaChange::Reinsert(old_image) => {
                    debug_assert!(state.is_none(), "undo reinsert above a live row");
                    state = Some(old_image.clone());
                    HistEvent::Delete
                }
                DeltaChange::Update(old_cols) => {
                    let row = state.as_mut().expect("undo update on an absent row");
                    let mut new_cols = Vec::with_capacity(old_cols.len());
                    for (idx, old) in old_cols {
                        new_cols.push((*idx, row[*idx as usize].clone()));
                        row[*idx as usize] = old.clone();
                    }
                    HistEvent::Update(new_cols)
                }
            };
            reversed.push(HistoryEntry::new(*ts, *seq, event));
        }
        reversed.reverse();
        let mut entries = reversed;

        for (ts, seq, change) in redo {
            let event = match change {
                DeltaChange::Update(cols) => HistEvent::Update(cols.clone()),
                DeltaChange::Delete => HistEvent::Delete,
                DeltaChange::Reinsert(image) => HistEvent::Reinsert(image.clone()),
            };
            entries.push(HistoryEntry::new(*ts, *seq, event));
        }

        // The earliest live-making event is the insert; later ones are
        // reinserts of subsequent generations.
        if let Some(first) = entries.first_mut() {
            if let HistEvent::Reinsert(image) = &first.event {
                first.event = HistEvent::Insert(image.clone());
            }
        }

        Self {
            key,
            key_datums,
            entries,
        }
    }
}

fn apply_event(state: &mut Option<Vec<Datum>>, event: &HistEvent) {
    match event {
        HistEvent::Insert(image) | HistEvent::Reinsert(image) => {
            debug_assert!(state.is_none(), "insert over a live row");
            *state = Some(image.clone());
        }
        HistEvent::Update(cols) => {
            let row = state.as_mut().expect("update on an absent row");
            for (idx, datum) in cols {
                row[*idx as usize] = datum.clone();
            }
        }
        HistEvent::Delete => {
            debug_assert!(state.is_some(), "delete of an absent row");
            *state = None;
        }
    }
}

/// The undo record that reverses `event` when the row state before it was
/// `prev`.
fn invert_event(prev: &Option<Vec<Datum>>, event: &HistEvent) -> DeltaChange {
    match event {
        HistEvent::Insert(_) | HistEvent::Reinsert(_) => DeltaChange::Delete,
        HistEvent::Delete => {
            DeltaChange::Reinsert(prev.clone().expect("delete of an absent row"))
        }
        HistEvent::Update(cols) => {
            let row = prev.as_ref().expect("update on an absent row");
            DeltaChange::Update(
                cols.iter()
                    .map(|(idx, _)| (*idx, row[*idx as usize].clone()))
                    .collect(),
            )
        }
    }
}

fn forward_change(event: &HistEvent) -> DeltaChange {
    match event {
        HistEvent::Insert(image) | HistEvent::Reinsert(image) => {
            DeltaChange::Reinsert(image.clone())
        }
        HistEvent::Update(cols) => DeltaChange::Update(cols.clone()),
        HistEvent::Delete => DeltaChange::Delete,
    }
}

/// Convert split-out undo records into file entries for one ordinal,
/// preserving the `(ts desc, seq desc)` stream order.
pub fn undo_entries_for(ordinal: u32, split: &SplitHistory) -> Vec<DeltaEntry> {
    split
        .undo
        .iter()
        .map(|(ts, seq, change)| DeltaEntry::new(DeltaKey::new(ordinal, *ts, *seq), change.clone()))
        .collect()
}

/// Convert split-out redo records into file entries for one ordinal.
pub fn redo_entries_for(ordinal: u32, split: &SplitHistory) -> Vec<DeltaEntry> {
    split
        .redo
        .iter()
        .map(|(ts, seq, change)| DeltaEntry::new(DeltaKey::new(ordinal, *ts, *seq), change.clone()))
        .collect()
}
