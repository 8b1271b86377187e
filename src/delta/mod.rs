//! Delta records: column-level mutations addressed by row ordinal.
//!
//! The same record shapes serve three places: the in-memory delta store of a
//! disk row set, flushed redo delta files, and undo files. Redo records move
//! a base row forward in time; undo records are the inverted form that moves
//! it backward. Which direction a record means is a property of the stream it
//! sits in, not of the record itself.

mod delta_file;
mod delta_mem_store;

pub use delta_file::{DeltaFile, DeltaOrdering};
pub use delta_mem_store::DeltaMemStore;

use serde::{Deserialize, Serialize};

use crate::types::{Datum, Timestamp};

/// Addresses one mutation: which row (by ordinal within the row set's base),
/// at which commit timestamp, and at which position within its batch.
///
/// Redo streams order entries `(ordinal asc, ts asc, seq asc)`; undo streams
/// order them `(ordinal asc, ts desc, seq desc)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeltaKey {
    pub ordinal: u32,
    pub ts: Timestamp,
    pub seq: u32,
}

impl DeltaKey {
    pub fn new(ordinal: u32, ts: Timestamp, seq: u32) -> Self {
        Self { ordinal, ts, seq }
    }
}

/// The mutation payload.
///
/// In a redo stream: `Update` carries new values, `Delete` tombstones the
/// row, `Reinsert` revives it with a full value-column image. In an undo
/// stream the same shapes carry the *previous* values: `Update` restores old
/// cells, `Delete` erases a row below its insertion, `Reinsert` revives the
/// image that a deletion removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaChange {
    /// `(value-column index, datum)` pairs. May be empty: an empty changelist
    /// is a committed no-op update.
    Update(Vec<(u32, Datum)>),
    Delete,
    /// Full value-column image.
    Reinsert(Vec<Datum>),
}

impl DeltaChange {
    /// Apply this change to a row state (`None` = absent/tombstoned).
    pub fn apply(&self, state: &mut Option<Vec<Datum>>) {
        match self {
            DeltaChange::Update(cols) => {
                let row = state
                    .as_mut()
                    .expect("update applied to an absent row");
                for (idx, datum) in cols {
                    row[*idx as usize] = datum.clone();
                }
            }
            DeltaChange::Delete => {
                debug_assert!(state.is_some(), "delete applied to an absent row");
                *state = None;
            }
            DeltaChange::Reinsert(image) => {
                debug_assert!(state.is_none(), "reinsert applied to a live row");
                *state = Some(image.clone());
            }
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            DeltaChange::Update(cols) => {
                8 + cols.iter().map(|(_, d)| 4 + d.size_bytes()).sum::<usize>()
            }
            DeltaChange::Delete => 8,
            DeltaChange::Reinsert(image) => {
                8 + image.iter().map(|d| d.size_bytes()).sum::<usize>()
            }
        }
    }
}

/// One addressed mutation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub key: DeltaKey,
    pub change: DeltaChange,
}

impl DeltaEntry {
    pub fn new(key: DeltaKey, change: DeltaChange) -> Self {
        Self { key, change }
    }
}
