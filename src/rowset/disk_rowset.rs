use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::future::Cache;
use parking_lot::RwLock;
use tracing::warn;

use super::block::{Block, BlockCacheKey};
use super::column::Column;
use super::pk_index::PkIndex;
use crate::delta::{DeltaEntry, DeltaFile, DeltaMemStore, DeltaOrdering};
use crate::error::{EngineResult, TracedEngineError};
use crate::schema::Schema;
use crate::types::{Datum, Row, Timestamp};

/// An immutable on-disk base image of a key range plus its mutation streams.
///
/// The base and the undo stream never change after build. The redo side (the
/// flushed delta files and the in-memory delta store) advances in place; a
/// reader snapshots it once at scan open via [`DiskRowSet::delta_overlay`]
/// and is then immune to concurrent delta flushes and minor compactions.
pub struct DiskRowSet {
    rowset_id: u32,
    dir: PathBuf,
    schema: Arc<Schema>,
    columns: Vec<Column>,
    pk: PkIndex,
    undo: Arc<DeltaFile>,
    deltas: RwLock<DeltaTracker>,
}

struct DeltaTracker {
    /// Flushed redo files in creation order. Per ordinal, entries in a later
    /// file always carry later `(ts, seq)` stamps than entries in an earlier
    /// one, so applying files in list order is applying in time order.
    redos: Vec<Arc<DeltaFile>>,
    dms: Arc<DeltaMemStore>,
}

/// A stable snapshot of one row set's redo side, taken at scan open.
#[derive(Clone)]
pub struct DeltaOverlay {
    redos: Vec<Arc<DeltaFile>>,
    /// DMS contents, `(ordinal, ts, seq)`-sorted.
    dms: Arc<Vec<DeltaEntry>>,
}

impl DeltaOverlay {
    /// Redo entries addressing `ordinal`, oldest first.
    pub fn redo_for(&self, ordinal: u32) -> Vec<DeltaEntry> {
        let mut out = Vec::new();
        for file in &self.redos {
            out.extend_from_slice(file.entries_for(ordinal));
        }
        let start = self.dms.partition_point(|e| e.key.ordinal < ordinal);
        let end = self.dms.partition_point(|e| e.key.ordinal <= ordinal);
        out.extend_from_slice(&self.dms[start..end]);
        out
    }
}

impl DiskRowSet {
    /// Open a row set directory. `redo_ids` is the live redo file list in
    /// creation order (id 0 is the initial stream written at build time);
    /// redo files on disk that are not listed are leftovers of an
    /// unacknowledged flush or compaction and are removed.
    pub async fn open(
        dir: impl AsRef<Path>,
        rowset_id: u32,
        schema: Arc<Schema>,
        cache: Cache<BlockCacheKey, Block>,
        redo_ids: &[u64],
    ) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();

        let mut columns = Vec::with_capacity(schema.num_columns());
        for (idx, column) in schema.columns().iter().enumerate() {
            columns.push(
                Column::open(
                    &dir,
                    idx,
                    column.data_type(),
                    column.nullable(),
                    cache.clone(),
                    BlockCacheKey::default()
                        .rowset(rowset_id)
                        .column(idx as u32),
                )
                .await?,
            );
        }

        let pk_bytes = tokio::fs::read(super::path_of_pk_meta(&dir)).await?;
        let pk = PkIndex::decode(&pk_bytes)?;
        for column in &columns {
            if column.row_count() != pk.row_count() {
                return Err(TracedEngineError::corruption(format!(
                    "rowset {}: pk index has {} rows but a column has {}",
                    rowset_id,
                    pk.row_count(),
                    column.row_count()
                )));
            }
        }

        let undo = Arc::new(
            DeltaFile::open(super::path_of_undo(&dir), 0, DeltaOrdering::Undo).await?,
        );

        let mut redos = Vec::with_capacity(redo_ids.len());
        for id in redo_ids {
            redos.push(Arc::new(
                DeltaFile::open(super::path_of_redo(&dir, *id), *id, DeltaOrdering::Redo)
                    .await?,
            ));
        }

        Ok(Self {
            rowset_id,
            dir,
            schema,
            columns,
            pk,
            undo,
            deltas: RwLock::new(DeltaTracker {
                redos,
                dms: Arc::new(DeltaMemStore::new()),
            }),
        })
    }

    /// Delete on-disk redo files that are not in the live list: leftovers of
    /// a flush or compaction that crashed before its control record. Called
    /// after bootstrap has replayed every record that could reference one.
    pub(crate) async fn remove_orphan_redo_files(&self, live: &[u64]) -> EngineResult<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix("redo-")
                .and_then(|rest| rest.strip_suffix(".delta"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };
            if !live.contains(&id) {
                warn!(
                    rowset_id = self.rowset_id,
                    delta_id = id,
                    "removing orphan redo file"
                );
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    pub fn rowset_id(&self) -> u32 {
        self.rowset_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn row_count(&self) -> u32 {
        self.pk.row_count()
    }

    pub fn pk(&self) -> &PkIndex {
        &self.pk
    }

    pub fn undo(&self) -> &Arc<DeltaFile> {
        &self.undo
    }

    /// Ordinal of `key` in this row set, live or ghost.
    pub fn ordinal_of(&self, key: &[u8]) -> Option<u32> {
        self.pk.ordinal_of(key)
    }

    pub fn dms(&self) -> Arc<DeltaMemStore> {
        self.deltas.read().dms.clone()
    }

    pub fn redo_files(&self) -> Vec<Arc<DeltaFile>> {
        self.deltas.read().redos.clone()
    }

    /// Number of flushed redo files with at least one record.
    pub fn live_redo_file_count(&self) -> usize {
        self.deltas
            .read()
            .redos
            .iter()
            .filter(|f| !f.is_empty())
            .count()
    }

    pub fn delta_overlay(&self) -> DeltaOverlay {
        let deltas = self.deltas.read();
        DeltaOverlay {
            redos: deltas.redos.clone(),
            dms: Arc::new(deltas.dms.snapshot()),
        }
    }

    /// Atomically attach a flushed delta file and swap in an empty DMS. The
    /// file's content equals the flushed DMS contents.
    pub fn complete_dms_flush(&self, file: Arc<DeltaFile>) {
        let mut deltas = self.deltas.write();
        deltas.redos.push(file);
        deltas.dms = Arc::new(DeltaMemStore::new());
    }

    /// Replace the whole flushed redo list with one merged file (minor delta
    /// compaction). The DMS is untouched.
    pub fn replace_redo_files(&self, output: Arc<DeltaFile>) -> Vec<u64> {
        let mut deltas = self.deltas.write();
        let replaced = deltas.redos.iter().map(|f| f.id()).collect();
        deltas.redos = vec![output];
        replaced
    }

    /// Move the accumulated DMS over to this row set (major delta compaction
    /// rewrites the base of a row set into a successor with identical
    /// ordinals; pending in-memory deltas stay valid and follow it).
    pub fn adopt_dms(&self, dms: Arc<DeltaMemStore>) {
        self.deltas.write().dms = dms;
    }

    /// The full base row (key and value columns) at `ordinal`.
    pub async fn base_row(&self, ordinal: u32) -> EngineResult<Row> {
        let mut row = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            row.push(column.read_one(ordinal).await?);
        }
        Ok(row)
    }

    /// The base value-column image at `ordinal`.
    pub async fn base_values(&self, ordinal: u32) -> EngineResult<Vec<Datum>> {
        let mut values = Vec::with_capacity(self.schema.num_value_columns());
        for column in &self.columns[self.schema.pk_len()..] {
            values.push(column.read_one(ordinal).await?);
        }
        Ok(values)
    }

    /// Batched column read over `[start, start + count)` ordinals, returning
    /// per-column datum vectors for the given schema column range.
    pub async fn read_columns(
        &self,
        column_range: std::ops::Range<usize>,
        start: u32,
        count: u32,
    ) -> EngineResult<Vec<Vec<Datum>>> {
        let mut out = Vec::with_capacity(column_range.len());
        for idx in column_range {
            out.push(self.columns[idx].read_range(start, count).await?);
        }
        Ok(out)
    }

    /// Value-column image of `ordinal` visible at snapshot `ts`, or `None`.
    pub async fn state_at(&self, ordinal: u32, ts: Timestamp) -> EngineResult<Option<Vec<Datum>>> {
        let base = self.base_values(ordinal).await?;
        let overlay = self.delta_overlay();
        Ok(materialize_at(
            base,
            self.undo.entries_for(ordinal),
            &overlay.redo_for(ordinal),
            ts,
        ))
    }

    /// Latest visible value-column image of `ordinal`, or `None` if the
    /// newest generation is tombstoned.
    pub async fn latest_state(&self, ordinal: u32) -> EngineResult<Option<Vec<Datum>>> {
        self.state_at(ordinal, Timestamp::MAX).await
    }
}

/// Materialize one row at snapshot `ts` from its base image and streams.
///
/// Redo entries at or below `ts` move the row forward from its anchor; undo
/// entries above `ts` roll it back. The two sets cannot both be non-empty for
/// one `ts`: redos sit strictly above the anchor, undos at or below it.
pub fn materialize_at(
    base: Vec<Datum>,
    undo: &[DeltaEntry],
    redo: &[DeltaEntry],
    ts: Timestamp,
) -> Option<Vec<Datum>> {
    let mut state = Some(base);
    for entry in redo {
        if entry.key.ts > ts {
            break;
        }
        entry.change.apply(&mut state);
    }
    for entry in undo {
        if entry.key.ts > ts {
            entry.change.apply(&mut state);
        } else {
            break;
        }
    }
    state
}
