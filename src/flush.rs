//! Flush operations: MemRowSet to DiskRowSet, and DeltaMemStore to redo
//! delta file. Both are serialized with the write path and become visible to
//! readers atomically, after their WAL control record is durable.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use crate::delta::{DeltaFile, DeltaOrdering};
use crate::error::EngineResult;
use crate::history::SplitHistory;
use crate::mem_rowset::MemRowSet;
use crate::rowset::RowSetBuilder;
use crate::tablet::Tablet;
use crate::version::RegistryOp;
use crate::wal::WalRecord;

impl Tablet {
    /// Freeze the MemRowSet, dump its rows (with full mutation history) into
    /// a new disk row set, and swap in an empty successor. Returns the new
    /// row set id, or `None` when there was nothing to flush.
    pub async fn flush_mem_rowset(&self) -> EngineResult<Option<u32>> {
        self.check_not_failed()?;
        let _guard = self.apply_lock.lock().await;
        self.flush_mem_rowset_locked().await
    }

    /// Flush body; the caller holds the apply lock.
    pub(crate) async fn flush_mem_rowset_locked(&self) -> EngineResult<Option<u32>> {
        let current = self.version.current();
        if current.mrs.is_empty() {
            return Ok(None);
        }
        current.mrs.freeze();

        // Skip-list iteration is key-ascending; positions become ordinals.
        let rows: Vec<SplitHistory> = current
            .mrs
            .histories()
            .iter()
            .map(|h| h.split().expect("MemRowSet history was never live"))
            .collect();

        let rowset_id = self.next_rowset_id.fetch_add(1, Ordering::SeqCst);
        let dir = self
            .options
            .path
            .join(crate::rowset::rowset_dir_name(rowset_id));
        RowSetBuilder::new(
            self.schema.clone(),
            self.options.block_size,
            self.options.bloom_fpp,
        )
        .build(&dir, &rows)
        .await?;
        let rowset = self.open_rowset(rowset_id, &[0]).await?;

        self.wal
            .lock()
            .await
            .append(&WalRecord::MemFlush { rowset_id })
            .await?;
        self.version.commit(vec![
            RegistryOp::SwapMemRowSet(Arc::new(MemRowSet::new())),
            RegistryOp::AddRowSet(Arc::new(rowset)),
        ]);

        info!(rowset_id, rows = rows.len(), "flushed MemRowSet");
        Ok(Some(rowset_id))
    }

    /// Serialize the largest DeltaMemStore into a new redo delta file of its
    /// row set and swap in an empty store. Returns `(rowset id, delta id)`,
    /// or `None` when every store is empty.
    pub async fn flush_biggest_dms(&self) -> EngineResult<Option<(u32, u64)>> {
        self.check_not_failed()?;
        let _guard = self.apply_lock.lock().await;
        self.flush_biggest_dms_locked().await
    }

    /// Flush body; the caller holds the apply lock.
    pub(crate) async fn flush_biggest_dms_locked(&self) -> EngineResult<Option<(u32, u64)>> {
        let current = self.version.current();
        let Some(target) = current
            .rowsets
            .values()
            .filter(|rs| !rs.dms().is_empty())
            .max_by_key(|rs| rs.dms().size_bytes())
        else {
            return Ok(None);
        };

        let rowset_id = target.rowset_id();
        let delta_id = self.next_delta_id.fetch_add(1, Ordering::SeqCst);
        let entries = target.dms().snapshot();
        let count = entries.len();
        let file = DeltaFile::create(
            crate::rowset::path_of_redo(target.dir(), delta_id),
            delta_id,
            DeltaOrdering::Redo,
            entries,
        )
        .await?;

        self.wal
            .lock()
            .await
            .append(&WalRecord::DeltaFlush {
                rowset_id,
                delta_id,
            })
            .await?;
        target.complete_dms_flush(Arc::new(file));

        info!(rowset_id, delta_id, entries = count, "flushed DeltaMemStore");
        Ok(Some((rowset_id, delta_id)))
    }
}
