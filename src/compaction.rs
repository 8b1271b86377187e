//! Delta and row-set compactions.
//!
//! All three operations are pure rewrites: a scan before and after returns
//! identical logical results at every snapshot the tablet still serves.
//!
//! * Minor delta compaction merges the flushed redo files of one row set.
//! * Major delta compaction folds applicable update redos into the base
//!   columns, inverting them into the undo stream.
//! * Merging compaction decodes full per-key histories across row sets,
//!   merges generations, and rebuilds one output row set, reclaiming
//!   tombstones whose history lies wholly below clean time.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use itertools::Itertools;
use tracing::info;

use crate::delta::{DeltaChange, DeltaEntry, DeltaFile, DeltaOrdering};
use crate::error::EngineResult;
use crate::history::{KeyHistory, SplitHistory};
use crate::rowset::{DiskRowSet, RowSetBuilder};
use crate::tablet::Tablet;
use crate::types::{Datum, KeyBytes, Timestamp};
use crate::version::RegistryOp;
use crate::wal::WalRecord;

fn entry_tuples(entries: &[DeltaEntry]) -> Vec<(Timestamp, u32, DeltaChange)> {
    entries
        .iter()
        .map(|e| (e.key.ts, e.key.seq, e.change.clone()))
        .collect()
}

impl Tablet {
    /// Merge all flushed redo files of the row set with the most of them
    /// into a single file. Base, undo, and the DMS are untouched. Returns
    /// the row set compacted, or `None` if no row set has two live files.
    pub async fn minor_compact_deltas(&self) -> EngineResult<Option<u32>> {
        self.check_not_failed()?;
        let _guard = self.apply_lock.lock().await;

        let current = self.version.current();
        let Some(target) = current
            .rowsets
            .values()
            .filter(|rs| rs.live_redo_file_count() >= 2)
            .max_by_key(|rs| rs.live_redo_file_count())
        else {
            return Ok(None);
        };

        let rowset_id = target.rowset_id();
        let files = target.redo_files();
        let mut entries: Vec<DeltaEntry> = files
            .iter()
            .flat_map(|f| f.entries().iter().cloned())
            .collect();
        entries.sort_unstable_by_key(|e| e.key);

        let delta_id = self.next_delta_id.fetch_add(1, Ordering::SeqCst);
        let merged = DeltaFile::create(
            crate::rowset::path_of_redo(target.dir(), delta_id),
            delta_id,
            DeltaOrdering::Redo,
            entries,
        )
        .await?;

        self.wal
            .lock()
            .await
            .append(&WalRecord::MinorCompaction {
                rowset_id,
                delta_id,
            })
            .await?;
        let replaced = target.replace_redo_files(Arc::new(merged));
        self.remove_redo_files(target, &replaced, delta_id).await;

        info!(
            rowset_id,
            delta_id,
            inputs = replaced.len(),
            "minor delta compaction complete"
        );
        Ok(Some(rowset_id))
    }

    /// Fold flushed update redos into the base of the row set carrying the
    /// most redo records, producing a replacement row set with identical
    /// ordinals. Deletes and reinserts (and anything behind them, per
    /// ordinal) stay on the redo side; the pending DMS moves over unchanged.
    pub async fn major_compact_deltas(&self) -> EngineResult<Option<u32>> {
        self.check_not_failed()?;
        let _guard = self.apply_lock.lock().await;

        let current = self.version.current();
        let Some(target) = current
            .rowsets
            .values()
            .filter(|rs| rs.redo_files().iter().map(|f| f.len()).sum::<usize>() > 0)
            .max_by_key(|rs| rs.redo_files().iter().map(|f| f.len()).sum::<usize>())
        else {
            return Ok(None);
        };

        let input_id = target.rowset_id();
        let output_id = self.next_rowset_id.fetch_add(1, Ordering::SeqCst);
        let rows = self.fold_rowset(target).await?;

        let dir = self
            .options
            .path
            .join(crate::rowset::rowset_dir_name(output_id));
        RowSetBuilder::new(
            self.schema.clone(),
            self.options.block_size,
            self.options.bloom_fpp,
        )
        .build(&dir, &rows)
        .await?;
        let output = self.open_rowset(output_id, &[0]).await?;
        output.adopt_dms(target.dms());

        self.wal
            .lock()
            .await
            .append(&WalRecord::MajorCompaction {
                input: input_id,
                output: output_id,
            })
            .await?;
        self.version.commit(vec![
            RegistryOp::AddRowSet(Arc::new(output)),
            RegistryOp::RemoveRowSet(input_id),
        ]);

        info!(input_id, output_id, "major delta compaction complete");
        Ok(Some(output_id))
    }

    /// Per-ordinal update folding for major delta compaction.
    async fn fold_rowset(&self, rowset: &Arc<DiskRowSet>) -> EngineResult<Vec<SplitHistory>> {
        let pk_len = self.schema.pk_len();
        let count = rowset.row_count();
        let columns = self
            .rowset_columns(rowset, count)
            .await?;
        let redo_files = rowset.redo_files();

        let mut rows = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let key_datums: Vec<Datum> = columns[..pk_len]
                .iter()
                .map(|col| col[ordinal as usize].clone())
                .collect();
            let mut image: Vec<Datum> = columns[pk_len..]
                .iter()
                .map(|col| col[ordinal as usize].clone())
                .collect();

            let chain: Vec<DeltaEntry> = redo_files
                .iter()
                .flat_map(|f| f.entries_for(ordinal).iter().cloned())
                .collect();

            // Fold the leading run of updates; the first delete (a ghost's
            // chain starts with one) stops the fold for this ordinal.
            let mut folded_inverses = vec![];
            let mut anchor_ts = None;
            let mut rest = chain.as_slice();
            while let Some((entry, tail)) = rest.split_first() {
                let DeltaChange::Update(cols) = &entry.change else {
                    break;
                };
                let mut old_cols = Vec::with_capacity(cols.len());
                for (idx, datum) in cols {
                    old_cols.push((*idx, image[*idx as usize].clone()));
                    image[*idx as usize] = datum.clone();
                }
                folded_inverses.push((entry.key.ts, entry.key.seq, DeltaChange::Update(old_cols)));
                anchor_ts = Some(entry.key.ts);
                rest = tail;
            }

            let old_undo = entry_tuples(rowset.undo().entries_for(ordinal));
            let anchor_ts = anchor_ts
                .or_else(|| old_undo.first().map(|(ts, _, _)| *ts))
                .unwrap_or(0);
            // Newest-first: the folded updates sit above the old undo chain.
            folded_inverses.reverse();
            let undo = folded_inverses
                .into_iter()
                .chain(old_undo)
                .collect_vec();

            rows.push(SplitHistory {
                key: rowset.pk().key_at(ordinal).to_vec(),
                key_datums,
                base_image: image,
                anchor_ts,
                undo,
                redo: entry_tuples(rest),
            });
        }
        Ok(rows)
    }

    /// Merge every live row set (and its pending deltas) into one rewritten
    /// row set at the current safe time. Tombstoned keys whose whole history
    /// sits below clean time are reclaimed. Returns the output row set id,
    /// `None` when the tablet has no disk row sets or everything was elided.
    pub async fn compact_all(&self) -> EngineResult<Option<u32>> {
        self.check_not_failed()?;
        let _guard = self.apply_lock.lock().await;

        let current = self.version.current();
        if current.rowsets.is_empty() {
            return Ok(None);
        }
        let inputs: Vec<Arc<DiskRowSet>> = current.rowsets.values().cloned().collect();
        let input_ids = inputs.iter().map(|rs| rs.rowset_id()).collect_vec();
        let clean_time = self.mvcc.clean_time(self.ancient_history_mark());

        // Decode every key's full history, merging generations that ended up
        // in different row sets.
        let mut histories: BTreeMap<KeyBytes, KeyHistory> = BTreeMap::new();
        for rowset in &inputs {
            for history in self.decode_rowset(rowset).await? {
                match histories.entry(history.key.clone()) {
                    std::collections::btree_map::Entry::Vacant(v) => {
                        v.insert(history);
                    }
                    std::collections::btree_map::Entry::Occupied(mut o) => {
                        o.get_mut().merge(history);
                    }
                }
            }
        }

        let mut rows: Vec<SplitHistory> = Vec::with_capacity(histories.len());
        let mut elided = 0usize;
        for history in histories.values() {
            if !history.is_live_latest() && history.max_ts() <= clean_time {
                // No snapshot at or above clean time may observe this key.
                assert!(history.state_at(clean_time).is_none());
                elided += 1;
                continue;
            }
            rows.push(history.split().expect("merged history was never live"));
        }

        let output = if rows.is_empty() {
            None
        } else {
            let output_id = self.next_rowset_id.fetch_add(1, Ordering::SeqCst);
            let dir = self
                .options
                .path
                .join(crate::rowset::rowset_dir_name(output_id));
            RowSetBuilder::new(
                self.schema.clone(),
                self.options.block_size,
                self.options.bloom_fpp,
            )
            .build(&dir, &rows)
            .await?;
            Some(output_id)
        };

        self.wal
            .lock()
            .await
            .append(&WalRecord::MergeCompaction {
                inputs: input_ids.clone(),
                output,
            })
            .await?;

        let mut ops = vec![];
        if let Some(output_id) = output {
            let rowset = self.open_rowset(output_id, &[0]).await?;
            ops.push(RegistryOp::AddRowSet(Arc::new(rowset)));
        }
        ops.extend(input_ids.iter().copied().map(RegistryOp::RemoveRowSet));
        self.version.commit(ops);
        self.version.do_vacuum().await.ok();

        info!(
            inputs = ?input_ids,
            output = ?output,
            rows = rows.len(),
            elided,
            "merging compaction complete"
        );
        Ok(output)
    }

    async fn rowset_columns(
        &self,
        rowset: &Arc<DiskRowSet>,
        count: u32,
    ) -> EngineResult<Vec<Vec<Datum>>> {
        rowset
            .read_columns(0..self.schema.num_columns(), 0, count)
            .await
    }

    /// Reconstruct the canonical mutation history of every row in `rowset`,
    /// including pending DMS entries.
    async fn decode_rowset(&self, rowset: &Arc<DiskRowSet>) -> EngineResult<Vec<KeyHistory>> {
        let pk_len = self.schema.pk_len();
        let count = rowset.row_count();
        let columns = self.rowset_columns(rowset, count).await?;
        let overlay = rowset.delta_overlay();

        let mut histories = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let key_datums: Vec<Datum> = columns[..pk_len]
                .iter()
                .map(|col| col[ordinal as usize].clone())
                .collect();
            let base: Vec<Datum> = columns[pk_len..]
                .iter()
                .map(|col| col[ordinal as usize].clone())
                .collect();
            histories.push(KeyHistory::assemble(
                rowset.pk().key_at(ordinal).to_vec(),
                key_datums,
                &base,
                &entry_tuples(rowset.undo().entries_for(ordinal)),
                &entry_tuples(&overlay.redo_for(ordinal)),
            ));
        }
        Ok(histories)
    }
}
