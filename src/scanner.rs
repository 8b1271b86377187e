use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{EngineResult, TracedEngineError};
use crate::mem_rowset::MemRowSet;
use crate::mvcc::MvccSnapshot;
use crate::rowset::{DeltaOverlay, DiskRowSet};
use crate::schema::Schema;
use crate::tablet::Tablet;
use crate::types::{Datum, KeyBytes, Row, Timestamp};
use crate::version::VersionPin;

/// Which snapshot a scan reads at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Assign a fresh timestamp at open and read everything committed.
    Latest,
    /// Read at an explicit past timestamp.
    AtSnapshot(Timestamp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    /// Row sets are drained one after another; no cross-rowset ordering.
    Unordered,
    /// K-way merged by encoded primary key, strictly ascending.
    OrderedByPk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A comparison predicate on one column, evaluated on materialized rows.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub column: String,
    pub op: PredicateOp,
    pub value: Datum,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: PredicateOp, value: Datum) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    fn matches(&self, datum: &Datum) -> bool {
        if datum.is_null() || self.value.is_null() {
            return false;
        }
        match self.op {
            PredicateOp::Eq => datum == &self.value,
            PredicateOp::Lt => datum < &self.value,
            PredicateOp::Le => datum <= &self.value,
            PredicateOp::Gt => datum > &self.value,
            PredicateOp::Ge => datum >= &self.value,
        }
    }
}

/// Configures and opens a [`Scanner`].
pub struct ScanBuilder {
    tablet: Arc<Tablet>,
    pub(crate) read_mode: ReadMode,
    pub(crate) order_mode: OrderMode,
    pub(crate) predicates: Vec<Predicate>,
    pub(crate) projection: Option<Vec<String>>,
    pub(crate) deadline: Option<Duration>,
    pub(crate) wait_for_safe: bool,
    pub(crate) batch_size: usize,
}

impl ScanBuilder {
    pub(crate) fn new(tablet: Arc<Tablet>, batch_size: usize) -> Self {
        Self {
            tablet,
            read_mode: ReadMode::Latest,
            order_mode: OrderMode::Unordered,
            predicates: vec![],
            projection: None,
            deadline: None,
            wait_for_safe: false,
            batch_size,
        }
    }

    pub fn read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    pub fn order_mode(mut self, mode: OrderMode) -> Self {
        self.order_mode = mode;
        self
    }

    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Restrict output to the named columns, in the given order.
    pub fn projection(mut self, columns: Vec<String>) -> Self {
        self.projection = Some(columns);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Allow a snapshot timestamp above safe time; the open blocks until the
    /// in-flight mutations below it drain.
    pub fn wait_for_safe(mut self) -> Self {
        self.wait_for_safe = true;
        self
    }

    /// Materialize the snapshot and return the scanner.
    pub async fn open(self) -> EngineResult<Scanner> {
        let tablet = self.tablet.clone();
        tablet.open_scanner(self).await
    }
}

/// A materialized full row plus its encoded key, as produced by row set
/// readers before merging and projection.
pub(crate) struct ScanRow {
    pub key: KeyBytes,
    pub row: Row,
}

/// Read capability over the row set variants: iterate the rows visible at
/// one snapshot, in key order.
#[async_trait]
pub(crate) trait RowSetReader: Send {
    async fn next_batch(&mut self, expected: usize) -> EngineResult<Option<Vec<ScanRow>>>;
}

/// Reader over the MemRowSet. Visible rows are captured at open; the MVCC
/// snapshot makes later chain appends invisible anyway.
pub(crate) struct MemRowSetReader {
    rows: VecDeque<(KeyBytes, Vec<Datum>, Vec<Datum>)>,
}

impl MemRowSetReader {
    pub fn new(mrs: &MemRowSet, ts: Timestamp) -> Self {
        Self {
            rows: mrs.collect_visible(ts).into(),
        }
    }
}

#[async_trait]
impl RowSetReader for MemRowSetReader {
    async fn next_batch(&mut self, expected: usize) -> EngineResult<Option<Vec<ScanRow>>> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        let take = expected.min(self.rows.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            let (key, mut key_datums, mut image) = self.rows.pop_front().unwrap();
            key_datums.append(&mut image);
            out.push(ScanRow {
                key,
                row: key_datums,
            });
        }
        Ok(Some(out))
    }
}

/// Reader over one DiskRowSet: walks ordinals in key order, materializing
/// each row at the snapshot through the undo stream and the redo overlay
/// captured at open.
pub(crate) struct DiskRowSetReader {
    rowset: Arc<DiskRowSet>,
    overlay: DeltaOverlay,
    ts: Timestamp,
    next_ordinal: u32,
}

impl DiskRowSetReader {
    pub fn new(rowset: Arc<DiskRowSet>, ts: Timestamp) -> Self {
        let overlay = rowset.delta_overlay();
        Self {
            rowset,
            overlay,
            ts,
            next_ordinal: 0,
        }
    }
}

#[async_trait]
impl RowSetReader for DiskRowSetReader {
    async fn next_batch(&mut self, expected: usize) -> EngineResult<Option<Vec<ScanRow>>> {
        let total = self.rowset.row_count();
        let mut out = Vec::new();
        // Ghost-heavy ranges may materialize nothing; keep reading until we
        // produce a row or run out.
        while out.is_empty() && self.next_ordinal < total {
            let start = self.next_ordinal;
            let count = (expected as u32).min(total - start);
            let schema = self.rowset.schema().clone();
            let columns = self
                .rowset
                .read_columns(0..schema.num_columns(), start, count)
                .await?;
            for offset in 0..count {
                let ordinal = start + offset;
                let base: Vec<Datum> = columns[schema.pk_len()..]
                    .iter()
                    .map(|col| col[offset as usize].clone())
                    .collect();
                let visible = crate::rowset::materialize_at(
                    base,
                    self.rowset.undo().entries_for(ordinal),
                    &self.overlay.redo_for(ordinal),
                    self.ts,
                );
                if let Some(image) = visible {
                    let mut row: Row = columns[..schema.pk_len()]
                        .iter()
                        .map(|col| col[offset as usize].clone())
                        .collect();
                    row.extend(image);
                    out.push(ScanRow {
                        key: self.rowset.pk().key_at(ordinal).to_vec(),
                        row,
                    });
                }
            }
            self.next_ordinal = start + count;
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }
}

/// Combines per-rowset readers: strict k-way key merge when ordered,
/// concatenation otherwise. At one snapshot at most one reader may yield a
/// given key; a duplicate is an invariant breach.
pub(crate) struct MergingReader {
    readers: Vec<Box<dyn RowSetReader>>,
    buffers: Vec<VecDeque<ScanRow>>,
    finished: Vec<bool>,
    ordered: bool,
}

impl MergingReader {
    pub fn new(readers: Vec<Box<dyn RowSetReader>>, ordered: bool) -> Self {
        let n = readers.len();
        Self {
            readers,
            buffers: (0..n).map(|_| VecDeque::new()).collect(),
            finished: vec![false; n],
            ordered,
        }
    }

    async fn fill(&mut self, idx: usize, expected: usize) -> EngineResult<()> {
        if self.buffers[idx].is_empty() && !self.finished[idx] {
            match self.readers[idx].next_batch(expected).await? {
                Some(rows) => self.buffers[idx] = rows.into(),
                None => self.finished[idx] = true,
            }
        }
        Ok(())
    }

    pub async fn next_batch(&mut self, expected: usize) -> EngineResult<Option<Vec<ScanRow>>> {
        if self.ordered {
            self.next_batch_merged(expected).await
        } else {
            self.next_batch_concat(expected).await
        }
    }

    async fn next_batch_concat(&mut self, expected: usize) -> EngineResult<Option<Vec<ScanRow>>> {
        for idx in 0..self.readers.len() {
            self.fill(idx, expected).await?;
            if let Some(row) = self.buffers[idx].pop_front() {
                let mut out = vec![row];
                while out.len() < expected {
                    if let Some(row) = self.buffers[idx].pop_front() {
                        out.push(row);
                    } else {
                        break;
                    }
                }
                return Ok(Some(out));
            }
        }
        Ok(None)
    }

    async fn next_batch_merged(&mut self, expected: usize) -> EngineResult<Option<Vec<ScanRow>>> {
        let mut out = Vec::with_capacity(expected);
        while out.len() < expected {
            let mut min_idx: Option<usize> = None;
            for idx in 0..self.readers.len() {
                self.fill(idx, expected).await?;
                let Some(head) = self.buffers[idx].front() else {
                    continue;
                };
                match min_idx {
                    None => min_idx = Some(idx),
                    Some(current) => {
                        let current_key = &self.buffers[current].front().unwrap().key;
                        if head.key < *current_key {
                            min_idx = Some(idx);
                        } else if head.key == *current_key {
                            return Err(TracedEngineError::corruption(format!(
                                "two row sets yield key {:?} at one snapshot",
                                head.key
                            )));
                        }
                    }
                }
            }
            match min_idx {
                Some(idx) => out.push(self.buffers[idx].pop_front().unwrap()),
                None => break,
            }
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }
}

/// An open scan: a pinned MVCC snapshot plus a pinned registry version,
/// drained batch by batch.
pub struct Scanner {
    schema: Arc<Schema>,
    source: MergingReader,
    predicates: Vec<(usize, Predicate)>,
    projection: Vec<usize>,
    deadline: Option<Instant>,
    batch_size: usize,
    snapshot_ts: Timestamp,
    _snapshot: MvccSnapshot,
    _pin: VersionPin,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("snapshot_ts", &self.snapshot_ts)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        schema: Arc<Schema>,
        source: MergingReader,
        predicates: Vec<(usize, Predicate)>,
        projection: Vec<usize>,
        deadline: Option<Instant>,
        batch_size: usize,
        snapshot_ts: Timestamp,
        snapshot: MvccSnapshot,
        pin: VersionPin,
    ) -> Self {
        Self {
            schema,
            source,
            predicates,
            projection,
            deadline,
            batch_size,
            snapshot_ts,
            _snapshot: snapshot,
            _pin: pin,
        }
    }

    /// The timestamp this scan reads at.
    pub fn snapshot_ts(&self) -> Timestamp {
        self.snapshot_ts
    }

    /// Next batch of projected rows, or `None` when exhausted. Exceeding the
    /// deadline fails the scan with `TimedOut`.
    pub async fn next_batch(&mut self) -> EngineResult<Option<Vec<Row>>> {
        loop {
            if let Some(deadline) = self.deadline {
                if Instant::now() > deadline {
                    return Err(TracedEngineError::timed_out(format!(
                        "scan at {} exceeded its deadline",
                        self.snapshot_ts
                    )));
                }
            }
            let Some(rows) = self.source.next_batch(self.batch_size).await? else {
                return Ok(None);
            };
            let out: Vec<Row> = rows
                .into_iter()
                .filter(|scan_row| {
                    self.predicates
                        .iter()
                        .all(|(idx, p)| p.matches(&scan_row.row[*idx]))
                })
                .map(|scan_row| {
                    self.projection
                        .iter()
                        .map(|idx| scan_row.row[*idx].clone())
                        .collect()
                })
                .collect();
            // Predicates may filter a whole batch away; keep pulling.
            if !out.is_empty() {
                return Ok(Some(out));
            }
        }
    }

    /// Drain the scan into a single vector.
    pub async fn collect_rows(&mut self) -> EngineResult<Vec<Row>> {
        let mut all = vec![];
        while let Some(mut batch) = self.next_batch().await? {
            all.append(&mut batch);
        }
        Ok(all)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Canned reader yielding fixed batches.
    struct TestReader {
        batches: VecDeque<Vec<(u8, i32)>>,
    }

    impl TestReader {
        fn new(batches: Vec<Vec<(u8, i32)>>) -> Box<dyn RowSetReader> {
            Box::new(Self {
                batches: batches.into(),
            })
        }
    }

    #[async_trait]
    impl RowSetReader for TestReader {
        async fn next_batch(&mut self, _expected: usize) -> EngineResult<Option<Vec<ScanRow>>> {
            Ok(self.batches.pop_front().map(|batch| {
                batch
                    .into_iter()
                    .map(|(key, val)| ScanRow {
                        key: vec![key],
                        row: vec![Datum::I8(key as i8), Datum::I32(val)],
                    })
                    .collect()
            }))
        }
    }

    async fn drain(mut reader: MergingReader, expected: usize) -> Vec<u8> {
        let mut keys = vec![];
        while let Some(batch) = reader.next_batch(expected).await.unwrap() {
            keys.extend(batch.into_iter().map(|row| row.key[0]));
        }
        keys
    }

    #[tokio::test]
    async fn test_merge_two_readers() {
        let reader = MergingReader::new(
            vec![
                TestReader::new(vec![vec![(1, 0), (4, 0)], vec![(6, 0)]]),
                TestReader::new(vec![vec![(2, 0), (3, 0), (5, 0)]]),
            ],
            true,
        );
        assert_eq!(drain(reader, 2).await, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_merge_with_empty_reader() {
        let reader = MergingReader::new(
            vec![
                TestReader::new(vec![]),
                TestReader::new(vec![vec![(7, 0)]]),
            ],
            true,
        );
        assert_eq!(drain(reader, 4).await, vec![7]);
    }

    #[tokio::test]
    async fn test_merge_detects_duplicate_key() {
        let mut reader = MergingReader::new(
            vec![
                TestReader::new(vec![vec![(1, 0)]]),
                TestReader::new(vec![vec![(1, 1)]]),
            ],
            true,
        );
        assert!(reader.next_batch(4).await.is_err());
    }

    #[tokio::test]
    async fn test_concat_preserves_reader_order() {
        let reader = MergingReader::new(
            vec![
                TestReader::new(vec![vec![(9, 0)]]),
                TestReader::new(vec![vec![(1, 0), (2, 0)]]),
            ],
            false,
        );
        assert_eq!(drain(reader, 4).await, vec![9, 1, 2]);
    }

    #[test]
    fn test_predicate_null_semantics() {
        let p = Predicate::new("val", PredicateOp::Eq, Datum::I32(3));
        assert!(p.matches(&Datum::I32(3)));
        assert!(!p.matches(&Datum::I32(4)));
        // NULL never matches, in either position.
        assert!(!p.matches(&Datum::Null));
        let p = Predicate::new("val", PredicateOp::Lt, Datum::Null);
        assert!(!p.matches(&Datum::I32(1)));
    }
}
