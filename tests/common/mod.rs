//! Shared harness for the end-to-end scenario tests: drives a tablet through
//! scripted operation sequences while maintaining a shadow model of the
//! expected state per commit timestamp, then checks latest and historical
//! scans against it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tempfile::TempDir;

use tabulet::{
    ColumnDesc, DataType, Datum, OrderMode, ReadMode, Schema, Tablet, TabletOptions, Timestamp,
};

/// The scripted operations, mirroring the maintenance surface the engine
/// exposes. Mutations buffer until `FlushOps` submits them as one batch.
#[derive(Debug, Clone, Copy)]
pub enum Op {
    Insert(i32, i32),
    InsertPkOnly(i32),
    Upsert(i32, i32),
    UpsertPkOnly(i32),
    Update(i32, i32),
    Delete(i32),
    FlushOps,
    FlushMrs,
    FlushDeltas,
    MinorCompactDeltas,
    MajorCompactDeltas,
    CompactAll,
    Restart,
    Checkpoint,
}

/// Value encoding rule used throughout: even values store themselves, odd
/// values store NULL.
pub fn enc(val: i32) -> Option<i32> {
    if val % 2 == 0 {
        Some(val)
    } else {
        None
    }
}

pub fn kv_schema() -> Schema {
    Schema::new(
        vec![
            ColumnDesc::new("key", DataType::I32, false),
            ColumnDesc::new("val", DataType::I32, true),
        ],
        1,
    )
    .unwrap()
}

pub fn pk_only_schema() -> Schema {
    Schema::new(vec![ColumnDesc::new("key", DataType::I32, false)], 1).unwrap()
}

type ShadowState = BTreeMap<i32, Option<i32>>;

pub struct Harness {
    _dir: TempDir,
    options: TabletOptions,
    schema: Schema,
    pub tablet: Arc<Tablet>,
    pending: Vec<Op>,
    /// Expected live rows right now.
    shadow: ShadowState,
    /// Expected live rows keyed by commit timestamp.
    pub saved: BTreeMap<Timestamp, ShadowState>,
}

impl Harness {
    pub async fn new(schema: Schema) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::tempdir().unwrap();
        let options = TabletOptions::default_for_test(dir.path().join("tablet"));
        let tablet = Tablet::open(options.clone(), schema.clone()).await.unwrap();
        Self {
            _dir: dir,
            options,
            schema,
            tablet,
            pending: vec![],
            shadow: BTreeMap::new(),
            saved: BTreeMap::new(),
        }
    }

    fn pk_only(&self) -> bool {
        self.schema.num_value_columns() == 0
    }

    fn row(&self, key: i32, val: Option<i32>) -> Vec<Datum> {
        if self.pk_only() {
            vec![Datum::I32(key)]
        } else {
            vec![
                Datum::I32(key),
                match val {
                    Some(v) => Datum::I32(v),
                    None => Datum::Null,
                },
            ]
        }
    }

    /// Run a script, verifying consistency after every barrier operation.
    pub async fn run(&mut self, ops: &[Op]) {
        for op in ops {
            self.step(*op).await;
        }
        self.check_all().await;
    }

    pub async fn step(&mut self, op: Op) {
        match op {
            Op::Insert(..)
            | Op::InsertPkOnly(..)
            | Op::Upsert(..)
            | Op::UpsertPkOnly(..)
            | Op::Update(..)
            | Op::Delete(..) => self.pending.push(op),
            Op::FlushOps => self.flush_ops().await,
            Op::FlushMrs => {
                self.tablet.flush_mem_rowset().await.unwrap();
                self.check_all().await;
            }
            Op::FlushDeltas => {
                self.tablet.flush_biggest_dms().await.unwrap();
                self.check_all().await;
            }
            Op::MinorCompactDeltas => {
                self.tablet.minor_compact_deltas().await.unwrap();
                self.check_all().await;
            }
            Op::MajorCompactDeltas => {
                self.tablet.major_compact_deltas().await.unwrap();
                self.check_all().await;
            }
            Op::CompactAll => {
                self.tablet.compact_all().await.unwrap();
                self.check_all().await;
            }
            Op::Restart => {
                self.restart().await;
                self.check_all().await;
            }
            Op::Checkpoint => {
                self.tablet.checkpoint().await.unwrap();
                self.check_all().await;
            }
        }
    }

    async fn flush_ops(&mut self) {
        let ops = std::mem::take(&mut self.pending);
        assert!(!ops.is_empty(), "script flushed an empty batch");

        let mut session = self.tablet.new_session();
        for op in &ops {
            match *op {
                Op::Insert(k, v) => session.insert(self.row(k, enc(v))),
                Op::InsertPkOnly(k) => session.insert_pk_only(vec![Datum::I32(k)]),
                Op::Upsert(k, v) => session.upsert(self.row(k, enc(v))),
                Op::UpsertPkOnly(k) => session.upsert_pk_only(vec![Datum::I32(k)]),
                Op::Update(k, v) => session.update(
                    vec![Datum::I32(k)],
                    vec![(
                        0,
                        match enc(v) {
                            Some(v) => Datum::I32(v),
                            None => Datum::Null,
                        },
                    )],
                ),
                Op::Delete(k) => session.delete(vec![Datum::I32(k)]),
                _ => unreachable!("non-mutation op in pending buffer"),
            }
        }
        let result = session.flush().await.unwrap();

        // Mirror the batch on the shadow model, op by op, checking per-row
        // statuses as we go.
        for (op, row_result) in ops.iter().zip(&result.per_row) {
            match *op {
                Op::Insert(k, v) => {
                    assert_eq!(row_result, &Ok(()), "insert {} rejected", k);
                    let prev = self.shadow.insert(k, self.value_for(enc(v)));
                    assert!(prev.is_none(), "script inserted live key {}", k);
                }
                Op::InsertPkOnly(k) => {
                    assert_eq!(row_result, &Ok(()));
                    let prev = self.shadow.insert(k, None);
                    assert!(prev.is_none());
                }
                Op::Upsert(k, v) => {
                    assert_eq!(row_result, &Ok(()));
                    self.shadow.insert(k, self.value_for(enc(v)));
                }
                Op::UpsertPkOnly(k) => {
                    assert_eq!(row_result, &Ok(()));
                    self.shadow.entry(k).or_insert(None);
                }
                Op::Update(k, v) => {
                    assert_eq!(row_result, &Ok(()), "update {} rejected", k);
                    assert!(self.shadow.contains_key(&k), "script updated absent key");
                    self.shadow.insert(k, self.value_for(enc(v)));
                }
                Op::Delete(k) => {
                    assert_eq!(row_result, &Ok(()), "delete {} rejected", k);
                    let prev = self.shadow.remove(&k);
                    assert!(prev.is_some(), "script deleted absent key {}", k);
                }
                _ => unreachable!(),
            }
        }

        self.saved.insert(result.commit_ts, self.shadow.clone());
        self.check_all().await;
    }

    fn value_for(&self, val: Option<i32>) -> Option<i32> {
        if self.pk_only() {
            None
        } else {
            val
        }
    }

    /// Tear the tablet down and reopen it from disk, replaying the log.
    pub async fn restart(&mut self) {
        self.tablet.shutdown().await.unwrap();
        let options = self.options.clone();
        let schema = self.schema.clone();
        self.tablet = Tablet::open(options, schema).await.unwrap();
    }

    /// Scan at `ts`, ordered by key, decoded into `(key, value)` pairs.
    pub async fn scan_at(&self, ts: Timestamp) -> Vec<(i32, Option<i32>)> {
        let mut scanner = self
            .tablet
            .scan()
            .read_mode(ReadMode::AtSnapshot(ts))
            .order_mode(OrderMode::OrderedByPk)
            .open()
            .await
            .unwrap();
        let rows = scanner.collect_rows().await.unwrap();
        rows.into_iter().map(|row| self.decode_row(row)).collect()
    }

    pub async fn scan_latest(&self) -> Vec<(i32, Option<i32>)> {
        let mut scanner = self
            .tablet
            .scan()
            .order_mode(OrderMode::OrderedByPk)
            .open()
            .await
            .unwrap();
        let rows = scanner.collect_rows().await.unwrap();
        rows.into_iter().map(|row| self.decode_row(row)).collect()
    }

    fn decode_row(&self, row: Vec<Datum>) -> (i32, Option<i32>) {
        let key = match &row[0] {
            Datum::I32(k) => *k,
            other => panic!("unexpected key datum {:?}", other),
        };
        let val = if self.pk_only() {
            None
        } else {
            match &row[1] {
                Datum::I32(v) => Some(*v),
                Datum::Null => None,
                other => panic!("unexpected value datum {:?}", other),
            }
        };
        (key, val)
    }

    fn expected_at(&self, ts: Timestamp) -> Vec<(i32, Option<i32>)> {
        match self.saved.range(..=ts).next_back() {
            Some((_, state)) => state.iter().map(|(k, v)| (*k, *v)).collect(),
            None => vec![],
        }
    }

    /// Latest scan equals the shadow model; every recorded snapshot equals
    /// what the shadow model recorded at that timestamp.
    pub async fn check_all(&self) {
        let latest = self.scan_latest().await;
        let expected: Vec<_> = self.shadow.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(latest, expected, "latest scan diverged from shadow model");

        // Unique live key and strict order come with the comparison: the
        // shadow model is a map.
        for ts in self.saved.keys() {
            let found = self.scan_at(*ts).await;
            assert_eq!(
                found,
                self.expected_at(*ts),
                "snapshot scan at {} diverged",
                ts
            );
        }
    }

    /// Point read through an equality predicate on the key column.
    pub async fn get_row(&self, key: i32) -> Option<(i32, Option<i32>)> {
        let mut scanner = self
            .tablet
            .scan()
            .order_mode(OrderMode::OrderedByPk)
            .predicate(tabulet::Predicate::new(
                "key",
                tabulet::PredicateOp::Eq,
                Datum::I32(key),
            ))
            .open()
            .await
            .unwrap();
        let rows = scanner.collect_rows().await.unwrap();
        assert!(rows.len() <= 1);
        rows.into_iter().next().map(|row| self.decode_row(row))
    }
}
