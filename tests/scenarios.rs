//! End-to-end scenarios: scripted operation sequences checked against a
//! shadow model after every batch, flush, compaction, and restart.

mod common;

use common::{enc, kv_schema, pk_only_schema, Harness, Op};
use Op::*;

#[tokio::test]
async fn test_insert_then_scan() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Insert(1, 4), FlushOps]).await;
    assert_eq!(h.scan_latest().await, vec![(1, Some(4))]);
    assert_eq!(h.get_row(1).await, Some((1, Some(4))));
    assert_eq!(h.get_row(2).await, None);
}

#[tokio::test]
async fn test_insert_delete_absent() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Insert(1, 4), FlushOps, Delete(1), FlushOps]).await;
    assert_eq!(h.scan_latest().await, vec![]);
}

#[tokio::test]
async fn test_insert_update_latest_wins() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Insert(1, 4), FlushOps, Update(1, 6), FlushOps]).await;
    assert_eq!(h.scan_latest().await, vec![(1, Some(6))]);
}

#[tokio::test]
async fn test_upsert_on_existing_equals_update() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Insert(1, 4), FlushOps, Upsert(1, 6), FlushOps]).await;
    assert_eq!(h.scan_latest().await, vec![(1, Some(6))]);
}

#[tokio::test]
async fn test_upsert_pk_only_preserves_and_inserts() {
    let mut h = Harness::new(kv_schema()).await;
    // On an existing row the value is untouched; on an absent key the row
    // appears with a NULL value column.
    h.run(&[
        Insert(1, 4),
        FlushOps,
        UpsertPkOnly(1),
        UpsertPkOnly(2),
        FlushOps,
    ])
    .await;
    assert_eq!(h.scan_latest().await, vec![(1, Some(4)), (2, None)]);
}

#[tokio::test]
async fn test_delete_then_reinsert_in_memory() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Insert(1, 3), FlushOps, Delete(1), Insert(1, 8), FlushOps])
        .await;
    assert_eq!(h.scan_latest().await, vec![(1, Some(8))]);
}

// Scenario 1: delete-reinsert across flushes ends with one live row carrying
// the reinserted value.
#[tokio::test]
async fn test_delete_reinsert_across_flushes() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[
        Insert(0, 0),
        FlushOps,
        FlushMrs,
        Delete(0),
        Insert(0, 2),
        FlushOps,
        FlushMrs,
        CompactAll,
    ])
    .await;
    assert_eq!(h.scan_latest().await, vec![(0, enc(2))]);
}

// Scenario 2: a PK-only upsert keeps the old value across a restart, and
// history before the upsert still reads back.
#[tokio::test]
async fn test_upsert_pk_only_preserves_value_across_restart() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Insert(1, 0), FlushOps, UpsertPkOnly(1), FlushOps, Restart])
        .await;
    assert_eq!(h.scan_latest().await, vec![(1, Some(0))]);
    let first_ts = *h.saved.keys().next().unwrap();
    assert_eq!(h.scan_at(first_ts).await, vec![(1, Some(0))]);
}

// Scenario 3: PK-only schema with empty changelists must not crash.
#[tokio::test]
async fn test_pk_only_schema_empty_changelist() {
    let mut h = Harness::new(pk_only_schema()).await;
    h.run(&[
        UpsertPkOnly(1),
        Delete(1),
        UpsertPkOnly(1),
        UpsertPkOnly(1),
        FlushOps,
    ])
    .await;
    assert_eq!(h.scan_latest().await, vec![(1, None)]);
}

// Scenario 4: a reinsert survives minor delta compaction, merging compaction
// and two restarts.
#[tokio::test]
async fn test_reinsert_survives_compactions_and_restarts() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[
        Insert(1, 0),
        FlushOps,
        FlushMrs,
        Update(1, 2),
        Restart,
        FlushOps,
        FlushDeltas,
        Insert(0, 4),
        Delete(1),
        Insert(1, 6),
        FlushOps,
        FlushMrs,
        Restart,
        MinorCompactDeltas,
        CompactAll,
        Update(1, 8),
        FlushOps,
    ])
    .await;
    assert_eq!(h.scan_latest().await, vec![(0, enc(4)), (1, enc(8))]);
}

// Scenario 5: repeated delete-insert cycles keep undo order intact; the key
// ends up absent while every recorded snapshot still reads its own value.
#[tokio::test]
async fn test_undo_order_under_repeated_delete_insert() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[
        Insert(0, 0),
        Delete(0),
        FlushOps,
        FlushMrs,
        Insert(0, 1),
        Delete(0),
        Insert(0, 2),
        FlushOps,
        FlushMrs,
        CompactAll,
        Delete(0),
        FlushOps,
        CompactAll,
    ])
    .await;
    assert_eq!(h.scan_latest().await, vec![]);
}

// Scenario 6: snapshots far in the past survive arbitrary later compactions.
#[tokio::test]
async fn test_snapshots_far_in_the_past() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Insert(1, 0), FlushOps]).await;
    h.run(&[Update(1, 2), Insert(2, 4), FlushOps]).await;
    h.run(&[Delete(1), FlushOps]).await;
    let timestamps: Vec<_> = h.saved.keys().copied().collect();
    let [t1, t2, t3] = timestamps[..] else {
        panic!("expected three recorded timestamps")
    };

    h.run(&[FlushMrs, CompactAll, Insert(9, 6), FlushOps, FlushMrs, CompactAll])
        .await;

    assert_eq!(h.scan_at(t1).await, vec![(1, Some(0))]);
    assert_eq!(h.scan_at(t2).await, vec![(1, Some(2)), (2, Some(4))]);
    assert_eq!(h.scan_at(t3).await, vec![(2, Some(4))]);
}

// Odd values encode as NULL; make sure NULL round-trips through flushes,
// updates and compactions.
#[tokio::test]
async fn test_null_values_round_trip() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[
        Insert(1, 1),
        Insert(2, 2),
        FlushOps,
        FlushMrs,
        Update(2, 3),
        FlushOps,
        FlushDeltas,
        MajorCompactDeltas,
        CompactAll,
    ])
    .await;
    assert_eq!(h.scan_latest().await, vec![(1, None), (2, None)]);
}

#[tokio::test]
async fn test_major_compaction_folds_updates() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[
        Insert(1, 0),
        Insert(2, 10),
        FlushOps,
        FlushMrs,
        Update(1, 2),
        FlushOps,
        Update(1, 4),
        FlushOps,
        FlushDeltas,
        MajorCompactDeltas,
        Update(1, 6),
        FlushOps,
        Restart,
    ])
    .await;
    assert_eq!(h.scan_latest().await, vec![(1, Some(6)), (2, Some(10))]);
}

#[tokio::test]
async fn test_checkpoint_truncates_wal_and_preserves_state() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[
        Insert(1, 2),
        Insert(2, 4),
        FlushOps,
        FlushMrs,
        Update(1, 6),
        FlushOps,
        Checkpoint,
        Insert(3, 8),
        FlushOps,
        Restart,
    ])
    .await;
    assert_eq!(
        h.scan_latest().await,
        vec![(1, Some(6)), (2, Some(4)), (3, Some(8))]
    );
}

#[tokio::test]
async fn test_restart_with_no_writes() {
    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Restart]).await;
    assert_eq!(h.scan_latest().await, vec![]);
}

#[tokio::test]
async fn test_unordered_scan_returns_same_set() {
    use tabulet::OrderMode;

    let mut h = Harness::new(kv_schema()).await;
    h.run(&[
        Insert(5, 2),
        Insert(1, 4),
        FlushOps,
        FlushMrs,
        Insert(3, 6),
        Delete(5),
        FlushOps,
    ])
    .await;

    let mut scanner = h
        .tablet
        .scan()
        .order_mode(OrderMode::Unordered)
        .open()
        .await
        .unwrap();
    let mut rows = scanner.collect_rows().await.unwrap();
    rows.sort();
    let mut ordered = h
        .tablet
        .scan()
        .order_mode(OrderMode::OrderedByPk)
        .open()
        .await
        .unwrap();
    assert_eq!(rows, ordered.collect_rows().await.unwrap());
}

#[tokio::test]
async fn test_projection_and_predicates() {
    use tabulet::{Datum, OrderMode, Predicate, PredicateOp};

    let mut h = Harness::new(kv_schema()).await;
    h.run(&[
        Insert(1, 2),
        Insert(2, 4),
        Insert(3, 6),
        Insert(4, 7),
        FlushOps,
        FlushMrs,
    ])
    .await;

    let mut scanner = h
        .tablet
        .scan()
        .order_mode(OrderMode::OrderedByPk)
        .predicate(Predicate::new("key", PredicateOp::Ge, Datum::I32(2)))
        .predicate(Predicate::new("val", PredicateOp::Lt, Datum::I32(7)))
        .projection(vec!["val".into(), "key".into()])
        .open()
        .await
        .unwrap();
    let rows = scanner.collect_rows().await.unwrap();
    // Key 4 has a NULL value (7 is odd), so the val predicate drops it.
    assert_eq!(
        rows,
        vec![
            vec![Datum::I32(4), Datum::I32(2)],
            vec![Datum::I32(6), Datum::I32(3)],
        ]
    );

    // Unknown columns are invalid arguments, not crashes.
    assert!(h
        .tablet
        .scan()
        .predicate(Predicate::new("nope", PredicateOp::Eq, Datum::I32(1)))
        .open()
        .await
        .is_err());
    assert!(h
        .tablet
        .scan()
        .projection(vec!["nope".into()])
        .open()
        .await
        .is_err());
}

#[tokio::test]
async fn test_scan_deadline_times_out() {
    use std::time::Duration;
    use tabulet::EngineError;

    let mut h = Harness::new(kv_schema()).await;
    h.run(&[Insert(1, 2), FlushOps]).await;

    let mut scanner = h
        .tablet
        .scan()
        .deadline(Duration::ZERO)
        .open()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let err = scanner.next_batch().await.unwrap_err();
    assert!(matches!(err.kind(), EngineError::TimedOut(_)));
}

// With a zero retention window, a tombstoned key whose history is fully
// below clean time disappears entirely under merging compaction, and
// snapshots below the ancient history mark are refused.
#[tokio::test]
async fn test_tombstones_reclaimed_outside_retention_window() {
    use tabulet::{Datum, HistoryRetention, ReadMode, Tablet, TabletOptions};

    let dir = tempfile::tempdir().unwrap();
    let mut options = TabletOptions::default_for_test(dir.path().join("tablet"));
    options.history_retention = HistoryRetention::Window(0);
    let tablet = Tablet::open(options, kv_schema()).await.unwrap();

    let mut session = tablet.new_session();
    session.insert(vec![Datum::I32(1), Datum::I32(2)]);
    let insert_ts = session.flush().await.unwrap().commit_ts;
    tablet.flush_mem_rowset().await.unwrap();
    let mut session = tablet.new_session();
    session.delete(vec![Datum::I32(1)]);
    session.flush().await.unwrap();

    // The only key is dead and its whole history is below clean time, so the
    // merge emits no output row set at all.
    assert_eq!(tablet.compact_all().await.unwrap(), None);
    let mut scanner = tablet.scan().open().await.unwrap();
    assert!(scanner.collect_rows().await.unwrap().is_empty());

    let err = tablet
        .scan()
        .read_mode(ReadMode::AtSnapshot(insert_ts))
        .open()
        .await
        .unwrap_err();
    assert!(format!("{}", err).contains("ancient"));
}

// A pinned snapshot holds clean time down: the ghost survives the merge and
// the old snapshot keeps reading its value.
#[tokio::test]
async fn test_pinned_snapshot_blocks_tombstone_reclaim() {
    use tabulet::{Datum, HistoryRetention, OrderMode, ReadMode, Tablet, TabletOptions};

    let dir = tempfile::tempdir().unwrap();
    let mut options = TabletOptions::default_for_test(dir.path().join("tablet"));
    options.history_retention = HistoryRetention::Window(0);
    let tablet = Tablet::open(options, kv_schema()).await.unwrap();

    let mut session = tablet.new_session();
    session.insert(vec![Datum::I32(1), Datum::I32(2)]);
    let insert_ts = session.flush().await.unwrap().commit_ts;
    tablet.flush_mem_rowset().await.unwrap();
    let mut session = tablet.new_session();
    session.delete(vec![Datum::I32(1)]);
    session.flush().await.unwrap();

    let mut pinned = tablet
        .scan()
        .read_mode(ReadMode::AtSnapshot(insert_ts))
        .order_mode(OrderMode::OrderedByPk)
        .open()
        .await
        .unwrap();

    // The open scanner pins the insert timestamp; the ghost must survive.
    assert!(tablet.compact_all().await.unwrap().is_some());
    let rows = pinned.collect_rows().await.unwrap();
    assert_eq!(rows, vec![vec![Datum::I32(1), Datum::I32(2)]]);
}

#[tokio::test]
async fn test_row_errors_do_not_abort_batch() {
    let h = Harness::new(kv_schema()).await;
    let mut session = h.tablet.new_session();
    session.insert(vec![tabulet::Datum::I32(1), tabulet::Datum::I32(2)]);
    session.insert(vec![tabulet::Datum::I32(1), tabulet::Datum::I32(4)]);
    session.delete(vec![tabulet::Datum::I32(9)]);
    let result = session.flush().await.unwrap();
    assert_eq!(result.per_row[0], Ok(()));
    assert_eq!(result.per_row[1], Err(tabulet::RowError::AlreadyPresent));
    assert_eq!(result.per_row[2], Err(tabulet::RowError::NotFound));
    assert_eq!(h.scan_latest().await, vec![(1, Some(2))]);
}
