use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::error::{EngineResult, TracedEngineError};
use crate::types::Timestamp;

/// Tracks in-flight and committed timestamps and hands out snapshot guards.
///
/// *Safe time* is the greatest timestamp T such that no uncommitted mutation
/// has a timestamp at or below T: readers at or below safe time can never be
/// overtaken by a late commit. *Clean time* is the timestamp below which no
/// snapshot reader may still exist; compactions consult it before reclaiming
/// tombstoned history.
pub struct MvccManager {
    clock: Arc<Clock>,
    inner: Arc<Mutex<MvccInner>>,
    safe_tx: watch::Sender<Timestamp>,
    // Kept so the channel stays open with no active waiters.
    _safe_rx: watch::Receiver<Timestamp>,
}

#[derive(Default)]
struct MvccInner {
    /// Timestamps assigned to mutations that have not yet committed.
    in_flight: BTreeSet<Timestamp>,
    /// Refcount per pinned snapshot timestamp.
    pinned: BTreeMap<Timestamp, usize>,
}

impl MvccManager {
    pub fn new(clock: Arc<Clock>) -> Self {
        let (safe_tx, safe_rx) = watch::channel(0);
        Self {
            clock,
            inner: Arc::new(Mutex::new(MvccInner::default())),
            safe_tx,
            _safe_rx: safe_rx,
        }
    }

    /// Reserve a commit timestamp and mark it in-flight.
    pub fn start_mutation(&self) -> Timestamp {
        let ts = self.clock.now();
        self.inner.lock().in_flight.insert(ts);
        ts
    }

    /// Mark `ts` committed. The mutation becomes visible to snapshots at or
    /// above `ts`.
    pub fn commit(&self, ts: Timestamp) {
        let removed = self.inner.lock().in_flight.remove(&ts);
        debug_assert!(removed, "commit of unknown timestamp {}", ts);
        let _ = self.safe_tx.send(self.safe_time());
    }

    /// Abandon an in-flight timestamp (e.g. WAL append failed before apply).
    pub fn abort(&self, ts: Timestamp) {
        self.inner.lock().in_flight.remove(&ts);
        let _ = self.safe_tx.send(self.safe_time());
    }

    pub fn safe_time(&self) -> Timestamp {
        let inner = self.inner.lock();
        match inner.in_flight.iter().next() {
            Some(min) => min - 1,
            None => self.clock.last_assigned(),
        }
    }

    /// Block until no in-flight timestamp at or below `ts` remains.
    pub async fn wait_for_safe(&self, ts: Timestamp) {
        let mut rx = self.safe_tx.subscribe();
        loop {
            if self.safe_time() >= ts {
                return;
            }
            // A send between the check and this await still wakes us.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Pin a snapshot at `ts`. All history at or above `ts` is retained while
    /// the returned guard lives. Fails for timestamps the clock has not yet
    /// assigned: in logical mode there is nothing to wait for in the future.
    pub fn snapshot(&self, ts: Timestamp) -> EngineResult<MvccSnapshot> {
        if ts > self.clock.last_assigned() {
            return Err(TracedEngineError::invalid_argument(format!(
                "snapshot timestamp {} is ahead of the clock ({})",
                ts,
                self.clock.last_assigned()
            )));
        }
        let mut inner = self.inner.lock();
        *inner.pinned.entry(ts).or_default() += 1;
        Ok(MvccSnapshot {
            ts,
            inner: self.inner.clone(),
        })
    }

    /// The oldest snapshot timestamp still pinned by a live reader.
    pub fn min_pinned(&self) -> Option<Timestamp> {
        self.inner.lock().pinned.keys().next().copied()
    }

    /// Timestamp below which no snapshot reader may exist, given the tablet's
    /// ancient-history mark (the retention policy's lower bound on readable
    /// snapshots). Compactions may elide tombstoned generations wholly below
    /// this value.
    pub fn clean_time(&self, ancient_mark: Timestamp) -> Timestamp {
        match self.min_pinned() {
            Some(pinned) => pinned.min(ancient_mark),
            None => ancient_mark,
        }
    }
}

/// A read token pinning one snapshot timestamp. Dropping it unpins.
pub struct MvccSnapshot {
    ts: Timestamp,
    inner: Arc<Mutex<MvccInner>>,
}

impl MvccSnapshot {
    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    /// Whether a mutation committed at `ts` is visible in this snapshot.
    pub fn is_visible(&self, ts: Timestamp) -> bool {
        ts <= self.ts
    }
}

impl Drop for MvccSnapshot {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        let cnt = inner
            .pinned
            .get_mut(&self.ts)
            .expect("snapshot not registered");
        *cnt -= 1;
        if *cnt == 0 {
            inner.pinned.remove(&self.ts);
        }
    }
}
