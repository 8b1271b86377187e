use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, TracedEngineError};
use crate::types::Timestamp;

/// Number of low bits reserved for the logical counter in hybrid timestamps.
const HYBRID_LOGICAL_BITS: u32 = 12;

/// Timestamp-assignment policy. The storage engine itself only consumes
/// timestamps; either mode produces values it can serve snapshots at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    /// Plain 64-bit counter, bumped on every committed mutation batch and on
    /// every scan initiation. This is the mode the fuzz harness drives.
    Logical,
    /// Physical wall-clock microseconds in the upper bits combined with a
    /// logical counter in the lower bits. `max_skew_us` bounds how far an
    /// externally observed timestamp may lead the local wall clock.
    Hybrid { max_skew_us: u64 },
}

/// Assigns commit timestamps. `now()` is strictly monotonic; `update()`
/// advances the clock past an externally observed timestamp (WAL replay uses
/// this so post-restart assignments continue above replayed commits).
pub struct Clock {
    mode: ClockMode,
    last: AtomicU64,
}

impl Clock {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            last: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Return a timestamp strictly greater than any previously returned.
    pub fn now(&self) -> Timestamp {
        match self.mode {
            ClockMode::Logical => self.last.fetch_add(1, Ordering::SeqCst) + 1,
            ClockMode::Hybrid { .. } => {
                let physical = physical_component();
                self.last
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                        Some(if physical > last {
                            physical
                        } else {
                            last + 1
                        })
                    })
                    .map(|last| {
                        if physical > last {
                            physical
                        } else {
                            last + 1
                        }
                    })
                    .unwrap()
            }
        }
    }

    /// Advance the clock so that the next `now()` exceeds `observed`.
    pub fn update(&self, observed: Timestamp) -> EngineResult<()> {
        if let ClockMode::Hybrid { max_skew_us } = self.mode {
            let local_us = physical_component() >> HYBRID_LOGICAL_BITS;
            let observed_us = observed >> HYBRID_LOGICAL_BITS;
            if observed_us > local_us + max_skew_us {
                return Err(TracedEngineError::clock_skew(format!(
                    "observed timestamp leads local clock by {}us (bound {}us)",
                    observed_us - local_us,
                    max_skew_us
                )));
            }
        }
        self.last.fetch_max(observed, Ordering::SeqCst);
        Ok(())
    }

    /// The most recently assigned timestamp (0 before any assignment).
    pub fn last_assigned(&self) -> Timestamp {
        self.last.load(Ordering::SeqCst)
    }
}

fn physical_component() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("wall clock before unix epoch")
        .as_micros() as u64;
    micros << HYBRID_LOGICAL_BITS
}
