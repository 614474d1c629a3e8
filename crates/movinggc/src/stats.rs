use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::io::MoveOutcome;
use crate::select::DeviceSelection;

/// Cumulative collector counters, shared by the driver and in-flight
/// relocations.
#[derive(Debug, Default)]
pub struct GcStats {
    passes: AtomicU64,
    buckets_marked: AtomicU64,
    keys_admitted: AtomicU64,
    keys_moved: AtomicU64,
    sectors_moved: AtomicU64,
    collisions: AtomicU64,
    stale: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    alloc_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStatsSnapshot {
    pub passes: u64,
    pub buckets_marked: u64,
    pub keys_admitted: u64,
    pub keys_moved: u64,
    pub sectors_moved: u64,
    pub collisions: u64,
    pub stale: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub alloc_failures: u64,
}

impl GcStats {
    pub(crate) fn record_pass(&self, buckets_marked: u64) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.buckets_marked
            .fetch_add(buckets_marked, Ordering::Relaxed);
    }

    pub(crate) fn record_admitted(&self) {
        self.keys_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_alloc_failure(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: &MoveOutcome) {
        match outcome {
            MoveOutcome::Moved { sectors } => {
                self.keys_moved.fetch_add(1, Ordering::Relaxed);
                self.sectors_moved
                    .fetch_add(u64::from(*sectors), Ordering::Relaxed);
            }
            MoveOutcome::Collision => {
                self.collisions.fetch_add(1, Ordering::Relaxed);
            }
            MoveOutcome::Stale => self.record_stale(),
            MoveOutcome::Failed(err) if err.is_read() => {
                self.read_errors.fetch_add(1, Ordering::Relaxed);
            }
            MoveOutcome::Failed(_) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            buckets_marked: self.buckets_marked.load(Ordering::Relaxed),
            keys_admitted: self.keys_admitted.load(Ordering::Relaxed),
            keys_moved: self.keys_moved.load(Ordering::Relaxed),
            sectors_moved: self.sectors_moved.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
        }
    }
}

/// Why a pass stopped admitting keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStop {
    /// The scan reached the end of the index.
    #[default]
    Exhausted,
    /// The collector was disabled; nothing was selected.
    Disabled,
    /// The cache set began shutting down or the collector was shut down.
    Shutdown,
    /// A copy buffer could not be allocated.
    BufferExhausted,
    /// Bucket state became unusable.
    Aborted,
}

/// Summary of one collection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub devices: Vec<DeviceSelection>,
    pub stop: PassStop,
    pub admitted: u64,
    pub moved: u64,
    pub sectors_moved: u64,
    pub collisions: u64,
    /// Keys dropped as stale, before or after their read.
    pub stale: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    /// Relocation tasks that panicked.
    pub lost: u64,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

impl PassReport {
    pub fn buckets_marked(&self) -> usize {
        self.devices.iter().map(|d| d.buckets_marked).sum()
    }

    pub fn sectors_selected(&self) -> u64 {
        self.devices.iter().map(|d| d.sectors_to_move).sum()
    }

    pub(crate) fn record_outcome(&mut self, outcome: &MoveOutcome) {
        match outcome {
            MoveOutcome::Moved { sectors } => {
                self.moved += 1;
                self.sectors_moved += u64::from(*sectors);
            }
            MoveOutcome::Collision => self.collisions += 1,
            MoveOutcome::Stale => self.stale += 1,
            MoveOutcome::Failed(err) if err.is_read() => self.read_errors += 1,
            MoveOutcome::Failed(_) => self.write_errors += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MoveError;
    use common::IoError;

    #[test]
    fn outcomes_land_in_matching_counters() {
        let stats = GcStats::default();
        let mut report = PassReport::default();
        let outcomes = [
            MoveOutcome::Moved { sectors: 8 },
            MoveOutcome::Moved { sectors: 4 },
            MoveOutcome::Collision,
            MoveOutcome::Stale,
            MoveOutcome::Failed(MoveError::Read {
                source: IoError::Unavailable("gone".into()),
            }),
            MoveOutcome::Failed(MoveError::Write {
                source: IoError::NoSpace { reserve: "moving-gc" },
            }),
        ];
        for outcome in &outcomes {
            stats.record_outcome(outcome);
            report.record_outcome(outcome);
        }

        let snap = stats.snapshot();
        assert_eq!(snap.keys_moved, 2);
        assert_eq!(snap.sectors_moved, 12);
        assert_eq!((snap.collisions, snap.stale), (1, 1));
        assert_eq!((snap.read_errors, snap.write_errors), (1, 1));
        assert_eq!(report.moved, 2);
        assert_eq!(report.sectors_moved, 12);
        assert_eq!((report.read_errors, report.write_errors), (1, 1));
    }

    #[test]
    fn report_serializes_elapsed_as_millis() {
        let report = PassReport {
            elapsed: Duration::from_millis(1500),
            ..PassReport::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed"], 1500);
        assert_eq!(json["stop"], "exhausted");
    }
}
