//! Fast-Path Heuristics
//!
//! Two correctness-neutral shortcuts for the I/O hot path:
//!
//! - an eligibility pre-check that lets high-confidence passthrough
//!   traffic skip the full tracking setup (the mapping decision itself is
//!   still confirmed against the table, so the externally observable
//!   routing never changes), and
//! - a sequential-stream detector that warms nearby remap-table shards
//!   when a consecutive run is observed. Purely advisory.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::health::tracker::{HealthTracker, RiskLevel};
use crate::table::RemapTable;

/// Consecutive sectors before a stream is treated as sequential.
pub const SEQUENTIAL_RUN_MIN: u64 = 8;

/// Table shards warmed ahead of a detected sequential stream.
pub const PREFETCH_AHEAD: u64 = 4;

/// Fast-path statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathStats {
    /// I/Os that qualified for the fast path
    pub hits: u64,
    /// I/Os that fell back to the full path
    pub misses: u64,
    /// Advisory prefetches issued
    pub prefetches: u64,
}

struct SeqState {
    last_sector: u64,
    run_len: u64,
}

/// Fast-path eligibility and sequential detection.
pub struct FastPath {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    prefetches: AtomicU64,
    seq: Mutex<SeqState>,
}

impl FastPath {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            prefetches: AtomicU64::new(0),
            seq: Mutex::new(SeqState {
                last_sector: u64::MAX,
                run_len: 0,
            }),
        }
    }

    /// Whether a single-sector request may skip the full tracking setup.
    ///
    /// Requires: in bounds, no existing mapping, and a sector either
    /// untracked or tracked as Safe with a clean error history. The table
    /// peek doubles as the mapping confirmation, so a true result always
    /// corresponds to a passthrough decision.
    pub fn eligible(
        &self,
        sector: u64,
        main_sectors: u64,
        table: &RemapTable,
        tracker: &HealthTracker,
    ) -> bool {
        if !self.enabled || sector >= main_sectors {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let healthy = match tracker.get(sector) {
            None => true,
            Some(h) => h.risk == RiskLevel::Safe && h.total_errors() == 0,
        };
        if healthy && table.peek(sector).is_none() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Feed the sequential detector; warms upcoming table shards once a
    /// run is established.
    pub fn note_access(&self, sector: u64, table: &RemapTable) {
        let run = {
            let mut seq = self.seq.lock();
            if seq.last_sector != u64::MAX && sector == seq.last_sector.wrapping_add(1) {
                seq.run_len += 1;
            } else {
                seq.run_len = 1;
            }
            seq.last_sector = sector;
            seq.run_len
        };
        if run >= SEQUENTIAL_RUN_MIN {
            for ahead in 1..=PREFETCH_AHEAD {
                table.prefetch(sector + ahead);
            }
            self.prefetches.fetch_add(PREFETCH_AHEAD, Ordering::Relaxed);
        }
    }

    /// Current run length of the detected stream.
    pub fn current_run(&self) -> u64 {
        self.seq.lock().run_len
    }

    pub fn stats(&self) -> FastPathStats {
        FastPathStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::table::RemapReason;
    use crate::transport::IoKind;
    use std::sync::Arc;

    fn fixtures() -> (RemapTable, HealthTracker) {
        let clock = Arc::new(ManualClock::new());
        (
            RemapTable::new(16),
            HealthTracker::new(clock, 700, 300, 3),
        )
    }

    #[test]
    fn test_untracked_sector_is_eligible() {
        let (table, tracker) = fixtures();
        let fp = FastPath::new(true);
        assert!(fp.eligible(5, 100, &table, &tracker));
        assert_eq!(fp.stats().hits, 1);
    }

    #[test]
    fn test_mapped_sector_not_eligible() {
        let (table, tracker) = fixtures();
        table.insert(5, 1000, RemapReason::Manual).unwrap();
        let fp = FastPath::new(true);
        assert!(!fp.eligible(5, 100, &table, &tracker));
    }

    #[test]
    fn test_suspect_sector_not_eligible() {
        let (table, tracker) = fixtures();
        tracker.record_io(5, IoKind::Read, false);
        let fp = FastPath::new(true);
        assert!(!fp.eligible(5, 100, &table, &tracker));
    }

    #[test]
    fn test_out_of_bounds_not_eligible() {
        let (table, tracker) = fixtures();
        let fp = FastPath::new(true);
        assert!(!fp.eligible(100, 100, &table, &tracker));
    }

    #[test]
    fn test_disabled_never_eligible() {
        let (table, tracker) = fixtures();
        let fp = FastPath::new(false);
        assert!(!fp.eligible(5, 100, &table, &tracker));
        assert_eq!(fp.stats().hits, 0);
    }

    #[test]
    fn test_sequential_detection() {
        let (table, _) = fixtures();
        let fp = FastPath::new(true);
        for sector in 100..100 + SEQUENTIAL_RUN_MIN {
            fp.note_access(sector, &table);
        }
        assert_eq!(fp.current_run(), SEQUENTIAL_RUN_MIN);
        assert!(fp.stats().prefetches >= PREFETCH_AHEAD);

        // A jump resets the run.
        fp.note_access(5000, &table);
        assert_eq!(fp.current_run(), 1);
    }
}
