//! Health Tracker
//!
//! Per-sector rolling statistics updated once per I/O completion (real
//! traffic) or per scan probe (background scanner). Sectors are tracked
//! lazily from first sight; eviction is an explicit maintenance call,
//! never implicit. Sharded by sector, same discipline as the remap table,
//! so updates to different sectors rarely contend.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::table::{SectorMap, SectorStatus};
use crate::transport::IoKind;

// =============================================================================
// Constants
// =============================================================================

/// Maximum (and initial) health score.
pub const SCORE_MAX: u16 = 1000;

/// Bonus applied to frequently accessed, error-free sectors.
pub const CLEAN_FREQUENT_BONUS: i32 = 50;

/// Accesses required before the clean-sector bonus applies.
pub const FREQUENT_ACCESS_MIN: u32 = 100;

/// Penalty applied when a sector has not been scanned recently.
pub const STALE_SCAN_PENALTY: i32 = 50;

/// Age after which a scan is considered stale.
pub const STALE_SCAN_SECS: u64 = 3600;

/// Score movement that flips the trend out of Stable.
pub const TREND_DELTA: u16 = 50;

// =============================================================================
// Types
// =============================================================================

/// Direction a sector's health is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

/// Coarse risk bucket derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Safe,
    Monitor,
    Caution,
    Danger,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Safe => write!(f, "safe"),
            RiskLevel::Monitor => write!(f, "monitor"),
            RiskLevel::Caution => write!(f, "caution"),
            RiskLevel::Danger => write!(f, "danger"),
        }
    }
}

/// Rolling health state for one tracked sector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorHealth {
    /// 0..=1000, higher is healthier
    pub score: u16,
    pub read_errors: u16,
    pub write_errors: u16,
    pub access_count: u32,
    /// Monotonic seconds of the last scan probe
    pub last_scan_secs: u64,
    /// Monotonic seconds of the last access of any kind
    pub last_access_secs: u64,
    /// Monotonic seconds of the last error, if any
    pub last_error_secs: Option<u64>,
    pub trend: Trend,
    pub risk: RiskLevel,
    pub status: SectorStatus,
    /// Scan probes observed, saturating
    pub scan_count: u8,
    /// When the sector was first tracked
    pub first_seen_secs: u64,
}

impl SectorHealth {
    fn new(now_secs: u64) -> Self {
        Self {
            score: SCORE_MAX,
            read_errors: 0,
            write_errors: 0,
            access_count: 0,
            last_scan_secs: now_secs,
            last_access_secs: now_secs,
            last_error_secs: None,
            trend: Trend::Stable,
            risk: RiskLevel::Safe,
            status: SectorStatus::Unknown,
            scan_count: 0,
            first_seen_secs: now_secs,
        }
    }

    /// Total errors of both kinds.
    pub fn total_errors(&self) -> u32 {
        self.read_errors as u32 + self.write_errors as u32
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Concurrent per-sector health map with system-wide aggregates.
pub struct HealthTracker {
    sectors: SectorMap<SectorHealth>,
    clock: Arc<dyn Clock>,
    warning_threshold: u16,
    danger_threshold: u16,
    /// Errors on one sector before it is classified Bad; shared with the
    /// auto-remap predicate and adjustable at runtime.
    error_threshold: AtomicU32,
    /// Sectors currently at Caution or worse
    active_warnings: AtomicU64,
    /// Sectors currently at Danger
    high_risk: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

impl HealthTracker {
    pub fn new(
        clock: Arc<dyn Clock>,
        warning_threshold: u16,
        danger_threshold: u16,
        error_threshold: u32,
    ) -> Self {
        Self {
            sectors: SectorMap::new(),
            clock,
            warning_threshold,
            danger_threshold,
            error_threshold: AtomicU32::new(error_threshold),
            active_warnings: AtomicU64::new(0),
            high_risk: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    /// Pure risk derivation from a score against the two thresholds.
    ///
    /// Monitor occupies the band between the warning threshold and the
    /// midpoint of the warning and danger thresholds.
    pub fn risk_for(&self, score: u16) -> RiskLevel {
        let midpoint = (self.warning_threshold + self.danger_threshold) / 2;
        if score >= self.warning_threshold {
            RiskLevel::Safe
        } else if score >= midpoint {
            RiskLevel::Monitor
        } else if score >= self.danger_threshold {
            RiskLevel::Caution
        } else {
            RiskLevel::Danger
        }
    }

    /// Record a completed I/O (success or failure) for a sector.
    pub fn record_io(&self, sector: u64, kind: IoKind, ok: bool) -> SectorHealth {
        if !ok {
            match kind {
                IoKind::Read => self.read_errors.fetch_add(1, Ordering::Relaxed),
                IoKind::Write => self.write_errors.fetch_add(1, Ordering::Relaxed),
            };
        }
        self.apply(sector, Some(kind), ok, false)
    }

    /// Record a background scan probe for a sector.
    pub fn record_scan(&self, sector: u64, ok: bool) -> SectorHealth {
        if !ok {
            self.read_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.apply(sector, Some(IoKind::Read), ok, true)
    }

    /// Mark a sector as remapped; its health entry stays for history but
    /// the status pins at Remapped.
    pub fn mark_remapped(&self, sector: u64) {
        let now = self.clock.now_secs();
        self.sectors.update_or_insert_with(
            sector,
            || SectorHealth::new(now),
            |h| h.status = SectorStatus::Remapped,
        );
    }

    /// Undo a Remapped pin (mapping removed); status reverts to whatever
    /// the error history implies.
    pub fn unmark_remapped(&self, sector: u64) {
        let threshold = self.error_threshold.load(Ordering::Relaxed);
        self.sectors.update(sector, |h| {
            if h.status == SectorStatus::Remapped {
                h.status = if h.total_errors() >= threshold {
                    SectorStatus::Bad
                } else if h.total_errors() > 0 {
                    SectorStatus::Suspect
                } else {
                    SectorStatus::Good
                };
            }
        });
    }

    fn apply(&self, sector: u64, kind: Option<IoKind>, ok: bool, scan: bool) -> SectorHealth {
        let now = self.clock.now_secs();
        let error_threshold = self.error_threshold.load(Ordering::Relaxed);
        let warn_before_after = self.sectors.update_or_insert_with(
            sector,
            || SectorHealth::new(now),
            |h| {
                let prev_risk = h.risk;
                let prev_score = h.score;

                h.access_count = h.access_count.saturating_add(1);
                h.last_access_secs = now;
                if scan {
                    h.scan_count = h.scan_count.saturating_add(1);
                    h.last_scan_secs = now;
                }
                if !ok {
                    match kind {
                        Some(IoKind::Write) => {
                            h.write_errors = h.write_errors.saturating_add(1)
                        }
                        _ => h.read_errors = h.read_errors.saturating_add(1),
                    }
                    h.last_error_secs = Some(now);
                }

                h.score = Self::compute_score(h, now);
                h.risk = self.risk_for(h.score);
                h.trend = if h.score > prev_score.saturating_add(TREND_DELTA) {
                    Trend::Improving
                } else if h.score.saturating_add(TREND_DELTA) < prev_score {
                    Trend::Declining
                } else {
                    Trend::Stable
                };
                if h.status != SectorStatus::Remapped {
                    h.status = if h.total_errors() >= error_threshold as u32 {
                        SectorStatus::Bad
                    } else if h.total_errors() > 0 {
                        SectorStatus::Suspect
                    } else {
                        SectorStatus::Good
                    };
                }

                (prev_risk, h.risk, h.clone())
            },
        );

        let (prev_risk, new_risk, snapshot) = warn_before_after;
        self.adjust_aggregates(prev_risk, new_risk, sector);
        snapshot
    }

    /// Maintain the warning and high-risk counters on risk crossings,
    /// saturating at zero.
    fn adjust_aggregates(&self, prev: RiskLevel, new: RiskLevel, sector: u64) {
        let was_warning = prev >= RiskLevel::Caution;
        let is_warning = new >= RiskLevel::Caution;
        if !was_warning && is_warning {
            self.active_warnings.fetch_add(1, Ordering::Relaxed);
            debug!(sector, risk = %new, "sector crossed into warning range");
        } else if was_warning && !is_warning {
            let _ = self.active_warnings.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |v| v.checked_sub(1),
            );
        }

        let was_danger = prev == RiskLevel::Danger;
        let is_danger = new == RiskLevel::Danger;
        if !was_danger && is_danger {
            self.high_risk.fetch_add(1, Ordering::Relaxed);
        } else if was_danger && !is_danger {
            let _ = self.high_risk.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |v| v.checked_sub(1),
            );
        }
    }

    /// Integer score formula. Starts from the maximum, charges the error
    /// rate, credits clean frequently-accessed sectors, and docks sectors
    /// whose last scan has gone stale. Clamped to 0..=1000.
    fn compute_score(h: &SectorHealth, now_secs: u64) -> u16 {
        let mut score = SCORE_MAX as i32;
        let errors = h.total_errors();
        if h.access_count > 0 {
            score -= (errors as i64 * 1000 / h.access_count as i64) as i32;
        }
        if h.access_count > FREQUENT_ACCESS_MIN && errors == 0 {
            score += CLEAN_FREQUENT_BONUS;
        }
        if now_secs.saturating_sub(h.last_scan_secs) > STALE_SCAN_SECS {
            score -= STALE_SCAN_PENALTY;
        }
        score.clamp(0, SCORE_MAX as i32) as u16
    }

    /// Health state for one sector, if tracked.
    pub fn get(&self, sector: u64) -> Option<SectorHealth> {
        self.sectors.get(sector)
    }

    /// Number of tracked sectors.
    pub fn tracked(&self) -> u64 {
        self.sectors.len()
    }

    /// Sectors currently at Caution or worse.
    pub fn active_warnings(&self) -> u64 {
        self.active_warnings.load(Ordering::Relaxed)
    }

    /// Sectors currently at Danger.
    pub fn high_risk(&self) -> u64 {
        self.high_risk.load(Ordering::Relaxed)
    }

    /// Total read errors observed.
    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    /// Total write errors observed.
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Current auto-remap error threshold.
    pub fn error_threshold(&self) -> u32 {
        self.error_threshold.load(Ordering::Relaxed)
    }

    /// Change the error threshold. Applies to future classifications only.
    pub fn set_error_threshold(&self, threshold: u32) {
        self.error_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Explicit maintenance: drop entries for sectors that are Safe with a
    /// clean error history. Returns how many entries were evicted.
    pub fn evict_healthy(&self) -> u64 {
        self.sectors.retain(|_, h| {
            !(h.risk == RiskLevel::Safe
                && h.total_errors() == 0
                && h.status != SectorStatus::Remapped)
        })
    }

    /// Count of sectors currently classified Bad.
    pub fn bad_sectors(&self) -> u64 {
        let mut count = 0u64;
        self.sectors.for_each(|_, h| {
            if h.status == SectorStatus::Bad {
                count += 1;
            }
        });
        count
    }

    /// Visit every tracked sector read-only.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(u64, &SectorHealth),
    {
        self.sectors.for_each(f)
    }
}

// =============================================================================
// Tests
// =============================================================================
