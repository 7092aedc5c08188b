//! Predictive Analyzer
//!
//! Converts a sector's rolling health state into a failure prediction:
//! probability, confidence, severity, an estimated time to failure, and a
//! human-readable dominant cause. Predictions are derived on demand and
//! never persisted. All arithmetic is integer-only.
//!
//! A sector with no recorded health state yields `NoHealthData`, never a
//! zero-probability prediction; absence of evidence is not evidence of
//! health.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::health::tracker::{HealthTracker, SectorHealth, SCORE_MAX};

// =============================================================================
// Constants
// =============================================================================

/// Scan samples considered a solid observation base.
pub const SOLID_SCAN_SAMPLES: u8 = 10;

/// Access count considered a solid observation base.
pub const SOLID_ACCESS_COUNT: u32 = 50;

/// Observation window below which reliability is penalized.
pub const SHORT_WINDOW_SECS: u64 = 7 * 86_400;

/// An error within this window doubles the error-rate trend.
pub const RECENT_ERROR_SECS: u64 = 3600;

/// Minimum estimated time to failure.
pub const MIN_ETA_SECS: u64 = 3600;

/// Maximum estimated time to failure.
pub const MAX_ETA_SECS: u64 = 365 * 86_400;

/// High-risk sector count that raises a system-level warning.
pub const SYSTEM_HIGH_RISK_CUTOFF: u64 = 10;

/// Active-warning count that raises a system-level warning.
pub const SYSTEM_WARNING_CUTOFF: u64 = 50;

/// Scan coverage below this percentage is flagged as informational.
pub const LOW_COVERAGE_PERCENT: u64 = 50;

// =============================================================================
// Types
// =============================================================================

/// On-demand failure prediction for one sector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePrediction {
    /// 0..=100
    pub failure_probability: u8,
    /// 0..=100
    pub confidence: u8,
    /// 1..=10
    pub severity: u8,
    /// Estimated seconds until failure, from now
    pub eta_secs: u64,
    /// Dominant-cause summary
    pub reason: String,
}

/// System-wide aggregation of per-sector risk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTrend {
    /// Sectors currently at Danger
    pub high_risk_sectors: u64,
    /// Sectors currently at Caution or worse
    pub active_warnings: u64,
    /// Background scan coverage, 0..=100
    pub coverage_percent: u64,
    /// Informational: coverage below the cutoff
    pub low_coverage: bool,
    /// Whether a system-level warning condition is active
    pub system_warning: bool,
}

/// Intermediate trend figures for one sector.
struct TrendSnapshot {
    /// Errors per 1000 accesses, doubled after a recent error
    error_rate: u32,
    /// Health-score deficit normalized by scan samples
    deficit_per_scan: u32,
    /// Access-pattern risk contribution, capped at 30
    pattern_risk: u32,
}

// =============================================================================
// Analyzer
// =============================================================================

/// Failure predictor over a [`HealthTracker`].
pub struct PredictiveAnalyzer {
    tracker: Arc<HealthTracker>,
    clock: Arc<dyn Clock>,
    warning_threshold: u16,
    danger_threshold: u16,
}

impl PredictiveAnalyzer {
    pub fn new(
        tracker: Arc<HealthTracker>,
        clock: Arc<dyn Clock>,
        warning_threshold: u16,
        danger_threshold: u16,
    ) -> Self {
        Self {
            tracker,
            clock,
            warning_threshold,
            danger_threshold,
        }
    }

    /// Predict failure for one sector.
    pub fn predict(&self, sector: u64) -> Result<FailurePrediction> {
        let health = self
            .tracker
            .get(sector)
            .ok_or(Error::NoHealthData { sector })?;
        let now = self.clock.now_secs();

        let trend = self.trend_snapshot(&health, now);
        let reliability = self.reliability(&health, now);
        let probability = self.failure_probability(&health, &trend, reliability);
        let confidence = Self::confidence(&health, reliability);
        let severity = Self::severity(probability);
        let eta_secs = self.estimate_eta(&health, &trend, probability, now);
        let reason = Self::dominant_cause(&health, &trend, self.danger_threshold);

        debug!(
            sector,
            probability, confidence, severity, eta_secs, "computed failure prediction"
        );

        Ok(FailurePrediction {
            failure_probability: probability,
            confidence,
            severity,
            eta_secs,
            reason,
        })
    }

    /// Step 2: raw trend figures.
    fn trend_snapshot(&self, h: &SectorHealth, now: u64) -> TrendSnapshot {
        let errors = h.total_errors();
        let mut error_rate = if h.access_count > 0 {
            (errors as u64 * 1000 / h.access_count as u64) as u32
        } else {
            0
        };
        let recent_error = h
            .last_error_secs
            .map(|t| now.saturating_sub(t) <= RECENT_ERROR_SECS)
            .unwrap_or(false);
        if recent_error {
            error_rate *= 2;
        }

        let deficit = (SCORE_MAX - h.score) as u32;
        let deficit_per_scan = deficit / (h.scan_count.max(1) as u32);

        // High-frequency sectors with errors weigh more; low-frequency
        // sectors with any errors are flagged but de-weighted.
        let pattern_risk = if errors == 0 {
            0
        } else if h.access_count >= SOLID_ACCESS_COUNT {
            (errors * 3).min(30)
        } else {
            (errors * 2).min(15)
        };

        TrendSnapshot {
            error_rate,
            deficit_per_scan,
            pattern_risk,
        }
    }

    /// Step 3: how much the observation base can be trusted.
    fn reliability(&self, h: &SectorHealth, now: u64) -> u32 {
        let mut score = 50u32;
        if h.scan_count >= SOLID_SCAN_SAMPLES {
            score += 30;
        }
        if h.access_count >= SOLID_ACCESS_COUNT {
            score += 20;
        }
        // Short observation windows halve the reliability, floored at 20.
        if now.saturating_sub(h.first_seen_secs) < SHORT_WINDOW_SECS {
            score = (score / 2).max(20);
        }
        score
    }

    /// Step 4: weighted probability, scaled by reliability.
    fn failure_probability(&self, h: &SectorHealth, t: &TrendSnapshot, reliability: u32) -> u8 {
        let base_risk: u32 = if h.score >= self.warning_threshold {
            5
        } else if h.score >= self.danger_threshold {
            20
        } else {
            50
        };
        let trend_risk = (t.error_rate / 10).min(40) + (t.deficit_per_scan / 10).min(30);
        let pattern_risk = t.pattern_risk.min(30);

        let weighted = (base_risk + trend_risk + pattern_risk) * reliability / 100;
        weighted.min(100) as u8
    }

    /// Step 5: confidence, penalized for sparse data.
    fn confidence(h: &SectorHealth, reliability: u32) -> u8 {
        let mut confidence = reliability as i32;
        if h.scan_count < SOLID_SCAN_SAMPLES {
            confidence -= 30;
        }
        if h.access_count < 10 {
            confidence -= 20;
        }
        confidence.max(10) as u8
    }

    /// Step 6: severity bucket, 1..=10.
    fn severity(probability: u8) -> u8 {
        if probability >= 80 {
            9
        } else if probability >= 50 {
            7
        } else if probability >= 20 {
            4
        } else {
            1
        }
    }

    /// Step 7: estimated seconds until failure.
    fn estimate_eta(&self, h: &SectorHealth, t: &TrendSnapshot, probability: u8, now: u64) -> u64 {
        let days_observed = (now.saturating_sub(h.first_seen_secs) / 86_400).max(1);
        let deficit = (SCORE_MAX - h.score) as u64;
        let decay_per_day = deficit / days_observed;

        let eta = if decay_per_day == 0 || t.error_rate == 0 {
            // No measurable degradation trend: fixed buckets by probability.
            match probability {
                80..=100 => 7 * 86_400,
                50..=79 => 30 * 86_400,
                20..=49 => 90 * 86_400,
                _ => MAX_ETA_SECS,
            }
        } else {
            let days_remaining = h.score as u64 / decay_per_day;
            let scaled = days_remaining * (100 - probability as u64) / 100;
            scaled * 86_400
        };

        eta.clamp(MIN_ETA_SECS, MAX_ETA_SECS)
    }

    /// Step 8: dominant cause, first matching rule wins.
    fn dominant_cause(h: &SectorHealth, t: &TrendSnapshot, danger_threshold: u16) -> String {
        let reads = h.read_errors as u32;
        let writes = h.write_errors as u32;
        if reads > 0 && reads > writes * 2 {
            format!("predominantly read errors ({} read, {} write)", reads, writes)
        } else if writes > 0 && writes > reads * 2 {
            format!("predominantly write errors ({} write, {} read)", writes, reads)
        } else if reads > 0 && writes > 0 {
            format!("mixed read/write errors ({} total)", reads + writes)
        } else if t.deficit_per_scan >= 100 {
            "sustained health-score decline across scans".to_string()
        } else if t.error_rate >= 100 {
            format!("elevated error rate ({} per 1000 accesses)", t.error_rate)
        } else if h.score < danger_threshold {
            "health score below danger threshold".to_string()
        } else if t.pattern_risk > 0 {
            "risky access pattern".to_string()
        } else {
            "no dominant failure indicator".to_string()
        }
    }

    /// System-wide trend check. Returns the aggregate snapshot; the
    /// `system_warning` flag is the warning condition.
    pub fn trend_monitor(&self, coverage_percent: u64) -> SystemTrend {
        let high_risk = self.tracker.high_risk();
        let warnings = self.tracker.active_warnings();
        let low_coverage = coverage_percent < LOW_COVERAGE_PERCENT;
        let system_warning =
            high_risk > SYSTEM_HIGH_RISK_CUTOFF || warnings > SYSTEM_WARNING_CUTOFF;

        if system_warning {
            warn!(
                high_risk,
                warnings, "system-level failure warning condition active"
            );
        } else if low_coverage {
            info!(coverage_percent, "scan coverage below target");
        }

        SystemTrend {
            high_risk_sectors: high_risk,
            active_warnings: warnings,
            coverage_percent,
            low_coverage,
            system_warning,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
