//! Remap Target
//!
//! The long-lived device-instance context. Owns the remap table, the
//! spare allocator, the health tracker, the predictive analyzer, and the
//! I/O mapping path, and exposes the administrative entry points the
//! control plane calls: add-remap, query, remove, clear, statistics, and
//! the runtime tunables.
//!
//! Auto-remapping is decided on completion paths but executed on a
//! deferred worker: completions only enqueue a trigger, and the worker
//! re-validates the trigger condition before acting, so duplicate or
//! stale triggers are harmless no-ops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::health::predict::{FailurePrediction, PredictiveAnalyzer, SystemTrend};
use crate::health::tracker::HealthTracker;
use crate::iopath::{IoMapper, IoPathStats, IoRequest, RemapTrigger};
use crate::spare::{SpareAllocator, SpareStats};
use crate::table::{RemapReason, RemapTable, SectorStatus, TableStats};
use crate::transport::BlockTransport;

/// Capacity of the deferred auto-remap queue.
const REMAP_QUEUE_DEPTH: usize = 1024;

// =============================================================================
// Statistics
// =============================================================================

/// Overall device condition, derived from spare usage and bad-sector
/// counts with fixed integer thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceHealth {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl std::fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceHealth::Excellent => write!(f, "excellent"),
            DeviceHealth::Good => write!(f, "good"),
            DeviceHealth::Fair => write!(f, "fair"),
            DeviceHealth::Poor => write!(f, "poor"),
            DeviceHealth::Critical => write!(f, "critical"),
        }
    }
}

/// Statistics exposed to monitoring surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStats {
    pub remapped_count: u64,
    pub spare_used: u64,
    pub spare_total: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub auto_remaps: u64,
    pub manual_remaps: u64,
    /// Auto-remaps that failed for lack of spare capacity
    pub remap_failures: u64,
    pub overall_health: DeviceHealth,
    pub table: TableStats,
    pub spare: SpareStats,
    pub io: IoPathStats,
}

// =============================================================================
// Target
// =============================================================================

/// A device-instance remap target.
pub struct RemapTarget {
    config: TargetConfig,
    clock: Arc<dyn Clock>,
    table: Arc<RemapTable>,
    allocator: Arc<SpareAllocator>,
    tracker: Arc<HealthTracker>,
    analyzer: PredictiveAnalyzer,
    mapper: IoMapper,
    auto_remap_enabled: AtomicBool,
    auto_remaps: AtomicU64,
    manual_remaps: AtomicU64,
    remap_failures: AtomicU64,
    /// Latest scan coverage percentage, published by the scanner
    scan_coverage: AtomicU64,
    /// Extra trigger sender for the scanner's proactive path
    remap_tx: mpsc::Sender<RemapTrigger>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RemapTarget {
    /// Build a target over a transport. Spawns the deferred auto-remap
    /// worker; call [`RemapTarget::stop`] to tear it down.
    pub fn new(
        mut config: TargetConfig,
        transport: Arc<dyn BlockTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let table = Arc::new(RemapTable::new(config.spare_len));
        let allocator = Arc::new(SpareAllocator::new(
            config.spare_len,
            config.alloc_cache,
            config.alloc_cache_refill,
        ));
        let tracker = Arc::new(HealthTracker::new(
            clock.clone(),
            config.warning_threshold,
            config.danger_threshold,
            config.error_threshold,
        ));
        let analyzer = PredictiveAnalyzer::new(
            tracker.clone(),
            clock.clone(),
            config.warning_threshold,
            config.danger_threshold,
        );
        let (remap_tx, remap_rx) = mpsc::channel(REMAP_QUEUE_DEPTH);
        let mapper = IoMapper::new(
            table.clone(),
            tracker.clone(),
            transport,
            remap_tx.clone(),
            config.main_sectors,
            true,
        );

        let target = Arc::new(Self {
            auto_remap_enabled: AtomicBool::new(config.auto_remap_enabled),
            config,
            clock,
            table,
            allocator,
            tracker,
            analyzer,
            mapper,
            auto_remaps: AtomicU64::new(0),
            manual_remaps: AtomicU64::new(0),
            remap_failures: AtomicU64::new(0),
            scan_coverage: AtomicU64::new(0),
            remap_tx,
            shutdown: Arc::new(Notify::new()),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run_remap_worker(Arc::clone(&target), remap_rx));
        *target.worker.lock() = Some(handle);

        info!(
            main_sectors = target.config.main_sectors,
            spare_len = target.config.spare_len,
            "remap target ready"
        );
        Ok(target)
    }

    /// Construction-time configuration snapshot.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Reserve spare sectors for persisted setup metadata. Forwarded to
    /// the allocator; call before the first remap.
    pub fn reserve_metadata_ranges(&self, ranges: &[(u64, u64)]) -> Result<()> {
        self.allocator.reserve_metadata_ranges(ranges)
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// Submit an I/O request through the mapping path.
    pub async fn submit_io(&self, req: IoRequest) -> Result<Bytes> {
        self.mapper.submit(req).await
    }

    // =========================================================================
    // Administrative surface
    // =========================================================================

    /// Create a mapping for `main_sector`, returning the spare sector now
    /// serving it.
    #[instrument(skip(self))]
    pub fn add_manual_remap(&self, main_sector: u64) -> Result<u64> {
        let spare = self.create_remap(main_sector, RemapReason::Manual)?;
        self.manual_remaps.fetch_add(1, Ordering::Relaxed);
        info!(main_sector, spare, "manual remap created");
        Ok(spare)
    }

    /// The spare sector serving `main_sector`, if mapped.
    pub fn query_remap(&self, main_sector: u64) -> Option<u64> {
        self.table.peek(main_sector)
    }

    /// Remove a mapping and return its spare sector to the free pool.
    pub fn remove_remap(&self, main_sector: u64) -> Result<()> {
        let entry = self.table.remove(main_sector)?;
        self.allocator
            .release(entry.spare_sector - self.config.spare_start)?;
        self.tracker.unmark_remapped(main_sector);
        info!(main_sector, "remap removed");
        Ok(())
    }

    /// Drop every mapping. Metadata reservations stay in place.
    pub fn clear_all_remaps(&self) {
        let drained = self.table.clear();
        for entry in &drained {
            // Entries always hold sectors the allocator handed out.
            let _ = self
                .allocator
                .release(entry.spare_sector - self.config.spare_start);
            self.tracker.unmark_remapped(entry.main_sector);
        }
        info!(count = drained.len(), "all remaps cleared");
    }

    /// Whether automatic remapping is currently enabled.
    pub fn auto_remap_enabled(&self) -> bool {
        self.auto_remap_enabled.load(Ordering::Relaxed)
    }

    pub fn set_auto_remap_enabled(&self, enabled: bool) {
        self.auto_remap_enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "auto-remap toggled");
    }

    /// Change the error threshold used by classification and the
    /// auto-remap predicate.
    pub fn set_error_threshold(&self, threshold: u32) -> Result<()> {
        if threshold == 0 {
            return Err(Error::InvalidConfig("error_threshold must be >= 1".into()));
        }
        self.tracker.set_error_threshold(threshold);
        info!(threshold, "error threshold updated");
        Ok(())
    }

    // =========================================================================
    // Auto-remap engine
    // =========================================================================

    /// Whether a sector currently qualifies for automatic remapping.
    pub fn should_auto_remap(&self, sector: u64) -> bool {
        if !self.auto_remap_enabled() {
            return false;
        }
        let Some(health) = self.tracker.get(sector) else {
            return false;
        };
        health.status == SectorStatus::Bad
            && health.total_errors() >= self.tracker.error_threshold()
            && self.table.peek(sector).is_none()
    }

    /// Execute an auto-remap for a qualifying sector. May briefly block on
    /// allocation and the table insert; call from the worker, never from a
    /// completion path.
    pub fn perform_auto_remap(&self, sector: u64, reason: RemapReason) -> Result<u64> {
        let spare = self.create_remap(sector, reason)?;
        self.auto_remaps.fetch_add(1, Ordering::Relaxed);
        info!(sector, spare, %reason, "auto-remap created");
        Ok(spare)
    }

    /// Raise a proactive remap trigger (used by the background scanner).
    /// Non-blocking; a full queue drops the trigger, and the next scan
    /// pass will raise it again.
    pub fn schedule_proactive_remap(&self, sector: u64) {
        let trigger = RemapTrigger {
            sector,
            reason: RemapReason::Proactive,
        };
        if self.remap_tx.try_send(trigger).is_err() {
            warn!(sector, "proactive remap trigger dropped");
        }
    }

    /// Allocate a spare sector and insert a mapping, rolling the
    /// allocation back if the insert loses.
    fn create_remap(&self, main_sector: u64, reason: RemapReason) -> Result<u64> {
        if self.table.peek(main_sector).is_some() {
            return Err(Error::AlreadyMapped {
                sector: main_sector,
            });
        }
        let rel = self.allocator.allocate_next().ok_or(Error::NoSpareCapacity)?;
        let spare = self.config.spare_start + rel;
        match self.table.insert(main_sector, spare, reason) {
            Ok(()) => {
                self.tracker.mark_remapped(main_sector);
                Ok(spare)
            }
            Err(e) => {
                let _ = self.allocator.release(rel);
                // A full table with free spare sectors means capacity was
                // consumed elsewhere; surface it as exhaustion either way.
                match e {
                    Error::AlreadyMapped { .. } => Err(e),
                    _ => Err(Error::NoSpareCapacity),
                }
            }
        }
    }

    /// Deferred worker loop: consumes triggers, re-validates, acts.
    async fn run_remap_worker(target: Arc<Self>, mut rx: mpsc::Receiver<RemapTrigger>) {
        debug!("auto-remap worker started");
        loop {
            tokio::select! {
                _ = target.shutdown.notified() => break,
                trigger = rx.recv() => {
                    let Some(trigger) = trigger else { break };
                    target.handle_trigger(trigger);
                }
            }
        }
        debug!("auto-remap worker stopped");
    }

    fn handle_trigger(&self, trigger: RemapTrigger) {
        // Conditions may have changed since the trigger was raised; a
        // duplicate or stale trigger must be a no-op.
        if !self.should_auto_remap(trigger.sector) {
            debug!(sector = trigger.sector, "auto-remap trigger no longer applies");
            return;
        }
        match self.perform_auto_remap(trigger.sector, trigger.reason) {
            Ok(_) => {}
            Err(Error::NoSpareCapacity) => {
                self.remap_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sector = trigger.sector,
                    "auto-remap failed: spare area exhausted"
                );
            }
            Err(e) => {
                warn!(sector = trigger.sector, error = %e, "auto-remap failed");
            }
        }
    }

    /// Stop the deferred worker. Idempotent.
    pub async fn stop(&self) {
        // notify_one stores a permit, so the signal is not lost if the
        // worker is handling a trigger rather than parked in notified().
        self.shutdown.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // =========================================================================
    // Health and reporting
    // =========================================================================

    /// Failure prediction for one sector.
    pub fn predict(&self, sector: u64) -> Result<FailurePrediction> {
        self.analyzer.predict(sector)
    }

    /// System-wide trend snapshot.
    pub fn trend_monitor(&self) -> SystemTrend {
        self.analyzer
            .trend_monitor(self.scan_coverage.load(Ordering::Relaxed))
    }

    /// Publish the scanner's coverage percentage.
    pub fn set_scan_coverage(&self, percent: u64) {
        self.scan_coverage.store(percent.min(100), Ordering::Relaxed);
    }

    /// Shared health tracker (scanner feed point).
    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    /// Overall device condition from spare usage and bad-sector counts.
    /// Integer arithmetic only.
    pub fn assess_overall_health(&self) -> DeviceHealth {
        let spare_used = self.allocator.stats().allocated;
        let used_percent = spare_used * 100 / self.config.spare_len;
        let bad_sectors = self.tracker.bad_sectors();
        let errors = self.tracker.read_errors() + self.tracker.write_errors();
        let remaps = self.table.active();

        if used_percent >= 90 {
            DeviceHealth::Critical
        } else if used_percent > 50 || bad_sectors > 100 {
            DeviceHealth::Poor
        } else if used_percent > 10 || bad_sectors > 10 {
            DeviceHealth::Fair
        } else if errors > 0 || remaps > 0 {
            DeviceHealth::Good
        } else {
            DeviceHealth::Excellent
        }
    }

    /// Statistics snapshot for monitoring surfaces.
    pub fn get_statistics(&self) -> TargetStats {
        TargetStats {
            remapped_count: self.table.active(),
            spare_used: self.allocator.stats().allocated,
            spare_total: self.config.spare_len,
            read_errors: self.tracker.read_errors(),
            write_errors: self.tracker.write_errors(),
            auto_remaps: self.auto_remaps.load(Ordering::Relaxed),
            manual_remaps: self.manual_remaps.load(Ordering::Relaxed),
            remap_failures: self.remap_failures.load(Ordering::Relaxed),
            overall_health: self.assess_overall_health(),
            table: self.table.stats(),
            spare: self.allocator.stats(),
            io: self.mapper.stats(),
        }
    }

    /// Human-readable health report.
    pub fn generate_health_report(&self) -> String {
        let stats = self.get_statistics();
        let trend = self.trend_monitor();
        let uptime = self.clock.now_secs();

        let mut report = String::new();
        report.push_str("=== Remap Target Health Report ===\n");
        report.push_str(&format!("Uptime: {}s\n", uptime));
        report.push_str(&format!("Overall health: {}\n", stats.overall_health));
        report.push_str(&format!(
            "Remapped sectors: {} ({} auto, {} manual)\n",
            stats.remapped_count, stats.auto_remaps, stats.manual_remaps
        ));
        report.push_str(&format!(
            "Spare usage: {}/{} ({} reserved for metadata)\n",
            stats.spare_used, stats.spare_total, stats.spare.reserved
        ));
        report.push_str(&format!(
            "Errors: {} read, {} write\n",
            stats.read_errors, stats.write_errors
        ));
        report.push_str(&format!(
            "Active warnings: {}, high-risk sectors: {}\n",
            trend.active_warnings, trend.high_risk_sectors
        ));
        report.push_str(&format!(
            "Scan coverage: {}%\n",
            trend.coverage_percent
        ));

        report.push_str("Recommendations:\n");
        let mut recommended = false;
        if trend.high_risk_sectors > 0 {
            report.push_str("  - high-risk sectors present: back up this device\n");
            recommended = true;
        }
        if stats.spare_used * 100 / stats.spare_total >= 75 {
            report.push_str("  - spare area nearly exhausted: plan replacement\n");
            recommended = true;
        }
        if stats.remap_failures > 0 {
            report.push_str("  - remap attempts failed for lack of spare capacity\n");
            recommended = true;
        }
        if trend.low_coverage {
            report.push_str("  - scan coverage is low: let the scanner complete a pass\n");
            recommended = true;
        }
        if !recommended {
            report.push_str("  - none\n");
        }
        report
    }
}

// =============================================================================
// Tests
// =============================================================================
