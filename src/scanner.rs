//! Background Sector Scanner
//!
//! Periodically probes the monitored range with scan reads so latent bad
//! sectors are found before an application touches them. Each cycle scans
//! a bounded batch of sectors from a wrapping cursor, feeds the results to
//! the health tracker, and raises proactive remap triggers for sectors
//! that fail their probe.
//!
//! Lifecycle: `Stopped -> Starting -> Running <-> Paused -> Stopping ->
//! Stopped`. Invalid transitions are rejected; `stop` is idempotent and
//! waits for the in-flight cycle to finish before confirming.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::MIN_SCAN_INTERVAL;
use crate::error::{Error, Result};
use crate::target::RemapTarget;
use crate::transport::{BlockTransport, DeviceRole, IoKind};

/// Sectors probed between cooperative yields within a cycle.
const SCAN_YIELD_EVERY: u64 = 64;

/// How long `stop` waits for the task to confirm before giving up.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// State machine
// =============================================================================

/// Scanner lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScannerState::Stopped => write!(f, "stopped"),
            ScannerState::Starting => write!(f, "starting"),
            ScannerState::Running => write!(f, "running"),
            ScannerState::Paused => write!(f, "paused"),
            ScannerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Progress snapshot for monitoring surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub state: ScannerState,
    pub cursor: u64,
    pub coverage_percent: u64,
    pub full_scans: u64,
    /// Timestamp of the last completed full pass; `None` before the first
    pub last_full_scan_secs: Option<u64>,
    pub sectors_scanned: u64,
    pub errors_found: u64,
}

// =============================================================================
// Scanner
// =============================================================================

/// Background scanner over a target's main device range.
///
/// Cheap to clone; clones share the same scan task and state.
#[derive(Clone)]
pub struct SectorScanner {
    inner: Arc<ScanInner>,
}

struct ScanInner {
    target: Arc<RemapTarget>,
    transport: Arc<dyn BlockTransport>,
    clock: Arc<dyn Clock>,
    total_sectors: u64,
    sectors_per_scan: u64,
    interval_ms: AtomicU64,
    state: Mutex<ScannerState>,
    cursor: AtomicU64,
    full_scans: AtomicU64,
    /// 0 means no full pass has completed yet
    last_full_scan_secs: AtomicU64,
    sectors_scanned: AtomicU64,
    errors_found: AtomicU64,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SectorScanner {
    pub fn new(
        target: Arc<RemapTarget>,
        transport: Arc<dyn BlockTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = target.config();
        Self {
            inner: Arc::new(ScanInner {
                total_sectors: config.main_sectors,
                sectors_per_scan: config.sectors_per_scan,
                interval_ms: AtomicU64::new(config.scan_interval.as_millis() as u64),
                target,
                transport,
                clock,
                state: Mutex::new(ScannerState::Stopped),
                cursor: AtomicU64::new(0),
                full_scans: AtomicU64::new(0),
                last_full_scan_secs: AtomicU64::new(0),
                sectors_scanned: AtomicU64::new(0),
                errors_found: AtomicU64::new(0),
                shutdown: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ScannerState {
        *self.inner.state.lock()
    }

    /// Change the cycle interval at runtime. Takes effect from the next
    /// tick.
    pub fn set_scan_interval(&self, interval: Duration) -> Result<()> {
        if interval < MIN_SCAN_INTERVAL {
            return Err(Error::InvalidConfig(format!(
                "scan_interval must be >= {}ms",
                MIN_SCAN_INTERVAL.as_millis()
            )));
        }
        self.inner
            .interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        info!(interval_ms = interval.as_millis() as u64, "scan interval updated");
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the periodic scan task.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ScannerState::Stopped {
                return Err(Error::ScannerState {
                    from: *state,
                    to: ScannerState::Starting,
                });
            }
            *state = ScannerState::Starting;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run().await });
        *self.inner.task.lock() = Some(handle);
        {
            // A stop() may have raced in while the lock was released;
            // only promote to Running if the transition is still ours.
            let mut state = self.inner.state.lock();
            if *state == ScannerState::Starting {
                *state = ScannerState::Running;
            }
        }
        info!(
            total_sectors = self.inner.total_sectors,
            per_cycle = self.inner.sectors_per_scan,
            "scanner started"
        );
        Ok(())
    }

    /// Suspend scanning without tearing the task down.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state != ScannerState::Running {
            return Err(Error::ScannerState {
                from: *state,
                to: ScannerState::Paused,
            });
        }
        *state = ScannerState::Paused;
        info!("scanner paused");
        Ok(())
    }

    /// Resume a paused scanner.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state != ScannerState::Paused {
            return Err(Error::ScannerState {
                from: *state,
                to: ScannerState::Running,
            });
        }
        *state = ScannerState::Running;
        info!("scanner resumed");
        Ok(())
    }

    /// Stop the scanner, waiting for any in-flight cycle to finish.
    /// Idempotent from `Stopped`.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == ScannerState::Stopped {
                return Ok(());
            }
            *state = ScannerState::Stopping;
        }
        // notify_one stores a permit, so the signal is not lost if the
        // task is mid-cycle rather than parked in notified().
        self.inner.shutdown.notify_one();

        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                return Err(Error::ScannerStopTimeout {
                    timeout_ms: STOP_TIMEOUT.as_millis() as u64,
                });
            }
        }
        *self.inner.state.lock() = ScannerState::Stopped;
        info!("scanner stopped");
        Ok(())
    }

    pub fn progress(&self) -> ScanProgress {
        let cursor = self.inner.cursor.load(Ordering::Relaxed);
        let last = self.inner.last_full_scan_secs.load(Ordering::Relaxed);
        ScanProgress {
            state: self.state(),
            cursor,
            coverage_percent: self.inner.coverage_percent(cursor),
            full_scans: self.inner.full_scans.load(Ordering::Relaxed),
            last_full_scan_secs: if self.inner.full_scans.load(Ordering::Relaxed) > 0 {
                Some(last)
            } else {
                None
            },
            sectors_scanned: self.inner.sectors_scanned.load(Ordering::Relaxed),
            errors_found: self.inner.errors_found.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Scan loop
// =============================================================================

impl ScanInner {
    fn coverage_percent(&self, cursor: u64) -> u64 {
        if self.full_scans.load(Ordering::Relaxed) > 0 && cursor == 0 {
            100
        } else {
            cursor * 100 / self.total_sectors
        }
    }

    async fn run(self: Arc<Self>) {
        debug!("scan task started");
        let mut current_ms = self.interval_ms.load(Ordering::Relaxed);
        let mut tick = tokio::time::interval(Duration::from_millis(current_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tick.tick() => {
                    let want_ms = self.interval_ms.load(Ordering::Relaxed);
                    if want_ms != current_ms {
                        current_ms = want_ms;
                        tick = tokio::time::interval(Duration::from_millis(current_ms));
                        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                        continue;
                    }
                    // Copy the state out so the guard does not live
                    // across the await below.
                    let state = *self.state.lock();
                    match state {
                        ScannerState::Running => self.scan_cycle().await,
                        ScannerState::Paused => {}
                        // Stopping or a racing stop: let the loop exit on
                        // the shutdown notification.
                        _ => {}
                    }
                }
            }
        }
        debug!("scan task exited");
    }

    /// Probe one batch of sectors from the cursor, wrapping at the end of
    /// the monitored range.
    async fn scan_cycle(&self) {
        let mut cursor = self.cursor.load(Ordering::Relaxed);
        let mut wrapped = false;

        for i in 0..self.sectors_per_scan {
            let sector = cursor;
            self.probe(sector).await;
            cursor += 1;
            if cursor >= self.total_sectors {
                cursor = 0;
                wrapped = true;
                self.full_scans.fetch_add(1, Ordering::Relaxed);
                self.last_full_scan_secs
                    .store(self.clock.now_secs(), Ordering::Relaxed);
                info!(
                    full_scans = self.full_scans.load(Ordering::Relaxed),
                    "full scan pass complete"
                );
                break;
            }
            if (i + 1) % SCAN_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.cursor.store(cursor, Ordering::Relaxed);
        let coverage = if wrapped {
            100
        } else {
            cursor * 100 / self.total_sectors
        };
        self.target.set_scan_coverage(coverage);
    }

    /// Scan-read one sector and feed the outcome to the health tracker.
    /// Remapped sectors are skipped; their data no longer lives here.
    async fn probe(&self, sector: u64) {
        if self.target.query_remap(sector).is_some() {
            return;
        }
        let ok = self
            .transport
            .submit(DeviceRole::Main, sector, IoKind::Read, Bytes::new())
            .await
            .is_ok();
        self.sectors_scanned.fetch_add(1, Ordering::Relaxed);
        self.target.tracker().record_scan(sector, ok);
        if !ok {
            self.errors_found.fetch_add(1, Ordering::Relaxed);
            warn!(sector, "scan probe failed");
            self.target.schedule_proactive_remap(sector);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
