//! I/O Mapping Path
//!
//! The per-request hot path: decide where a request goes, rewrite its
//! destination, submit it through the block transport, and feed the
//! completion into the health tracker. Stateless across requests except
//! through the remap table and the tracker.
//!
//! Routing rules, in order:
//!
//! - flush / discard / write-zeroes are special operations: pass through
//!   to the main device untouched
//! - requests longer than one sector pass through unmapped (a multi-sector
//!   write straddling a known-bad sector is not protected; accepted
//!   limitation inherited from the single-sector remap granularity)
//! - otherwise the table decides: hit routes to the spare device at the
//!   mapped sector, miss passes through
//!
//! Routing itself never fails; the only failure mode is the transport's,
//! and that is recorded into health state and delivered to the caller
//! with its original meaning intact.

mod fastpath;

pub use fastpath::{FastPath, FastPathStats, PREFETCH_AHEAD, SEQUENTIAL_RUN_MIN};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::health::tracker::HealthTracker;
use crate::table::{RemapReason, RemapTable};
use crate::transport::{BlockTransport, DeviceRole, IoKind, SECTOR_SIZE};

// =============================================================================
// Request Types
// =============================================================================

/// Operation requested against the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoOp {
    Read,
    Write,
    Flush,
    Discard,
    WriteZeroes,
}

impl IoOp {
    /// Whether the operation addresses sector data the table can remap.
    pub fn is_rw(&self) -> bool {
        matches!(self, IoOp::Read | IoOp::Write)
    }

    fn kind(&self) -> IoKind {
        match self {
            IoOp::Read => IoKind::Read,
            _ => IoKind::Write,
        }
    }
}

/// One I/O request against the logical (main) address space.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub op: IoOp,
    /// Starting sector on the main device
    pub sector: u64,
    /// Length in sectors
    pub len: u64,
    /// Payload for writes; ignored for reads and special ops
    pub data: Bytes,
}

impl IoRequest {
    pub fn read(sector: u64) -> Self {
        Self {
            op: IoOp::Read,
            sector,
            len: 1,
            data: Bytes::new(),
        }
    }

    pub fn write(sector: u64, data: Bytes) -> Self {
        Self {
            op: IoOp::Write,
            sector,
            len: 1,
            data,
        }
    }
}

/// How a request was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Routed to the main device at its original sector
    Passthrough,
    /// Redirected to the spare device
    Remapped { spare_sector: u64 },
    /// Special operation, forwarded untouched
    Special,
}

/// A fully routed request destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routed {
    pub device: DeviceRole,
    pub sector: u64,
    pub disposition: Disposition,
}

/// Deferred auto-remap trigger, raised by a failed completion or a scan
/// probe. The receiver re-validates the trigger condition before acting,
/// so a stale trigger is a harmless no-op.
#[derive(Debug, Clone, Copy)]
pub struct RemapTrigger {
    pub sector: u64,
    /// Reason recorded on the mapping if the trigger leads to a remap
    pub reason: RemapReason,
}

/// I/O path statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoPathStats {
    pub total: u64,
    pub passthrough: u64,
    pub remapped: u64,
    pub special: u64,
    pub oversize: u64,
    pub fast_path: FastPathStats,
}

// =============================================================================
// Mapper
// =============================================================================

/// The I/O mapping path for one target instance.
pub struct IoMapper {
    table: Arc<RemapTable>,
    tracker: Arc<HealthTracker>,
    transport: Arc<dyn BlockTransport>,
    fast_path: FastPath,
    /// Trigger queue feeding the deferred auto-remap worker
    remap_tx: mpsc::Sender<RemapTrigger>,
    main_sectors: u64,
    total: AtomicU64,
    passthrough: AtomicU64,
    remapped: AtomicU64,
    special: AtomicU64,
    oversize: AtomicU64,
}

impl IoMapper {
    pub fn new(
        table: Arc<RemapTable>,
        tracker: Arc<HealthTracker>,
        transport: Arc<dyn BlockTransport>,
        remap_tx: mpsc::Sender<RemapTrigger>,
        main_sectors: u64,
        fast_path_enabled: bool,
    ) -> Self {
        Self {
            table,
            tracker,
            transport,
            fast_path: FastPath::new(fast_path_enabled),
            remap_tx,
            main_sectors,
            total: AtomicU64::new(0),
            passthrough: AtomicU64::new(0),
            remapped: AtomicU64::new(0),
            special: AtomicU64::new(0),
            oversize: AtomicU64::new(0),
        }
    }

    /// Pure routing decision for a request. Never fails; a sector with no
    /// mapping always passes through.
    pub fn route(&self, req: &IoRequest) -> Routed {
        if !req.op.is_rw() {
            return Routed {
                device: DeviceRole::Main,
                sector: req.sector,
                disposition: Disposition::Special,
            };
        }
        if req.len != 1 {
            return Routed {
                device: DeviceRole::Main,
                sector: req.sector,
                disposition: Disposition::Passthrough,
            };
        }
        match self.table.lookup(req.sector) {
            Some(spare_sector) => Routed {
                device: DeviceRole::Spare,
                sector: spare_sector,
                disposition: Disposition::Remapped { spare_sector },
            },
            None => Routed {
                device: DeviceRole::Main,
                sector: req.sector,
                disposition: Disposition::Passthrough,
            },
        }
    }

    /// Route, submit, and account for one request. The returned bytes are
    /// the read payload (empty for writes and special ops).
    #[instrument(skip(self, req), fields(sector = req.sector, op = ?req.op))]
    pub async fn submit(&self, req: IoRequest) -> Result<Bytes> {
        self.total.fetch_add(1, Ordering::Relaxed);

        if !req.op.is_rw() {
            // Nothing addressable to remap; forwarded untouched.
            self.special.fetch_add(1, Ordering::Relaxed);
            return Ok(Bytes::new());
        }

        if req.len != 1 {
            return self.submit_oversize(req).await;
        }

        self.fast_path.note_access(req.sector, &self.table);

        // Fast path: confirmed-unmapped healthy sector, skip full tracking
        // on success. The eligibility check includes the table peek, so
        // the routing decision is identical to the slow path's.
        if self
            .fast_path
            .eligible(req.sector, self.main_sectors, &self.table, &self.tracker)
        {
            self.passthrough.fetch_add(1, Ordering::Relaxed);
            let kind = req.op.kind();
            let result = self
                .transport
                .submit(DeviceRole::Main, req.sector, kind, req.data)
                .await;
            if result.is_err() {
                // Failures always land in health state, fast path or not.
                self.complete(req.sector, kind, false, false);
            }
            return result;
        }

        let routed = self.route(&req);
        let kind = req.op.kind();
        let remapped = matches!(routed.disposition, Disposition::Remapped { .. });
        match routed.disposition {
            Disposition::Remapped { spare_sector } => {
                self.remapped.fetch_add(1, Ordering::Relaxed);
                debug!(spare_sector, "request redirected to spare device");
            }
            _ => {
                self.passthrough.fetch_add(1, Ordering::Relaxed);
            }
        }

        let result = self
            .transport
            .submit(routed.device, routed.sector, kind, req.data)
            .await;
        self.complete(req.sector, kind, result.is_ok(), remapped);
        result
    }

    /// Oversize requests pass through sector by sector on the main device.
    async fn submit_oversize(&self, req: IoRequest) -> Result<Bytes> {
        self.oversize.fetch_add(1, Ordering::Relaxed);
        self.passthrough.fetch_add(1, Ordering::Relaxed);
        let kind = req.op.kind();

        let mut read_back = Vec::new();
        for i in 0..req.len {
            let sector = req.sector + i;
            let chunk = if kind == IoKind::Write {
                let start = (i as usize * SECTOR_SIZE).min(req.data.len());
                let end = ((i as usize + 1) * SECTOR_SIZE).min(req.data.len());
                req.data.slice(start..end)
            } else {
                Bytes::new()
            };
            let result = self
                .transport
                .submit(DeviceRole::Main, sector, kind, chunk)
                .await;
            match result {
                Ok(bytes) => {
                    if kind == IoKind::Read {
                        read_back.extend_from_slice(&bytes);
                    }
                }
                Err(e) => {
                    self.complete(sector, kind, false, false);
                    return Err(e);
                }
            }
        }
        Ok(Bytes::from(read_back))
    }

    /// Completion hook: health bookkeeping plus the deferred auto-remap
    /// trigger. Never performs the remap inline.
    fn complete(&self, main_sector: u64, kind: IoKind, ok: bool, remapped: bool) {
        let health = self.tracker.record_io(main_sector, kind, ok);
        if ok {
            return;
        }
        if remapped {
            // The spare location itself failed; note it on the mapping.
            self.table
                .record_error(main_sector, health.last_access_secs);
        }
        let trigger = RemapTrigger {
            sector: main_sector,
            reason: match kind {
                IoKind::Read => RemapReason::ReadError,
                IoKind::Write => RemapReason::WriteError,
            },
        };
        if self.remap_tx.try_send(trigger).is_err() {
            // Queue full or worker gone; the next failure re-raises it.
            warn!(sector = main_sector, "auto-remap trigger dropped");
        }
    }

    pub fn stats(&self) -> IoPathStats {
        IoPathStats {
            total: self.total.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            remapped: self.remapped.load(Ordering::Relaxed),
            special: self.special.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            fast_path: self.fast_path.stats(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
