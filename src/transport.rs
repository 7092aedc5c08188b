//! Block Transport
//!
//! The seam between the remap engine and the devices it protects. The
//! engine never performs raw I/O itself; it rewrites the destination
//! device and sector, submits through this trait, and observes the
//! completion. [`MemTransport`] is the in-memory implementation used by
//! tests and the demo binary, with injectable per-sector faults standing
//! in for failing media.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

// =============================================================================
// Types
// =============================================================================

/// Which device an I/O is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    /// The primary device whose sectors may go bad
    Main,
    /// The backing device supplying replacement sectors
    Spare,
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::Main => write!(f, "main"),
            DeviceRole::Spare => write!(f, "spare"),
        }
    }
}

/// Direction of a single-sector transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoKind {
    Read,
    Write,
}

impl std::fmt::Display for IoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoKind::Read => write!(f, "read"),
            IoKind::Write => write!(f, "write"),
        }
    }
}

// =============================================================================
// Trait
// =============================================================================

/// Submit-and-complete interface to the underlying devices.
///
/// Implementations deliver the completion as the future's result; the
/// engine attaches its health bookkeeping after awaiting it. A transport
/// error is an ordinary outcome here, not a crash: the caller records it
/// and passes the original error on unmodified.
#[async_trait]
pub trait BlockTransport: Send + Sync {
    /// Submit a single-sector transfer. Reads resolve to the sector's
    /// data; writes consume `data` and resolve to an empty payload.
    async fn submit(
        &self,
        device: DeviceRole,
        sector: u64,
        kind: IoKind,
        data: Bytes,
    ) -> Result<Bytes>;

    /// Addressable sectors on a device.
    fn sector_count(&self, device: DeviceRole) -> u64;
}

// =============================================================================
// In-Memory Transport
// =============================================================================

/// Per-device transfer counters.
#[derive(Debug, Default)]
struct DeviceCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

struct MemDevice {
    sectors: RwLock<Vec<u8>>,
    sector_count: u64,
    counters: DeviceCounters,
}

impl MemDevice {
    fn new(sector_count: u64) -> Self {
        Self {
            sectors: RwLock::new(vec![0u8; sector_count as usize * SECTOR_SIZE]),
            sector_count,
            counters: DeviceCounters::default(),
        }
    }
}

/// In-memory dual-device transport with fault injection.
pub struct MemTransport {
    main: MemDevice,
    spare: MemDevice,
    /// Sectors that fail every transfer, per device
    faults: Mutex<HashSet<(DeviceRole, u64)>>,
}

impl MemTransport {
    /// Create a transport with the given device geometries.
    pub fn new(main_sectors: u64, spare_sectors: u64) -> Self {
        Self {
            main: MemDevice::new(main_sectors),
            spare: MemDevice::new(spare_sectors),
            faults: Mutex::new(HashSet::new()),
        }
    }

    fn device(&self, role: DeviceRole) -> &MemDevice {
        match role {
            DeviceRole::Main => &self.main,
            DeviceRole::Spare => &self.spare,
        }
    }

    /// Make every transfer to a sector fail until cleared.
    pub fn inject_fault(&self, device: DeviceRole, sector: u64) {
        self.faults.lock().insert((device, sector));
    }

    /// Clear an injected fault.
    pub fn clear_fault(&self, device: DeviceRole, sector: u64) {
        self.faults.lock().remove(&(device, sector));
    }

    /// Reads completed on a device.
    pub fn reads(&self, device: DeviceRole) -> u64 {
        self.device(device).counters.reads.load(Ordering::Relaxed)
    }

    /// Writes completed on a device.
    pub fn writes(&self, device: DeviceRole) -> u64 {
        self.device(device).counters.writes.load(Ordering::Relaxed)
    }

    /// Failed transfers on a device.
    pub fn errors(&self, device: DeviceRole) -> u64 {
        self.device(device).counters.errors.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlockTransport for MemTransport {
    async fn submit(
        &self,
        device: DeviceRole,
        sector: u64,
        kind: IoKind,
        data: Bytes,
    ) -> Result<Bytes> {
        let dev = self.device(device);
        if sector >= dev.sector_count {
            return Err(Error::SectorOutOfRange { device, sector });
        }

        if self.faults.lock().contains(&(device, sector)) {
            dev.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Transport {
                device,
                sector,
                kind,
            });
        }

        let offset = sector as usize * SECTOR_SIZE;
        match kind {
            IoKind::Read => {
                dev.counters.reads.fetch_add(1, Ordering::Relaxed);
                let guard = dev.sectors.read();
                Ok(Bytes::copy_from_slice(&guard[offset..offset + SECTOR_SIZE]))
            }
            IoKind::Write => {
                dev.counters.writes.fetch_add(1, Ordering::Relaxed);
                let mut guard = dev.sectors.write();
                let n = data.len().min(SECTOR_SIZE);
                guard[offset..offset + n].copy_from_slice(&data[..n]);
                if n < SECTOR_SIZE {
                    for byte in &mut guard[offset + n..offset + SECTOR_SIZE] {
                        *byte = 0;
                    }
                }
                Ok(Bytes::new())
            }
        }
    }

    fn sector_count(&self, device: DeviceRole) -> u64 {
        self.device(device).sector_count
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_write_read_roundtrip() {
        tokio_test::block_on(async {
            let t = MemTransport::new(16, 8);
            let payload = Bytes::from(vec![0xabu8; SECTOR_SIZE]);
            t.submit(DeviceRole::Main, 3, IoKind::Write, payload.clone())
                .await
                .unwrap();
            let back = t
                .submit(DeviceRole::Main, 3, IoKind::Read, Bytes::new())
                .await
                .unwrap();
            assert_eq!(back, payload);
        });
    }

    #[tokio::test]
    async fn test_devices_are_independent() {
        let t = MemTransport::new(16, 8);
        let payload = Bytes::from(vec![0x11u8; SECTOR_SIZE]);
        t.submit(DeviceRole::Spare, 3, IoKind::Write, payload)
            .await
            .unwrap();
        let main = t
            .submit(DeviceRole::Main, 3, IoKind::Read, Bytes::new())
            .await
            .unwrap();
        assert!(main.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let t = MemTransport::new(16, 8);
        t.inject_fault(DeviceRole::Main, 5);
        let err = t
            .submit(DeviceRole::Main, 5, IoKind::Read, Bytes::new())
            .await;
        assert_matches!(
            err,
            Err(Error::Transport {
                device: DeviceRole::Main,
                sector: 5,
                kind: IoKind::Read,
            })
        );
        assert_eq!(t.errors(DeviceRole::Main), 1);

        t.clear_fault(DeviceRole::Main, 5);
        t.submit(DeviceRole::Main, 5, IoKind::Read, Bytes::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let t = MemTransport::new(4, 4);
        let err = t
            .submit(DeviceRole::Spare, 4, IoKind::Read, Bytes::new())
            .await;
        assert_matches!(err, Err(Error::SectorOutOfRange { sector: 4, .. }));
    }

    #[tokio::test]
    async fn test_short_write_zero_fills() {
        let t = MemTransport::new(4, 4);
        t.submit(
            DeviceRole::Main,
            0,
            IoKind::Write,
            Bytes::from(vec![0xffu8; SECTOR_SIZE]),
        )
        .await
        .unwrap();
        t.submit(DeviceRole::Main, 0, IoKind::Write, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        let back = t
            .submit(DeviceRole::Main, 0, IoKind::Read, Bytes::new())
            .await
            .unwrap();
        assert_eq!(&back[..2], b"ab");
        assert!(back[2..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_counters() {
        let t = MemTransport::new(4, 4);
        t.submit(DeviceRole::Main, 0, IoKind::Read, Bytes::new())
            .await
            .unwrap();
        t.submit(DeviceRole::Main, 1, IoKind::Write, Bytes::new())
            .await
            .unwrap();
        assert_eq!(t.reads(DeviceRole::Main), 1);
        assert_eq!(t.writes(DeviceRole::Main), 1);
        assert_eq!(t.reads(DeviceRole::Spare), 0);
    }
}
