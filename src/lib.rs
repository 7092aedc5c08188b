//! SpareMap - Bad-Sector Remapping Engine
//!
//! A concurrent remapping layer for block devices: reads and writes aimed
//! at sectors known to be failing are transparently redirected to a
//! reserved spare area, while per-sector health statistics drive
//! predictive failure analysis and automatic remapping of sectors that
//! cross an error threshold.
//!
//! # Architecture
//!
//! The data path and the control path meet in the remap target:
//!
//! ```text
//! I/O Mapping Path → Remap Table ← Auto-Remap Worker ← Health Tracker
//!                                        ↑                   ↑
//!                                  Spare Allocator    Background Scanner
//! ```
//!
//! Lookups on the I/O path hit a sharded concurrent map and never block
//! behind a remap in progress; remap execution is deferred to a worker
//! task that re-validates its trigger before acting.
//!
//! # Modules
//!
//! - [`clock`] - Monotonic time source abstraction
//! - [`config`] - Target configuration and validation
//! - [`error`] - Error types
//! - [`health`] - Per-sector health tracking and failure prediction
//! - [`iopath`] - I/O mapping path with sequential fast path
//! - [`scanner`] - Background sector scanner
//! - [`spare`] - Spare-area allocator with metadata reservations
//! - [`table`] - Concurrent remap table
//! - [`target`] - Device-instance facade and auto-remap engine
//! - [`transport`] - Block transport abstraction

pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod iopath;
pub mod scanner;
pub mod spare;
pub mod table;
pub mod target;
pub mod transport;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TargetConfig;
pub use error::{Error, Result};
pub use health::{FailurePrediction, HealthTracker, RiskLevel, SectorHealth, SystemTrend};
pub use iopath::{IoOp, IoRequest};
pub use scanner::{ScanProgress, ScannerState, SectorScanner};
pub use table::{RemapEntry, RemapReason, RemapTable, SectorStatus};
pub use target::{DeviceHealth, RemapTarget, TargetStats};
pub use transport::{BlockTransport, DeviceRole, IoKind, MemTransport, SECTOR_SIZE};
