//! Error types for the sparemap engine

use thiserror::Error;

use crate::scanner::ScannerState;
use crate::transport::{DeviceRole, IoKind};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the sparemap engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Remap Table Errors
    // =========================================================================
    /// A live mapping already exists for this main-device sector
    #[error("Sector {sector} is already remapped")]
    AlreadyMapped { sector: u64 },

    /// No mapping exists for this main-device sector
    #[error("No remap entry for sector {sector}")]
    NotFound { sector: u64 },

    /// The remap table is at capacity
    #[error("Remap table full: {capacity} entries in use")]
    TableFull { capacity: u64 },

    // =========================================================================
    // Spare Allocator Errors
    // =========================================================================
    /// Every spare sector is reserved or allocated
    #[error("No spare capacity remaining")]
    NoSpareCapacity,

    /// Metadata reservation ranges overlap each other or existing reservations
    #[error("Metadata reservation overlaps at sector {sector}")]
    ReservationOverlap { sector: u64 },

    /// A reservation or remap request falls outside the spare area
    #[error("Sector range [{start}, {start}+{len}) is outside the spare area")]
    OutOfBounds { start: u64, len: u64 },

    /// Too many metadata reservation ranges requested
    #[error("Too many metadata ranges: {requested} requested, {max} allowed")]
    TooManyRanges { requested: usize, max: usize },

    // =========================================================================
    // Health / Prediction Errors
    // =========================================================================
    /// Prediction requested for a sector with no recorded health state
    #[error("No health data recorded for sector {sector}")]
    NoHealthData { sector: u64 },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The underlying device reported an I/O failure
    #[error("{kind} failed on {device} device at sector {sector}")]
    Transport {
        device: DeviceRole,
        sector: u64,
        kind: IoKind,
    },

    /// A request referenced a sector past the end of the device
    #[error("Sector {sector} is beyond the end of the {device} device")]
    SectorOutOfRange { device: DeviceRole, sector: u64 },

    // =========================================================================
    // Scanner Errors
    // =========================================================================
    /// Invalid scanner lifecycle transition
    #[error("Invalid scanner transition: {from} -> {to}")]
    ScannerState {
        from: ScannerState,
        to: ScannerState,
    },

    /// Scanner failed to stop within the confirmation timeout
    #[error("Scanner did not stop within {timeout_ms}ms")]
    ScannerStopTimeout { timeout_ms: u64 },

    // =========================================================================
    // Configuration / Lifecycle Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),
}
