//! Remap Table
//!
//! The authoritative mapping from main-device sectors to spare-device
//! sectors. Consulted on every I/O; mutated by manual administration and
//! by the auto-remap worker. Capacity equals the spare area length, so a
//! full table and an exhausted spare area are the same condition seen
//! from two sides.

mod sharded;

pub use sharded::{SectorMap, DEFAULT_SHARDS};

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Entry Types
// =============================================================================

/// Why a mapping was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemapReason {
    /// Requested by an administrator
    Manual,
    /// Triggered by a failed write
    WriteError,
    /// Triggered by a failed read
    ReadError,
    /// Created ahead of failure by the health subsystem
    Proactive,
}

impl std::fmt::Display for RemapReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemapReason::Manual => write!(f, "manual"),
            RemapReason::WriteError => write!(f, "write-error"),
            RemapReason::ReadError => write!(f, "read-error"),
            RemapReason::Proactive => write!(f, "proactive"),
        }
    }
}

/// Coarse per-sector classification driven by observed errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectorStatus {
    /// Never observed
    Unknown,
    /// Observed with no errors
    Good,
    /// At least one error, below the remap threshold
    Suspect,
    /// Error count reached the remap threshold
    Bad,
    /// Redirected to a spare sector
    Remapped,
}

/// One live mapping from a main-device sector to a spare-device sector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapEntry {
    /// The unreliable main-device sector
    pub main_sector: u64,
    /// The spare-device sector now serving it
    pub spare_sector: u64,
    /// Errors observed on this sector (before and after remapping)
    pub error_count: u32,
    /// I/Os served through this mapping
    pub access_count: u32,
    /// Monotonic seconds of the most recent error, 0 if none
    pub last_error_secs: u64,
    /// Why the mapping exists
    pub reason: RemapReason,
    /// Classification of the main sector
    pub status: SectorStatus,
}

impl RemapEntry {
    /// Create a fresh mapping.
    pub fn new(main_sector: u64, spare_sector: u64, reason: RemapReason) -> Self {
        Self {
            main_sector,
            spare_sector,
            error_count: 0,
            access_count: 0,
            last_error_secs: 0,
            reason,
            status: SectorStatus::Remapped,
        }
    }
}

// =============================================================================
// Table
// =============================================================================

/// Point-in-time table statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStats {
    /// Live mappings
    pub active: u64,
    /// Maximum mappings (spare area length)
    pub capacity: u64,
    /// Lookups served
    pub lookups: u64,
    /// Lookups that hit a mapping
    pub hits: u64,
}

/// Concurrent remap table with a fixed capacity.
///
/// Uniqueness of `main_sector` is enforced by the shard write lock;
/// the capacity bound is enforced by reserving a slot on the active
/// counter before touching the map and rolling the reservation back if
/// the insert loses to a concurrent duplicate.
pub struct RemapTable {
    entries: SectorMap<RemapEntry>,
    capacity: u64,
    active: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl RemapTable {
    /// Create a table sized to the spare area.
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: SectorMap::new(),
            capacity,
            active: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Look up the spare sector serving `main_sector`, if any.
    ///
    /// One bounded shard critical section, no allocation. Takes the
    /// shard write lock so a hit can bump the mapping's access count;
    /// use [`RemapTable::peek`] for a read-only probe.
    pub fn lookup(&self, main_sector: u64) -> Option<u64> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let spare = self
            .entries
            .update(main_sector, |e| {
                e.access_count = e.access_count.saturating_add(1);
                e.spare_sector
            });
        if spare.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        spare
    }

    /// Look up without touching access bookkeeping. Used by eligibility
    /// pre-checks that must not distort per-mapping statistics.
    pub fn peek(&self, main_sector: u64) -> Option<u64> {
        self.entries.get(main_sector).map(|e| e.spare_sector)
    }

    /// Insert a new mapping.
    pub fn insert(&self, main_sector: u64, spare_sector: u64, reason: RemapReason) -> Result<()> {
        // Reserve a slot before touching the map so active never exceeds
        // capacity even under concurrent inserts.
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                if active >= self.capacity {
                    None
                } else {
                    Some(active + 1)
                }
            });
        if reserved.is_err() {
            return Err(Error::TableFull {
                capacity: self.capacity,
            });
        }

        let entry = RemapEntry::new(main_sector, spare_sector, reason);
        if self.entries.insert_if_absent(main_sector, entry) {
            Ok(())
        } else {
            self.active.fetch_sub(1, Ordering::SeqCst);
            Err(Error::AlreadyMapped {
                sector: main_sector,
            })
        }
    }

    /// Remove a mapping, returning the entry so the caller can release
    /// its spare sector.
    pub fn remove(&self, main_sector: u64) -> Result<RemapEntry> {
        match self.entries.remove(main_sector) {
            Some(entry) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(entry)
            }
            None => Err(Error::NotFound {
                sector: main_sector,
            }),
        }
    }

    /// Empty the table, returning the removed entries. Metadata
    /// reservations on the spare allocator are unaffected.
    ///
    /// An insert racing the clear is either drained (and returned, so
    /// the caller releases its spare sector) or survives the clear;
    /// `active` is adjusted by exactly the number of entries removed.
    pub fn clear(&self) -> Vec<RemapEntry> {
        let drained: Vec<RemapEntry> = self
            .entries
            .clear()
            .into_iter()
            .map(|(_, e)| e)
            .collect();
        self.active.fetch_sub(drained.len() as u64, Ordering::SeqCst);
        drained
    }

    /// Record an I/O error observed through an existing mapping.
    pub fn record_error(&self, main_sector: u64, now_secs: u64) -> bool {
        self.entries
            .update(main_sector, |e| {
                e.error_count = e.error_count.saturating_add(1);
                e.last_error_secs = now_secs;
            })
            .is_some()
    }

    /// Live mapping count.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Maximum mapping count.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether the table is at capacity.
    pub fn is_full(&self) -> bool {
        self.active() >= self.capacity
    }

    /// Table statistics.
    pub fn stats(&self) -> TableStats {
        TableStats {
            active: self.active(),
            capacity: self.capacity,
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of all live entries, for reporting.
    pub fn snapshot(&self) -> Vec<RemapEntry> {
        self.entries.entries().into_iter().map(|(_, e)| e).collect()
    }

    /// Advisory shard warm-up for an expected upcoming lookup.
    pub fn prefetch(&self, main_sector: u64) {
        self.entries.prefetch(main_sector);
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
    fn test_insert_lookup_roundtrip() {
        let table = RemapTable::new(100);
        table.insert(500, 1000, RemapReason::Manual).unwrap();
        assert_eq!(table.lookup(500), Some(1000));
        assert_eq!(table.lookup(999), None);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let table = RemapTable::new(100);
        table.insert(500, 1000, RemapReason::Manual).unwrap();
        let err = table.insert(500, 1001, RemapReason::Manual);
        assert_matches!(err, Err(Error::AlreadyMapped { sector: 500 }));
        // Losing insert must not leak a capacity slot.
        assert_eq!(table.active(), 1);
        assert_eq!(table.lookup(500), Some(1000));
    }

    #[test]
    fn test_capacity_enforced() {
        let table = RemapTable::new(2);
        table.insert(1, 1000, RemapReason::Manual).unwrap();
        table.insert(2, 1001, RemapReason::Manual).unwrap();
        assert_matches!(
            table.insert(3, 1002, RemapReason::Manual),
            Err(Error::TableFull { capacity: 2 })
        );
        assert_eq!(table.active(), 2);
        assert!(table.is_full());
    }

    #[test]
    fn test_remove() {
        let table = RemapTable::new(10);
        table.insert(5, 1000, RemapReason::ReadError).unwrap();
        let entry = table.remove(5).unwrap();
        assert_eq!(entry.spare_sector, 1000);
        assert_eq!(entry.reason, RemapReason::ReadError);
        assert_eq!(table.active(), 0);
        assert_matches!(table.remove(5), Err(Error::NotFound { sector: 5 }));
    }

    #[test]
    fn test_clear_returns_entries_and_frees_capacity() {
        let table = RemapTable::new(3);
        table.insert(1, 1000, RemapReason::Manual).unwrap();
        table.insert(2, 1001, RemapReason::Manual).unwrap();
        let drained = table.clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(table.active(), 0);
        assert_eq!(table.lookup(1), None);
        // Capacity is reusable after clear.
        table.insert(1, 1000, RemapReason::Manual).unwrap();
    }

    #[test]
    fn test_clear_racing_inserts_loses_nothing() {
        use std::sync::Arc;
        use std::thread;

        // Writers race a repeated clearer; every successful insert must
        // be drained by exactly one clear or still be live at the end,
        // and active must settle at zero after the final clear.
        let table = Arc::new(RemapTable::new(100_000));
        let mut writers = Vec::new();
        for t in 0..4u64 {
            let table = Arc::clone(&table);
            writers.push(thread::spawn(move || {
                let mut ok = 0u64;
                for i in 0..2_000u64 {
                    let sector = t * 1_000_000 + i;
                    if table.insert(sector, sector, RemapReason::Manual).is_ok() {
                        ok += 1;
                    }
                }
                ok
            }));
        }
        let clearer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut drained = 0u64;
                for _ in 0..50 {
                    drained += table.clear().len() as u64;
                    thread::yield_now();
                }
                drained
            })
        };

        let inserted: u64 = writers.into_iter().map(|h| h.join().unwrap()).sum();
        let drained = clearer.join().unwrap() + table.clear().len() as u64;
        assert_eq!(drained, inserted);
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn test_lookup_counts_access() {
        let table = RemapTable::new(10);
        table.insert(5, 1000, RemapReason::Manual).unwrap();
        table.lookup(5);
        table.lookup(5);
        let entry = &table.snapshot()[0];
        assert_eq!(entry.access_count, 2);
    }

    #[test]
    fn test_peek_does_not_count_access() {
        let table = RemapTable::new(10);
        table.insert(5, 1000, RemapReason::Manual).unwrap();
        assert_eq!(table.peek(5), Some(1000));
        assert_eq!(table.snapshot()[0].access_count, 0);
    }

    #[test]
    fn test_stats_count_lookups_not_mutations() {
        let table = RemapTable::new(10);
        table.insert(5, 1000, RemapReason::Manual).unwrap();
        table.lookup(5);
        table.lookup(5);
        table.lookup(6);
        table.peek(5);
        table.record_error(5, 1);

        // Inserts, peeks, and error recording are not lookups.
        let stats = table.stats();
        assert_eq!(stats.lookups, 3);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn test_record_error() {
        let table = RemapTable::new(10);
        table.insert(5, 1000, RemapReason::Manual).unwrap();
        assert!(table.record_error(5, 123));
        assert!(!table.record_error(6, 123));
        let entry = &table.snapshot()[0];
        assert_eq!(entry.error_count, 1);
        assert_eq!(entry.last_error_secs, 123);
    }

    #[test]
    fn test_stats() {
        let table = RemapTable::new(10);
        table.insert(5, 1000, RemapReason::Manual).unwrap();
        table.lookup(5);
        table.lookup(6);
        let stats = table.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.capacity, 10);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_concurrent_inserts_respect_capacity() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(RemapTable::new(64));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut ok = 0u32;
                    for i in 0..100u64 {
                        let sector = t * 1000 + i;
                        if table.insert(sector, 5000 + sector, RemapReason::Manual).is_ok() {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect();
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 64);
        assert_eq!(table.active(), 64);
    }
}
