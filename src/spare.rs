//! Spare Allocator
//!
//! Tracks which spare-area sectors are withheld for persisted metadata and
//! which are currently allocated to remaps, and hands out the next free
//! sector with a wrapping first-fit search. An optional bounded FIFO cache
//! of pre-validated free sectors turns the common allocation into O(1)
//! amortized; every cached candidate is re-validated under the lock before
//! it is handed out, so correctness does not depend on the cache.
//!
//! Sectors are addressed relative to the spare area (0..spare_len); the
//! target adds the configured spare-area base before routing I/O.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Maximum number of metadata reservation ranges.
pub const MAX_METADATA_RANGES: usize = 5;

/// Default capacity of the free-sector FIFO cache.
pub const ALLOC_CACHE_CAPACITY: usize = 32;

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpareStats {
    /// Total sectors in the spare area
    pub total: u64,
    /// Sectors permanently withheld for metadata
    pub reserved: u64,
    /// Sectors currently allocated to remaps
    pub allocated: u64,
    /// Sectors still available for allocation
    pub available: u64,
    /// Allocations served from the FIFO cache
    pub cache_hits: u64,
    /// Allocations that fell back to a bitmap scan
    pub cache_misses: u64,
}

// =============================================================================
// Bitmap
// =============================================================================

/// Word-array bitmap over the spare area.
struct Bitmap {
    words: Vec<u64>,
    len: u64,
}

impl Bitmap {
    fn new(len: u64) -> Self {
        let words = vec![0u64; len.div_ceil(64) as usize];
        Self { words, len }
    }

    #[inline]
    fn get(&self, bit: u64) -> bool {
        debug_assert!(bit < self.len);
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    #[inline]
    fn set(&mut self, bit: u64) {
        debug_assert!(bit < self.len);
        self.words[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    #[inline]
    fn clear(&mut self, bit: u64) {
        debug_assert!(bit < self.len);
        self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
    }

    fn count_set(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

// =============================================================================
// Allocator
// =============================================================================

struct AllocState {
    /// Sectors permanently withheld for persisted metadata
    reserved: Bitmap,
    /// Sectors currently handed out to remaps
    allocated: Bitmap,
    /// Next search start, wrapping at spare_len
    cursor: u64,
    /// Metadata ranges accepted so far
    ranges: Vec<(u64, u64)>,
    /// Pre-validated free sectors, oldest first
    cache: VecDeque<u64>,
    cache_hits: u64,
    cache_misses: u64,
}

/// Allocator over the spare area.
pub struct SpareAllocator {
    spare_len: u64,
    cache_enabled: bool,
    /// Candidates examined per cache refill; caps refill latency.
    refill_limit: usize,
    state: Mutex<AllocState>,
}

impl SpareAllocator {
    /// Create an allocator over `spare_len` sectors.
    pub fn new(spare_len: u64, cache_enabled: bool, refill_limit: usize) -> Self {
        Self {
            spare_len,
            cache_enabled,
            refill_limit: refill_limit.max(1),
            state: Mutex::new(AllocState {
                reserved: Bitmap::new(spare_len),
                allocated: Bitmap::new(spare_len),
                cursor: 0,
                ranges: Vec::new(),
                cache: VecDeque::with_capacity(ALLOC_CACHE_CAPACITY),
                cache_hits: 0,
                cache_misses: 0,
            }),
        }
    }

    /// Permanently withhold sector ranges for persisted metadata.
    ///
    /// Called once during setup, before any allocation. Ranges must be in
    /// bounds, disjoint from each other and from prior reservations, and
    /// at most [`MAX_METADATA_RANGES`] in total.
    pub fn reserve_metadata_ranges(&self, ranges: &[(u64, u64)]) -> Result<()> {
        let mut state = self.state.lock();

        if state.ranges.len() + ranges.len() > MAX_METADATA_RANGES {
            return Err(Error::TooManyRanges {
                requested: state.ranges.len() + ranges.len(),
                max: MAX_METADATA_RANGES,
            });
        }

        // Validate everything before mutating anything.
        for &(start, len) in ranges {
            if len == 0 || start.checked_add(len).map_or(true, |end| end > self.spare_len) {
                return Err(Error::OutOfBounds { start, len });
            }
            for sector in start..start + len {
                if state.reserved.get(sector) || state.allocated.get(sector) {
                    return Err(Error::ReservationOverlap { sector });
                }
            }
        }
        for (i, &(start, len_a)) in ranges.iter().enumerate() {
            for &(other, len_b) in &ranges[i + 1..] {
                if start < other + len_b && other < start + len_a {
                    return Err(Error::ReservationOverlap {
                        sector: start.max(other),
                    });
                }
            }
        }

        for &(start, len) in ranges {
            for sector in start..start + len {
                state.reserved.set(sector);
            }
            state.ranges.push((start, len));
        }
        // Cached candidates may now be reserved; drop them all.
        state.cache.clear();

        debug!(ranges = ranges.len(), "reserved metadata ranges");
        Ok(())
    }

    /// Allocate the next free spare sector.
    ///
    /// First-fit forward from the cursor, wrapping once around the whole
    /// spare area before reporting exhaustion. Returns `None` when every
    /// sector is reserved or allocated.
    pub fn allocate_next(&self) -> Option<u64> {
        let mut state = self.state.lock();

        if self.cache_enabled {
            // Cached candidates are re-validated; a sector reserved or
            // allocated since it was cached is simply discarded.
            while let Some(sector) = state.cache.pop_front() {
                if !state.reserved.get(sector) && !state.allocated.get(sector) {
                    state.allocated.set(sector);
                    state.cache_hits += 1;
                    return Some(sector);
                }
            }
            state.cache_misses += 1;
        }

        let found = self.scan_from_cursor(&mut state)?;
        state.allocated.set(found);
        state.cursor = (found + 1) % self.spare_len;

        if self.cache_enabled {
            self.refill_cache(&mut state);
        }
        Some(found)
    }

    /// Return an allocated sector to the free pool.
    pub fn release(&self, sector: u64) -> Result<()> {
        if sector >= self.spare_len {
            return Err(Error::OutOfBounds {
                start: sector,
                len: 1,
            });
        }
        let mut state = self.state.lock();
        if !state.allocated.get(sector) {
            return Err(Error::NotFound { sector });
        }
        state.allocated.clear(sector);
        Ok(())
    }

    /// Whether a sector is withheld for metadata.
    pub fn is_reserved(&self, sector: u64) -> bool {
        sector < self.spare_len && self.state.lock().reserved.get(sector)
    }

    /// Whether a sector is currently allocated to a remap.
    pub fn is_allocated(&self, sector: u64) -> bool {
        sector < self.spare_len && self.state.lock().allocated.get(sector)
    }

    /// Allocator statistics.
    pub fn stats(&self) -> SpareStats {
        let state = self.state.lock();
        let reserved = state.reserved.count_set();
        let allocated = state.allocated.count_set();
        SpareStats {
            total: self.spare_len,
            reserved,
            allocated,
            available: self.spare_len - reserved - allocated,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
        }
    }

    /// One full circuit of the spare area starting at the cursor.
    fn scan_from_cursor(&self, state: &mut AllocState) -> Option<u64> {
        let start = state.cursor;
        for offset in 0..self.spare_len {
            let sector = (start + offset) % self.spare_len;
            if !state.reserved.get(sector) && !state.allocated.get(sector) {
                return Some(sector);
            }
        }
        None
    }

    /// Top the cache up with free sectors found after the cursor. Examines
    /// at most `refill_limit` candidates so refill latency stays bounded.
    fn refill_cache(&self, state: &mut AllocState) {
        let mut probe = state.cursor;
        let mut examined = 0usize;
        while state.cache.len() < ALLOC_CACHE_CAPACITY && examined < self.refill_limit {
            if !state.reserved.get(probe)
                && !state.allocated.get(probe)
                && !state.cache.contains(&probe)
            {
                state.cache.push_back(probe);
            }
            probe = (probe + 1) % self.spare_len;
            examined += 1;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
