// SPDX-License-Identifier: MPL-2.0

//! An allocator of device-visible address ranges (IOVAs).
//!
//! The allocator hands out non-overlapping, aligned sub-ranges of a fixed
//! span with a first-fit policy. Free space is tracked as a set of discrete
//! intervals ordered by address.
//!
//! Freed ranges are **not** coalesced with their neighbours. A freed range
//! is re-inserted as-is and can only satisfy requests that fit inside it.
//! This keeps `free` cheap and predictable, at the price of fragmentation
//! under heavy churn of differently sized requests.
//!
//! The allocator holds no lock. Callers serialize all accesses.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

use alloc::collections::BTreeMap;
use core::{fmt, ops::Range};

/// Errors returned by [`IovaAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free interval is large enough for the request.
    OutOfSpace,
    /// The length or the alignment does not suit the allocator's granule.
    InvalidArgs,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfSpace => write!(f, "no free IOVA range is large enough"),
            AllocError::InvalidArgs => write!(f, "invalid IOVA allocation arguments"),
        }
    }
}

/// A first-fit range allocator over `[start, end)`.
#[derive(Debug)]
pub struct IovaAllocator {
    fullrange: Range<usize>,
    granule: usize,
    /// Free intervals, keyed by start address, valued by end address.
    free: BTreeMap<usize, usize>,
    free_bytes: usize,
}

impl IovaAllocator {
    /// Creates an allocator managing `range` in units of `granule` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `granule` is not a power of two, if `range` is empty, or
    /// if either end of `range` is not a multiple of `granule`.
    pub fn new(range: Range<usize>, granule: usize) -> Self {
        assert!(granule.is_power_of_two());
        assert!(range.start < range.end, "empty IOVA range {:#x?}", range);
        assert!(
            range.start % granule == 0 && range.end % granule == 0,
            "IOVA range {:#x?} is not aligned to {:#x}",
            range,
            granule
        );

        let mut free = BTreeMap::new();
        free.insert(range.start, range.end);
        Self {
            free_bytes: range.len(),
            fullrange: range,
            granule,
            free,
        }
    }

    /// Allocates `len` bytes whose start address is a multiple of `align`.
    ///
    /// The lowest free interval that can hold the aligned request is used.
    /// Whatever is left of it before and after the allocated range stays
    /// free as separate intervals.
    ///
    /// A failed allocation leaves the allocator untouched.
    pub fn alloc(&mut self, len: usize, align: usize) -> Result<Range<usize>, AllocError> {
        if len == 0
            || len % self.granule != 0
            || !align.is_power_of_two()
            || align < self.granule
        {
            return Err(AllocError::InvalidArgs);
        }

        let (start, end, aligned) = self
            .free
            .iter()
            .find_map(|(&start, &end)| {
                let aligned = start.checked_next_multiple_of(align)?;
                let alloc_end = aligned.checked_add(len)?;
                (alloc_end <= end).then_some((start, end, aligned))
            })
            .ok_or(AllocError::OutOfSpace)?;

        self.free.remove(&start);
        if start < aligned {
            self.free.insert(start, aligned);
        }
        if aligned + len < end {
            self.free.insert(aligned + len, end);
        }
        self.free_bytes -= len;

        Ok(aligned..aligned + len)
    }

    /// Returns `range` to the allocator as a discrete free interval.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty, misaligned, outside the managed span,
    /// or overlaps space that is already free.
    pub fn free(&mut self, range: Range<usize>) {
        assert!(
            range.start < range.end
                && range.start >= self.fullrange.start
                && range.end <= self.fullrange.end,
            "freeing IOVA range {:#x?} outside {:#x?}",
            range,
            self.fullrange
        );
        assert!(
            range.start % self.granule == 0 && range.end % self.granule == 0,
            "freeing misaligned IOVA range {:#x?}",
            range
        );

        if let Some((_, &prev_end)) = self.free.range(..=range.start).next_back() {
            assert!(
                prev_end <= range.start,
                "double free of IOVA range {:#x?}",
                range
            );
        }
        if let Some((&next_start, _)) = self.free.range(range.start..).next() {
            assert!(
                next_start >= range.end,
                "double free of IOVA range {:#x?}",
                range
            );
        }

        self.free_bytes += range.len();
        self.free.insert(range.start, range.end);
    }

    /// Returns the total number of free bytes.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Returns the number of discrete free intervals.
    pub fn nr_free_intervals(&self) -> usize {
        self.free.len()
    }

    /// Returns the whole span managed by the allocator.
    pub fn fullrange(&self) -> Range<usize> {
        self.fullrange.clone()
    }

    /// Returns the allocation granule in bytes.
    pub fn granule(&self) -> usize {
        self.granule
    }
}
