// SPDX-License-Identifier: MPL-2.0

//! Options for bringing up a DART instance.

use core::ops::Range;

use log::error;

use crate::{page_table::MAX_IOVA_LIMIT, DartError, Daddr, MAX_STREAMS, PAGE_SIZE};

/// Options for creating a [`Dart`](crate::Dart).
///
/// The defaults translate a 4 GiB IOVA space for all 16 streams and never
/// take over an instance that firmware left translating.
#[derive(Debug, Clone)]
pub struct DartOptions {
    pub(crate) iova_space: Range<Daddr>,
    pub(crate) nr_streams: usize,
    pub(crate) allow_bypass: bool,
    pub(crate) skip_active: bool,
    pub(crate) flush_spin_limit: usize,
}

impl DartOptions {
    /// The default number of register polls before a TLB flush is
    /// considered hung.
    pub const DEFAULT_FLUSH_SPIN_LIMIT: usize = 1_000_000;

    /// Creates the default options.
    pub fn new() -> Self {
        Self {
            iova_space: 0..1 << 32,
            nr_streams: MAX_STREAMS,
            allow_bypass: false,
            skip_active: true,
            flush_spin_limit: Self::DEFAULT_FLUSH_SPIN_LIMIT,
        }
    }

    /// Sets the IOVA space `[base, limit)` covered by the translation table.
    ///
    /// The first and the last page of the space are never handed out.
    /// Both ends must be page-aligned, the space must hold at least three
    /// pages and `limit` must not exceed 64 GiB.
    ///
    /// The default value is `0..1 << 32`.
    pub fn iova_space(&mut self, iova_space: Range<Daddr>) -> &mut Self {
        self.iova_space = iova_space;
        self
    }

    /// Sets the number of streams behind the instance, from 1 to 16.
    ///
    /// The default value is 16.
    pub fn nr_streams(&mut self, nr_streams: usize) -> &mut Self {
        self.nr_streams = nr_streams;
        self
    }

    /// Sets whether the instance may pass addresses through untranslated
    /// when the hardware supports it.
    ///
    /// The default value is `false`.
    pub fn allow_bypass(&mut self, allow_bypass: bool) -> &mut Self {
        self.allow_bypass = allow_bypass;
        self
    }

    /// Sets whether an instance found with translation already enabled on
    /// a stream is left untouched.
    ///
    /// Such an instance is typically driving a display pipeline set up by
    /// firmware. Taking it over tears that pipeline down.
    ///
    /// The default value is `true`.
    pub fn skip_active(&mut self, skip_active: bool) -> &mut Self {
        self.skip_active = skip_active;
        self
    }

    /// Sets how many times a TLB flush polls for completion before the
    /// hardware is declared faulty.
    ///
    /// The default value is [`Self::DEFAULT_FLUSH_SPIN_LIMIT`].
    pub fn flush_spin_limit(&mut self, flush_spin_limit: usize) -> &mut Self {
        self.flush_spin_limit = flush_spin_limit;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), DartError> {
        let space = &self.iova_space;
        let space_ok = space.start % PAGE_SIZE == 0
            && space.end % PAGE_SIZE == 0
            && space.start < space.end
            && space.end - space.start >= 3 * PAGE_SIZE
            && space.end <= MAX_IOVA_LIMIT;
        if !space_ok {
            error!("invalid DART IOVA space {:#x?}", space);
            return Err(DartError::InvalidArgs);
        }
        if !(1..=MAX_STREAMS).contains(&self.nr_streams) {
            error!("invalid DART stream count {}", self.nr_streams);
            return Err(DartError::InvalidArgs);
        }
        if self.flush_spin_limit == 0 {
            error!("DART flush spin limit must be positive");
            return Err(DartError::InvalidArgs);
        }
        Ok(())
    }

    /// Returns the IOVA space without its reserved first and last page.
    pub(crate) fn allocatable_range(&self) -> Range<Daddr> {
        self.iova_space.start + PAGE_SIZE..self.iova_space.end - PAGE_SIZE
    }

    pub(crate) fn stream_mask(&self) -> u32 {
        ((1u64 << self.nr_streams) - 1) as u32
    }
}

impl Default for DartOptions {
    fn default() -> Self {
        Self::new()
    }
}
