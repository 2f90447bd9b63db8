// SPDX-License-Identifier: MPL-2.0

//! Loading and unloading DMA buffers into the device address space.

use core::{marker::PhantomData, ops::Range};

use iova_alloc::IovaAllocator;
use log::{trace, warn};
use smallvec::SmallVec;

use crate::{
    invalidate::TlbInvalidator,
    page_table::{TranslationTable, MAX_PADDR},
    registers::RegisterPort,
    Dart, DartError, Daddr, Paddr, State, PAGE_SIZE,
};

/// A physically contiguous piece of a DMA buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub paddr: Paddr,
    pub len: usize,
}

impl DmaSegment {
    pub const fn new(paddr: Paddr, len: usize) -> Self {
        Self { paddr, len }
    }
}

impl From<(Paddr, usize)> for DmaSegment {
    fn from((paddr, len): (Paddr, usize)) -> Self {
        Self::new(paddr, len)
    }
}

impl From<Range<Paddr>> for DmaSegment {
    fn from(range: Range<Paddr>) -> Self {
        Self::new(range.start, range.end.saturating_sub(range.start))
    }
}

/// A segment as the device sees it after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedSegment {
    daddr: Daddr,
    len: usize,
    iova: Option<Range<Daddr>>,
}

impl MappedSegment {
    /// Returns the device address of the first byte of the segment.
    pub fn daddr(&self) -> Daddr {
        self.daddr
    }

    /// Returns the length of the segment in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    /// Returns the page-aligned IOVA range backing the segment, or `None`
    /// if the segment is not translated.
    pub fn iova(&self) -> Option<&Range<Daddr>> {
        self.iova.as_ref()
    }
}

type Segments = SmallVec<[MappedSegment; 4]>;

/// The device view of a loaded DMA buffer.
///
/// The mapping borrows the instance that loaded it and stays in place until
/// it is passed to [`Dart::unload`] of that same instance.
#[must_use]
#[derive(Debug)]
pub struct DmaMapping<'a> {
    owner: usize,
    segments: Segments,
    _dart: PhantomData<&'a ()>,
}

impl DmaMapping<'_> {
    fn new(owner: usize, segments: Segments) -> Self {
        Self {
            owner,
            segments,
            _dart: PhantomData,
        }
    }

    /// Returns the segments in the order they were loaded.
    pub fn segments(&self) -> &[MappedSegment] {
        &self.segments
    }
}

/// The mutable translation state of an instance, guarded by one lock.
pub(crate) struct Translation {
    pub(crate) allocator: IovaAllocator,
    pub(crate) table: TranslationTable,
    pub(crate) invalidator: TlbInvalidator,
}

impl Translation {
    /// Allocates IOVA pages for `segment` and fills in their entries.
    ///
    /// The TLB is not flushed.
    fn map_segment(&mut self, segment: &DmaSegment) -> Result<MappedSegment, DartError> {
        check_segment(segment)?;

        let offset = segment.paddr % PAGE_SIZE;
        let frame_base = segment.paddr - offset;
        let nr_pages = (offset + segment.len).div_ceil(PAGE_SIZE);
        let iova = self.allocator.alloc(nr_pages * PAGE_SIZE, PAGE_SIZE)?;

        let last_byte = offset + segment.len - 1;
        for i in 0..nr_pages {
            let start_offset = if i == 0 { offset } else { 0 };
            let end_offset = if i == nr_pages - 1 {
                last_byte % PAGE_SIZE
            } else {
                PAGE_SIZE - 1
            };
            self.table.lookup(iova.start + i * PAGE_SIZE).set_valid(
                frame_base + i * PAGE_SIZE,
                start_offset,
                end_offset,
            );
        }

        Ok(MappedSegment {
            daddr: iova.start + offset,
            len: segment.len,
            iova: Some(iova),
        })
    }

    fn invalidate(&mut self, iova: &Range<Daddr>) {
        for daddr in iova.clone().step_by(PAGE_SIZE) {
            self.table.lookup(daddr).invalidate();
        }
    }
}

fn check_segment(segment: &DmaSegment) -> Result<(), DartError> {
    let reachable = segment
        .paddr
        .checked_add(segment.len)
        .is_some_and(|end| end <= MAX_PADDR);
    if segment.len == 0 || !reachable {
        warn!("rejecting DMA segment {:x?}", segment);
        return Err(DartError::InvalidArgs);
    }
    Ok(())
}

impl<R: RegisterPort> Dart<R> {
    /// Loads a DMA buffer, making each of its segments reachable by the
    /// devices behind this instance.
    ///
    /// Either every segment is loaded or, on error, none is: the segments
    /// loaded before the failing one are unloaded again.
    ///
    /// # Panics
    ///
    /// Panics if the instance has been halted, or if the TLB flush hangs.
    pub fn load<I>(&self, segments: I) -> Result<DmaMapping<'_>, DartError>
    where
        I: IntoIterator<Item = DmaSegment>,
    {
        self.ensure_not_halted();

        let translation = match &self.state {
            State::Translated(translation) => translation,
            State::Bypass => {
                return load_identity(segments).map(|mapped| DmaMapping::new(self.id(), mapped));
            }
            State::Passive(_) => return Err(DartError::NotManaged),
        };

        let mut mapped = Segments::new();
        let mut translation = translation.lock();
        // The instance may have halted while this call waited for the lock.
        self.ensure_not_halted();
        for segment in segments {
            match translation.map_segment(&segment) {
                Ok(segment) => mapped.push(segment),
                Err(err) => {
                    if err == DartError::AllocationExhausted {
                        warn!(
                            "DART IOVA space exhausted, {:#x} bytes free",
                            translation.allocator.free_bytes()
                        );
                    }
                    self.unmap_segments(&mut translation, &mapped);
                    return Err(err);
                }
            }
        }
        if mapped.is_empty() {
            return Err(DartError::InvalidArgs);
        }

        self.flush_tlb(&translation);
        trace!("DART loaded {:x?}", mapped);
        Ok(DmaMapping::new(self.id(), mapped))
    }

    /// Unloads a DMA buffer. The devices can no longer reach it when this
    /// returns.
    ///
    /// # Panics
    ///
    /// Panics if `mapping` was loaded by another instance, if the instance
    /// has been halted, or if the TLB flush hangs.
    pub fn unload(&self, mapping: DmaMapping<'_>) {
        assert_eq!(
            mapping.owner,
            self.id(),
            "DMA mapping unloaded from a DART that did not load it"
        );
        self.ensure_not_halted();

        let State::Translated(translation) = &self.state else {
            return;
        };
        let mut translation = translation.lock();
        self.ensure_not_halted();
        self.unmap_segments(&mut translation, &mapping.segments);
        trace!("DART unloaded {:x?}", mapping.segments);
    }

    /// Identifies the instance. Stable while any of its mappings is alive,
    /// since each mapping borrows the instance.
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Invalidates the segments, flushes the TLB once, then releases their
    /// IOVA ranges.
    fn unmap_segments(&self, translation: &mut Translation, segments: &[MappedSegment]) {
        let mut iovas = segments.iter().filter_map(|segment| segment.iova()).peekable();
        if iovas.peek().is_none() {
            return;
        }

        for iova in iovas.clone() {
            translation.invalidate(iova);
        }
        self.flush_tlb(translation);
        for iova in iovas {
            translation.allocator.free(iova.clone());
        }
    }
}

fn load_identity<I>(segments: I) -> Result<Segments, DartError>
where
    I: IntoIterator<Item = DmaSegment>,
{
    let mut mapped = Segments::new();
    for segment in segments {
        check_segment(&segment)?;
        mapped.push(MappedSegment {
            daddr: segment.paddr,
            len: segment.len,
            iova: None,
        });
    }
    if mapped.is_empty() {
        return Err(DartError::InvalidArgs);
    }
    Ok(mapped)
}
