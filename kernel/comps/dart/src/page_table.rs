// SPDX-License-Identifier: MPL-2.0

//! The two-level translation table shared by all streams of a DART.
//!
//! The first level is a single page of directory entries, each pointing at
//! a second-level table whose page entries map one IOVA page each. The
//! whole table is built for the configured IOVA space up front and never
//! grows, so a lookup is index arithmetic and cannot fail.

use alloc::{boxed::Box, vec::Vec};
use core::{
    fmt,
    mem::size_of,
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use bit_field::BitField;
use log::{error, info};

use crate::{DartError, Daddr, Paddr, Vaddr, PAGE_SHIFT, PAGE_SIZE};

/// The number of entries in one table page.
pub const NR_ENTRIES: usize = PAGE_SIZE / size_of::<u64>();

/// log2 of the IOVA bytes covered by one second-level table.
const TABLE_SHIFT: usize = PAGE_SHIFT + NR_ENTRIES.trailing_zeros() as usize;

/// The exclusive upper bound of an IOVA space the directory can cover.
pub const MAX_IOVA_LIMIT: usize = NR_ENTRIES << TABLE_SHIFT;

/// The exclusive upper bound of a physical address a table entry can hold.
pub const MAX_PADDR: usize = 1 << 36;

/// The kernel mapping through which table memory is reachable.
///
/// The translation table lives in kernel memory, but the DART walks it by
/// physical address.
pub trait LinearMapping {
    /// Returns the physical address backing the kernel virtual address.
    fn vaddr_to_paddr(&self, vaddr: Vaddr) -> Paddr;
}

/// A linear mapping of all physical memory at a fixed virtual base.
#[derive(Debug, Clone, Copy)]
pub struct OffsetMapping {
    base: Vaddr,
}

impl OffsetMapping {
    /// Creates a mapping where physical address zero is mapped at `base`.
    pub const fn new(base: Vaddr) -> Self {
        Self { base }
    }
}

impl LinearMapping for OffsetMapping {
    fn vaddr_to_paddr(&self, vaddr: Vaddr) -> Paddr {
        vaddr.wrapping_sub(self.base)
    }
}

/// The decoded value of a page entry.
///
/// Besides the frame, an entry carries a sub-page window
/// `[start_offset, end_offset]`: the bytes of the page the device may
/// access. Bytes outside the window are not guaranteed to be accessible
/// even though the entry is valid.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageEntry(u64);

impl PageEntry {
    const VALID: u64 = 1 << 0;
    const PADDR_BITS: Range<usize> = PAGE_SHIFT..36;
    const END_BITS: Range<usize> = 36..50;
    const START_BITS: Range<usize> = 50..64;

    fn new_page(paddr: Paddr, start_offset: usize, end_offset: usize) -> Self {
        debug_assert!(paddr % PAGE_SIZE == 0 && paddr < MAX_PADDR);
        debug_assert!(start_offset <= end_offset && end_offset < PAGE_SIZE);

        let mut bits = Self::VALID;
        bits.set_bits(Self::PADDR_BITS, (paddr >> PAGE_SHIFT) as u64)
            .set_bits(Self::END_BITS, end_offset as u64)
            .set_bits(Self::START_BITS, start_offset as u64);
        Self(bits)
    }

    /// Creates an entry from its raw hardware representation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw hardware representation.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Returns the physical address of the mapped frame.
    pub fn paddr(&self) -> Paddr {
        (self.0.get_bits(Self::PADDR_BITS) as usize) << PAGE_SHIFT
    }

    /// Returns the physical frame number.
    pub fn frame(&self) -> usize {
        self.0.get_bits(Self::PADDR_BITS) as usize
    }

    /// Returns the first accessible byte inside the page.
    pub fn start_offset(&self) -> usize {
        self.0.get_bits(Self::START_BITS) as usize
    }

    /// Returns the last accessible byte inside the page.
    pub fn end_offset(&self) -> usize {
        self.0.get_bits(Self::END_BITS) as usize
    }

    /// Returns the number of accessible bytes, zero for an invalid entry.
    pub fn covered_len(&self) -> usize {
        if self.is_valid() {
            self.end_offset() - self.start_offset() + 1
        } else {
            0
        }
    }

    /// Returns whether the byte at `offset` inside the page is accessible.
    pub fn covers(&self, offset: usize) -> bool {
        self.is_valid() && (self.start_offset()..=self.end_offset()).contains(&offset)
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut f = f.debug_struct("PageEntry");
        f.field("raw", &format_args!("{:#x}", self.0))
            .field("valid", &self.is_valid());
        if self.is_valid() {
            f.field("paddr", &format_args!("{:#x}", self.paddr()))
                .field("start_offset", &format_args!("{:#x}", self.start_offset()))
                .field("end_offset", &format_args!("{:#x}", self.end_offset()));
        }
        f.finish()
    }
}

/// A page entry slot in a second-level table.
#[repr(transparent)]
pub struct Pte(AtomicU64);

impl Pte {
    /// Reads the entry.
    pub fn get(&self) -> PageEntry {
        PageEntry(self.0.load(Ordering::Acquire))
    }

    /// Maps the page to the frame at `paddr` and makes the bytes
    /// `[start_offset, end_offset]` of it accessible.
    pub fn set_valid(&mut self, paddr: Paddr, start_offset: usize, end_offset: usize) {
        let entry = PageEntry::new_page(paddr, start_offset, end_offset);
        self.0.store(entry.0, Ordering::Release);
    }

    /// Clears the entry, including its frame.
    pub fn invalidate(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

/// A first-level entry pointing at a second-level table.
#[repr(transparent)]
struct DirEntry(AtomicU64);

impl DirEntry {
    const TABLE: u64 = 0b11;

    fn set_table(&self, paddr: Paddr) {
        self.0.store(paddr as u64 | Self::TABLE, Ordering::Release);
    }

    fn raw(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn is_table(&self) -> bool {
        self.raw() & Self::TABLE == Self::TABLE
    }
}

/// One page of table entries, aligned as the hardware requires.
#[repr(C, align(16384))]
struct TablePage<E>([E; NR_ENTRIES]);

const _: () = assert!(size_of::<TablePage<Pte>>() == PAGE_SIZE);
const _: () = assert!(size_of::<TablePage<DirEntry>>() == PAGE_SIZE);

impl TablePage<Pte> {
    fn new_zeroed() -> Box<Self> {
        // SAFETY: An all-zero `AtomicU64` is a valid value, and a zero
        // page entry is an invalid one.
        unsafe { Box::<Self>::new_zeroed().assume_init() }
    }
}

impl TablePage<DirEntry> {
    fn new_zeroed() -> Box<Self> {
        // SAFETY: An all-zero `AtomicU64` is a valid value, and a zero
        // directory entry points at no table.
        unsafe { Box::<Self>::new_zeroed().assume_init() }
    }
}

impl<E> TablePage<E> {
    fn vaddr(&self) -> Vaddr {
        self as *const Self as Vaddr
    }
}

/// The translation table of a DART.
pub(crate) struct TranslationTable {
    dir: Box<TablePage<DirEntry>>,
    root_paddr: Paddr,
    /// Second-level tables indexed by directory slot. Slots whose IOVA
    /// window lies below the space have no table.
    tables: Vec<Option<Box<TablePage<Pte>>>>,
    span: Range<Daddr>,
}

impl TranslationTable {
    /// Builds the zeroed table covering `span`.
    ///
    /// Every second-level table the span needs is allocated here and
    /// linked into the directory.
    pub(crate) fn build(
        span: Range<Daddr>,
        mapping: &impl LinearMapping,
    ) -> Result<Self, DartError> {
        assert!(span.start < span.end && span.end <= MAX_IOVA_LIMIT);
        assert!(span.start % PAGE_SIZE == 0 && span.end % PAGE_SIZE == 0);

        let dir = TablePage::<DirEntry>::new_zeroed();
        let root_paddr = table_paddr(mapping, dir.vaddr())?;

        let first = span.start >> TABLE_SHIFT;
        let last = (span.end - 1) >> TABLE_SHIFT;
        let mut tables = Vec::with_capacity(last + 1);
        for index in 0..=last {
            if index < first {
                tables.push(None);
                continue;
            }
            let table = TablePage::<Pte>::new_zeroed();
            dir.0[index].set_table(table_paddr(mapping, table.vaddr())?);
            tables.push(Some(table));
        }

        info!(
            "DART translation table built for {:#x?}: {} second-level tables, root at {:#x}",
            span,
            last + 1 - first,
            root_paddr
        );

        Ok(Self {
            dir,
            root_paddr,
            tables,
            span,
        })
    }

    /// Returns the physical address of the first-level table.
    pub(crate) fn root_paddr(&self) -> Paddr {
        self.root_paddr
    }

    /// Returns the page entry that translates `daddr`.
    ///
    /// # Panics
    ///
    /// Panics if `daddr` is outside the space the table was built for.
    pub(crate) fn lookup(&mut self, daddr: Daddr) -> &mut Pte {
        assert!(
            self.span.contains(&daddr),
            "device address {:#x} is outside the translation table",
            daddr
        );
        let (dir_index, pte_index) = split_index(daddr);
        let table = self.tables[dir_index]
            .as_mut()
            .expect("second-level tables cover the whole span");
        &mut table.0[pte_index]
    }

    /// Reads the page entry that translates `daddr`, if the table covers it.
    pub(crate) fn entry(&self, daddr: Daddr) -> Option<PageEntry> {
        if !self.span.contains(&daddr) {
            return None;
        }
        let (dir_index, pte_index) = split_index(daddr);
        if !self.dir.0[dir_index].is_table() {
            return None;
        }
        let table = self.tables[dir_index].as_ref()?;
        Some(table.0[pte_index].get())
    }

    /// Walks the table in software and returns the physical address the
    /// device would reach through `daddr`.
    pub(crate) fn translate(&self, daddr: Daddr) -> Option<Paddr> {
        let entry = self.entry(daddr)?;
        let offset = daddr % PAGE_SIZE;
        entry.covers(offset).then(|| entry.paddr() + offset)
    }
}

fn split_index(daddr: Daddr) -> (usize, usize) {
    let page = daddr >> PAGE_SHIFT;
    (page / NR_ENTRIES, page % NR_ENTRIES)
}

fn table_paddr(mapping: &impl LinearMapping, vaddr: Vaddr) -> Result<Paddr, DartError> {
    let paddr = mapping.vaddr_to_paddr(vaddr);
    if paddr % PAGE_SIZE != 0 || paddr >= MAX_PADDR {
        error!(
            "DART table page at {:#x} has physical address {:#x}, unreachable by hardware",
            vaddr, paddr
        );
        return Err(DartError::InvalidArgs);
    }
    Ok(paddr)
}
