// SPDX-License-Identifier: MPL-2.0

//! Driver core for the DART, the IOMMU in front of DMA-capable devices.
//!
//! A DART gives the devices behind it a page-granular view of physical
//! memory. All streams of one instance share a single two-level
//! translation table, which this crate builds once at bring-up, keeps in
//! lock-step with the hardware and invalidates from the hardware TLB
//! whenever mappings change.
//!
//! The entry point is [`Dart`]. Bring-up selects one of three modes:
//!  - **Translated**: the table is built and every stream translates
//!    through it. [`Dart::load`] and [`Dart::unload`] manage mappings.
//!  - **Bypass**: streams pass addresses through untranslated.
//!  - **Passive**: the instance is locked by firmware or already in use,
//!    and is left untouched.
//!
//! Hardware faults are fatal. A hung TLB flush or a fault interrupt halts
//! the instance and panics, since the integrity of the table can no longer
//! be trusted.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod fault;
mod invalidate;
mod mapping;
mod options;
mod page_table;
pub mod registers;

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

pub use fault::DartFault;
use invalidate::TlbInvalidator;
use iova_alloc::{AllocError, IovaAllocator};
use log::{debug, error, info};
pub use mapping::{DmaMapping, DmaSegment, MappedSegment};
use mapping::Translation;
pub use options::DartOptions;
pub use page_table::{LinearMapping, OffsetMapping, PageEntry, MAX_IOVA_LIMIT, MAX_PADDR};
use page_table::TranslationTable;
pub use registers::{MmioRegisters, RegisterPort};
use registers::{
    dart_tcr, dart_ttbr, Config, Params2, Tcr, Ttbr, DART_CONFIG, DART_ERROR, DART_PARAMS2,
    DART_SID_ENABLE, NR_TTBRS, TTBR_SHIFT,
};
use spin::Mutex;

/// Physical addresses.
pub type Paddr = usize;
/// Device addresses (IOVAs).
pub type Daddr = usize;
/// Kernel virtual addresses.
pub type Vaddr = usize;

/// log2 of the translation granule.
pub const PAGE_SHIFT: usize = 14;
/// The translation granule.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// The maximum number of streams behind one instance.
pub const MAX_STREAMS: usize = 16;

/// An enumeration representing possible errors related to the DART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DartError {
    /// No free IOVA range is large enough for the request.
    AllocationExhausted,
    /// The arguments are malformed or cannot be expressed to the hardware.
    InvalidArgs,
    /// The instance provides no translation service.
    NotManaged,
}

impl fmt::Display for DartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DartError::AllocationExhausted => write!(f, "DART IOVA space exhausted"),
            DartError::InvalidArgs => write!(f, "invalid DART arguments"),
            DartError::NotManaged => write!(f, "DART instance is not managed"),
        }
    }
}

impl From<AllocError> for DartError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfSpace => DartError::AllocationExhausted,
            AllocError::InvalidArgs => DartError::InvalidArgs,
        }
    }
}

/// The operating mode selected at bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DartMode {
    /// Streams translate through the table managed by this crate.
    Translated,
    /// Streams pass addresses through untranslated.
    Bypass,
    /// The instance is left as found and provides no service.
    Passive(PassiveReason),
}

/// Why an instance was left passive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveReason {
    /// Firmware locked the configuration.
    Locked,
    /// A stream was already translating through a firmware-owned table.
    ActiveTranslation,
}

enum State {
    Passive(PassiveReason),
    Bypass,
    Translated(Mutex<Translation>),
}

/// A DART instance.
pub struct Dart<R: RegisterPort> {
    regs: R,
    nr_streams: usize,
    state: State,
    halted: AtomicBool,
}

impl<R: RegisterPort> Dart<R> {
    /// Brings up the instance behind `regs`.
    ///
    /// Table memory is allocated from the kernel heap and reached by the
    /// hardware through `mapping`.
    pub fn new(
        regs: R,
        mapping: &impl LinearMapping,
        options: &DartOptions,
    ) -> Result<Self, DartError> {
        options.validate()?;

        let state = match select_mode(&regs, options) {
            DartMode::Passive(reason) => {
                info!("DART left unmanaged: {:?}", reason);
                State::Passive(reason)
            }
            DartMode::Bypass => {
                enable_bypass(&regs, options.nr_streams);
                info!("DART streams bypassed");
                State::Bypass
            }
            DartMode::Translated => {
                let translation = Translation {
                    allocator: IovaAllocator::new(options.allocatable_range(), PAGE_SIZE),
                    table: TranslationTable::build(options.iova_space.clone(), mapping)?,
                    invalidator: TlbInvalidator::new(
                        options.stream_mask(),
                        options.flush_spin_limit,
                    ),
                };
                State::Translated(Mutex::new(translation))
            }
        };

        let dart = Self {
            regs,
            nr_streams: options.nr_streams,
            state,
            halted: AtomicBool::new(false),
        };
        if let State::Translated(translation) = &dart.state {
            dart.enable_translation(&translation.lock(), options.stream_mask());
            info!("DART enabled for {} streams", dart.nr_streams);
        }
        Ok(dart)
    }

    /// Returns the mode selected at bring-up.
    pub fn mode(&self) -> DartMode {
        match &self.state {
            State::Passive(reason) => DartMode::Passive(*reason),
            State::Bypass => DartMode::Bypass,
            State::Translated(_) => DartMode::Translated,
        }
    }

    /// Returns whether the instance accepts [`Dart::load`] calls.
    pub fn is_managed(&self) -> bool {
        !matches!(self.state, State::Passive(_))
    }

    /// Returns the number of streams behind the instance.
    pub fn nr_streams(&self) -> usize {
        self.nr_streams
    }

    /// Returns whether the instance has been halted by a hardware fault.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Returns the range from which device addresses are handed out.
    pub fn iova_range(&self) -> Option<core::ops::Range<Daddr>> {
        let State::Translated(translation) = &self.state else {
            return None;
        };
        Some(translation.lock().allocator.fullrange())
    }

    /// Returns the number of unallocated IOVA bytes.
    pub fn free_iova_bytes(&self) -> Option<usize> {
        let State::Translated(translation) = &self.state else {
            return None;
        };
        Some(translation.lock().allocator.free_bytes())
    }

    /// Returns the page entry currently translating `daddr`.
    pub fn page_entry(&self, daddr: Daddr) -> Option<PageEntry> {
        let State::Translated(translation) = &self.state else {
            return None;
        };
        translation.lock().table.entry(daddr)
    }

    /// Returns the physical address a device reaches through `daddr`, or
    /// `None` if the access would fault.
    pub fn translate(&self, daddr: Daddr) -> Option<Paddr> {
        match &self.state {
            State::Translated(translation) => translation.lock().table.translate(daddr),
            State::Bypass => Some(daddr),
            State::Passive(_) => None,
        }
    }

    /// Points every stream at the table and turns translation on.
    fn enable_translation(&self, translation: &Translation, stream_mask: u32) {
        let error = self.regs.read32(DART_ERROR);
        self.regs.write32(DART_ERROR, error);

        let ttbr = (translation.table.root_paddr() >> TTBR_SHIFT) as u32 | Ttbr::VALID.bits();
        for sid in 0..self.nr_streams {
            self.regs.write32(dart_ttbr(sid, 0), ttbr);
            for idx in 1..NR_TTBRS {
                self.regs.write32(dart_ttbr(sid, idx), 0);
            }
        }
        debug!("DART TTBRs set to {:#x}", ttbr);

        self.flush_tlb(translation);

        self.regs.write32(DART_SID_ENABLE, stream_mask);
        for sid in 0..self.nr_streams {
            self.regs.write32(dart_tcr(sid), Tcr::TRANSLATE_ENABLE.bits());
        }
    }

    /// Flushes the TLB, halting the instance if the hardware never completes.
    fn flush_tlb(&self, translation: &Translation) {
        if let Err(timeout) = translation.invalidator.flush(&self.regs) {
            self.halt(format_args!(
                "DART TLB flush timed out after {} polls",
                timeout.polls
            ));
        }
    }

    /// Stops all further use of the instance and escalates.
    fn halt(&self, reason: fmt::Arguments) -> ! {
        self.halted.store(true, Ordering::Release);
        error!("{}", reason);
        panic!("{}", reason);
    }

    fn ensure_not_halted(&self) {
        if self.is_halted() {
            panic!("DART used after a fatal hardware fault");
        }
    }
}

fn select_mode<R: RegisterPort>(regs: &R, options: &DartOptions) -> DartMode {
    let config = Config::from_bits_truncate(regs.read32(DART_CONFIG));
    if config.contains(Config::LOCK) {
        return DartMode::Passive(PassiveReason::Locked);
    }

    if options.skip_active && (0..options.nr_streams).any(|sid| is_translating(regs, sid)) {
        return DartMode::Passive(PassiveReason::ActiveTranslation);
    }

    let params2 = Params2::from_bits_truncate(regs.read32(DART_PARAMS2));
    if params2.contains(Params2::BYPASS_SUPPORT) && options.allow_bypass {
        return DartMode::Bypass;
    }

    DartMode::Translated
}

fn is_translating<R: RegisterPort>(regs: &R, sid: usize) -> bool {
    let tcr = Tcr::from_bits_truncate(regs.read32(dart_tcr(sid)));
    let ttbr = Ttbr::from_bits_truncate(regs.read32(dart_ttbr(sid, 0)));
    tcr.contains(Tcr::TRANSLATE_ENABLE) && ttbr.contains(Ttbr::VALID)
}

fn enable_bypass<R: RegisterPort>(regs: &R, nr_streams: usize) {
    for sid in 0..nr_streams {
        regs.write32(dart_tcr(sid), (Tcr::BYPASS_DART | Tcr::BYPASS_DAPF).bits());
    }
}
