// SPDX-License-Identifier: MPL-2.0

//! DART registers and the port through which they are accessed.

mod flags;

use alloc::sync::Arc;
use core::{
    ptr::NonNull,
    sync::atomic::{fence, Ordering},
};

pub use flags::{Config, ErrorStatus, Params2, Tcr, TlbOp, Ttbr};
use volatile::VolatilePtr;

use crate::MAX_STREAMS;

pub const DART_PARAMS2: usize = 0x0008;
pub const DART_TLB_OP: usize = 0x0020;
pub const DART_TLB_OP_SIDMASK: usize = 0x0034;
pub const DART_ERROR: usize = 0x0040;
pub const DART_ERROR_ADDR_LO: usize = 0x0050;
pub const DART_ERROR_ADDR_HI: usize = 0x0054;
pub const DART_CONFIG: usize = 0x0060;
pub const DART_SID_ENABLE: usize = 0x00fc;

/// The size of the register block.
pub const DART_REGS_SIZE: usize = 0x0400;

/// The number of table base registers of each stream.
pub const NR_TTBRS: usize = 4;
/// The shift applied to the table address stored in a TTBR.
pub const TTBR_SHIFT: usize = 12;

/// Returns the offset of the translation control register of `sid`.
pub const fn dart_tcr(sid: usize) -> usize {
    assert!(sid < MAX_STREAMS);
    0x0100 + 4 * sid
}

/// Returns the offset of the `idx`-th table base register of `sid`.
pub const fn dart_ttbr(sid: usize, idx: usize) -> usize {
    assert!(sid < MAX_STREAMS && idx < NR_TTBRS);
    0x0200 + 16 * sid + 4 * idx
}

/// Access to the memory-mapped registers of one DART instance.
///
/// All offsets are byte offsets from the start of the register block and
/// are 4-byte aligned.
pub trait RegisterPort: Send + Sync {
    /// Reads the 32-bit register at `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Writes `value` to the 32-bit register at `offset`.
    fn write32(&self, offset: usize, value: u32);

    /// Orders all prior memory writes, including those to the translation
    /// tables, before any subsequent register write.
    fn fence(&self) {
        fence(Ordering::SeqCst);
    }
}

impl<T: RegisterPort + ?Sized> RegisterPort for &T {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }

    fn fence(&self) {
        (**self).fence()
    }
}

impl<T: RegisterPort + ?Sized> RegisterPort for Arc<T> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }

    fn fence(&self) {
        (**self).fence()
    }
}

/// A [`RegisterPort`] over a mapped register block.
#[derive(Debug)]
pub struct MmioRegisters {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: The register block is device memory, not Rust objects. Accesses
// are single volatile loads and stores and the hardware arbitrates them.
unsafe impl Send for MmioRegisters {}
// SAFETY: See above.
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Creates an instance from the virtual address of a register block.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping of a DART register block that is at
    /// least `size` bytes long, 4-byte aligned, mapped as device memory and
    /// valid for the whole lifetime of the returned value.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        assert!(base.as_ptr() as usize % 4 == 0);
        Self { base, size }
    }

    fn register(&self, offset: usize) -> VolatilePtr<'_, u32> {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "invalid DART register offset {:#x}",
            offset
        );
        // SAFETY: The offset is aligned and in bounds, and the constructor
        // guarantees that the whole block is mapped.
        unsafe { VolatilePtr::new(self.base.byte_add(offset).cast::<u32>()) }
    }
}

impl RegisterPort for MmioRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.register(offset).read()
    }

    fn write32(&self, offset: usize, value: u32) {
        self.register(offset).write(value)
    }

    fn fence(&self) {
        #[cfg(target_arch = "aarch64")]
        // SAFETY: A full-system data synchronization barrier has no effect
        // other than ordering memory accesses.
        unsafe {
            core::arch::asm!("dsb sy", options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "aarch64"))]
        fence(Ordering::SeqCst);
    }
}
