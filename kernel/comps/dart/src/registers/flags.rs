// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

bitflags! {
    /// Hardware parameters, second word.
    pub struct Params2: u32 {
        /// The instance can pass addresses through untranslated.
        const BYPASS_SUPPORT =      1 << 0;
    }
}

bitflags! {
    /// TLB operation register.
    pub struct TlbOp: u32 {
        /// Set by hardware while a TLB operation is in progress.
        const BUSY =                1 << 2;
        /// Flushes the TLB entries of all streams selected in the
        /// stream mask register.
        const FLUSH =               1 << 20;
    }
}

bitflags! {
    /// Global configuration.
    pub struct Config: u32 {
        /// The configuration has been locked by firmware. Stream control
        /// and table base registers can no longer be changed.
        const LOCK =                1 << 15;
    }
}

bitflags! {
    /// Per-stream translation control.
    pub struct Tcr: u32 {
        /// Translates the stream through the table set in its TTBRs.
        const TRANSLATE_ENABLE =    1 << 7;
        /// Passes the stream's addresses through untranslated.
        const BYPASS_DART =         1 << 8;
        /// Disables the address prefetch filter for bypassed streams.
        const BYPASS_DAPF =         1 << 12;
    }
}

bitflags! {
    /// Per-stream translation table base. The bits below `VALID` hold the
    /// physical address of the first-level table shifted right by
    /// [`TTBR_SHIFT`](super::TTBR_SHIFT).
    pub struct Ttbr: u32 {
        /// The table base is valid.
        const VALID =               1 << 31;
    }
}

bitflags! {
    /// Latched error status. Bits 24..28 carry the faulting stream ID.
    ///
    /// The register is write-one-to-clear.
    pub struct ErrorStatus: u32 {
        /// No valid TTBR for the accessed address.
        const NO_TTBR =             1 << 0;
        /// The first-level entry for the accessed address is not a table.
        const NO_PMD =              1 << 1;
        /// The page entry for the accessed address is invalid.
        const NO_PTE =              1 << 2;
        /// A write outside the entry's sub-page window.
        const WRITE_FAULT =         1 << 3;
        /// A read outside the entry's sub-page window.
        const READ_FAULT =          1 << 4;
        /// An error is latched.
        const FLAG =                1 << 31;
    }
}
