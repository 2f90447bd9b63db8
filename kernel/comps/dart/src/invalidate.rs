// SPDX-License-Identifier: MPL-2.0

//! TLB invalidation.

use core::hint::spin_loop;

use crate::registers::{RegisterPort, TlbOp, DART_TLB_OP, DART_TLB_OP_SIDMASK};

/// The TLB flush did not complete within the polling budget.
///
/// The state of the hardware TLB is unknown after this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushTimeout {
    pub(crate) polls: usize,
}

/// Issues TLB flushes for all streams of an instance.
#[derive(Debug)]
pub(crate) struct TlbInvalidator {
    stream_mask: u32,
    spin_limit: usize,
}

impl TlbInvalidator {
    pub(crate) fn new(stream_mask: u32, spin_limit: usize) -> Self {
        debug_assert!(spin_limit > 0);
        Self {
            stream_mask,
            spin_limit,
        }
    }

    /// Flushes the TLB and waits until the hardware reports completion.
    ///
    /// This busy-waits; it never sleeps.
    pub(crate) fn flush<R: RegisterPort>(&self, regs: &R) -> Result<(), FlushTimeout> {
        // Table updates must be visible before the hardware refetches them.
        regs.fence();
        regs.write32(DART_TLB_OP_SIDMASK, self.stream_mask);
        regs.write32(DART_TLB_OP, TlbOp::FLUSH.bits());

        for _ in 0..self.spin_limit {
            let op = TlbOp::from_bits_truncate(regs.read32(DART_TLB_OP));
            if !op.contains(TlbOp::BUSY) {
                return Ok(());
            }
            spin_loop();
        }

        Err(FlushTimeout {
            polls: self.spin_limit,
        })
    }
}
