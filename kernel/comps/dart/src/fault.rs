// SPDX-License-Identifier: MPL-2.0

use core::fmt;

use bit_field::BitField;

use crate::{
    registers::{ErrorStatus, RegisterPort, DART_ERROR, DART_ERROR_ADDR_HI, DART_ERROR_ADDR_LO},
    Dart, State,
};

/// A translation fault latched by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DartFault {
    status: u32,
    addr: u64,
}

impl DartFault {
    /// Returns the decoded error status.
    pub fn status(&self) -> ErrorStatus {
        ErrorStatus::from_bits_truncate(self.status)
    }

    /// Returns the raw value of the error register.
    pub fn raw_status(&self) -> u32 {
        self.status
    }

    /// Returns the device address whose access faulted.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Returns the stream that issued the faulting access.
    pub fn stream_id(&self) -> usize {
        self.status.get_bits(24..28) as usize
    }
}

impl fmt::Display for DartFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DART fault on stream {} at {:#x}: {:?}",
            self.stream_id(),
            self.addr,
            self.status() - ErrorStatus::FLAG
        )
    }
}

fn read_pending<R: RegisterPort>(regs: &R) -> Option<DartFault> {
    let status = regs.read32(DART_ERROR);
    if !ErrorStatus::from_bits_truncate(status).contains(ErrorStatus::FLAG) {
        return None;
    }
    let lo = regs.read32(DART_ERROR_ADDR_LO) as u64;
    let hi = regs.read32(DART_ERROR_ADDR_HI) as u64;
    Some(DartFault {
        status,
        addr: hi << 32 | lo,
    })
}

impl<R: RegisterPort> Dart<R> {
    /// Returns the fault latched by the hardware, if any.
    ///
    /// An unmanaged instance never reports faults.
    pub fn pending_fault(&self) -> Option<DartFault> {
        if let State::Passive(_) = self.state {
            return None;
        }
        read_pending(&self.regs)
    }

    /// Handles the fault interrupt of the instance.
    ///
    /// Returns `false` if the instance did not raise the interrupt.
    ///
    /// # Panics
    ///
    /// A latched fault means a device accessed memory it was not given, so
    /// the fault is acknowledged, the instance is halted and this panics.
    pub fn handle_irq(&self) -> bool {
        let Some(fault) = self.pending_fault() else {
            return false;
        };
        self.regs.write32(DART_ERROR, fault.raw_status());
        self.halt(format_args!("{}", fault));
    }
}
