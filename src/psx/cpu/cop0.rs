//! Coprocessor 0 (system control)

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::exception::PendingException;
use crate::psx::memory_map::{EXCEPTION_VECTOR_RAM, EXCEPTION_VECTOR_ROM};

pub const BPC: u8 = 3;
pub const BDA: u8 = 5;
pub const TAR: u8 = 6;
pub const DCIC: u8 = 7;
pub const BAD_VADDR: u8 = 8;
pub const BDAM: u8 = 9;
pub const BPCM: u8 = 11;
pub const SR: u8 = 12;
pub const CAUSE: u8 = 13;
pub const EPC: u8 = 14;
pub const PRID: u8 = 15;

/// Processor revision reported by PRId
pub const PROCESSOR_ID: u32 = 0x00000002;

const SR_WRITE_MASK: u32 = 0xf27f_ff3f;
const CAUSE_SOFTWARE_INTERRUPTS: u32 = 0x0000_0300;
/// Hardware interrupt line routed to CAUSE.IP2
const CAUSE_IP2: u32 = 1 << 10;
const DCIC_WRITE_MASK: u32 = 0xff80_f03f;

bitflags! {
    /// Status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const IEC = 1 << 0;
        const KUC = 1 << 1;
        const IEP = 1 << 2;
        const KUP = 1 << 3;
        const IEO = 1 << 4;
        const KUO = 1 << 5;
        const IM = 0xff << 8;
        const ISC = 1 << 16;
        const SWC = 1 << 17;
        const PZ = 1 << 18;
        const CM = 1 << 19;
        const PE = 1 << 20;
        const TS = 1 << 21;
        const BEV = 1 << 22;
        const RE = 1 << 25;
        const CU0 = 1 << 28;
        const CU1 = 1 << 29;
        const CU2 = 1 << 30;
        const CU3 = 1 << 31;
    }
}

/// The KU/IE three level mode stack
const MODE_STACK_MASK: u32 = 0x3f;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cop0 {
    pub sr: u32,
    pub cause: u32,
    pub epc: u32,
    pub bad_vaddr: u32,
    pub tar: u32,
    /// Debug breakpoint registers, stored but not acted on
    pub bpc: u32,
    pub bda: u32,
    pub dcic: u32,
    pub bdam: u32,
    pub bpcm: u32,
}

impl Cop0 {
    pub fn new() -> Self {
        Cop0 {
            sr: (Status::BEV | Status::TS).bits(),
            cause: 0,
            epc: 0,
            bad_vaddr: 0,
            tar: 0,
            bpc: 0,
            bda: 0,
            dcic: 0,
            bdam: 0,
            bpcm: 0,
        }
    }

    #[inline(always)]
    pub fn status(&self) -> Status {
        Status::from_bits_retain(self.sr)
    }

    /// SR.IsC: stores go to the cache instead of memory
    #[inline(always)]
    pub fn cache_isolated(&self) -> bool {
        self.status().contains(Status::ISC)
    }

    #[inline(always)]
    pub fn user_mode(&self) -> bool {
        self.status().contains(Status::KUC)
    }

    /// Coprocessor `n` may be used by the running code
    pub fn coprocessor_enabled(&self, n: u8) -> bool {
        let status = self.status();
        match n {
            0 => !self.user_mode() || status.contains(Status::CU0),
            1 => status.contains(Status::CU1),
            2 => status.contains(Status::CU2),
            _ => status.contains(Status::CU3),
        }
    }

    /// MFC0. `None` means the register does not exist (reserved instruction).
    pub fn read(&self, index: u8) -> Option<u32> {
        Some(match index {
            BPC => self.bpc,
            BDA => self.bda,
            TAR => self.tar,
            DCIC => self.dcic,
            BAD_VADDR => self.bad_vaddr,
            BDAM => self.bdam,
            BPCM => self.bpcm,
            SR => self.sr,
            CAUSE => self.cause,
            EPC => self.epc,
            PRID => PROCESSOR_ID,
            _ => return None,
        })
    }

    /// MTC0. Read-only registers silently ignore the write.
    pub fn write(&mut self, index: u8, value: u32) {
        match index {
            BPC => self.bpc = value,
            BDA => self.bda = value,
            DCIC => self.dcic = value & DCIC_WRITE_MASK,
            BDAM => self.bdam = value,
            BPCM => self.bpcm = value,
            SR => self.sr = value & SR_WRITE_MASK,
            CAUSE => {
                self.cause = (self.cause & !CAUSE_SOFTWARE_INTERRUPTS)
                    | (value & CAUSE_SOFTWARE_INTERRUPTS)
            }
            _ => trace!("ignored write to cop0r{} = {:#010x}", index, value),
        }
    }

    /// Mirror the external interrupt request line into CAUSE.IP2
    pub fn set_interrupt_line(&mut self, asserted: bool) {
        if asserted {
            self.cause |= CAUSE_IP2;
        } else {
            self.cause &= !CAUSE_IP2;
        }
    }

    /// Interrupts enabled and at least one unmasked request
    pub fn interrupt_pending(&self) -> bool {
        let status = self.sr;
        (status & Status::IEC.bits()) != 0 && (status & self.cause & Status::IM.bits()) != 0
    }

    /// Enter the exception described by `pending`. Returns the vector.
    pub fn enter_exception(&mut self, pending: &PendingException) -> u32 {
        let code = pending.exception.code();
        let mut cause = self.cause & !(0x7c | (3 << 28) | (1 << 30) | (1 << 31));
        cause |= code << 2;
        cause |= (pending.coprocessor as u32 & 3) << 28;

        self.epc = if pending.in_delay_slot {
            cause |= 1 << 31;
            if pending.branch_taken {
                cause |= 1 << 30;
            }
            pending.pc.wrapping_sub(4)
        } else {
            pending.pc
        };
        self.cause = cause;

        if let Some(addr) = pending.bad_vaddr {
            self.bad_vaddr = addr;
        }

        // push the mode stack: kernel mode, interrupts off
        let mode = self.sr & MODE_STACK_MASK;
        self.sr = (self.sr & !MODE_STACK_MASK) | ((mode << 2) & MODE_STACK_MASK);

        if self.status().contains(Status::BEV) {
            EXCEPTION_VECTOR_ROM
        } else {
            EXCEPTION_VECTOR_RAM
        }
    }

    /// RFE: pop the mode stack. The old entry is kept in KUo/IEo.
    pub fn return_from_exception(&mut self) {
        let mode = self.sr & MODE_STACK_MASK;
        self.sr = (self.sr & !0xf) | (mode >> 2);
    }

    // ExcCode of the last exception
}

impl Default for Cop0 {
    fn default() -> Self {
        Self::new()
    }
}
