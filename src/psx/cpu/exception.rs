//! Architectural exceptions and the controller state
//!
//! Exceptions here are guest-visible events delivered to the guest's own
//! vector. They never turn into `PsxError`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exception codes as stored in CAUSE.ExcCode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exception {
    Interrupt = 0x0,
    LoadAddressError = 0x4,
    StoreAddressError = 0x5,
    InstructionBusError = 0x6,
    DataBusError = 0x7,
    Syscall = 0x8,
    Break = 0x9,
    ReservedInstruction = 0xa,
    CoprocessorUnusable = 0xb,
    Overflow = 0xc,
}

impl Exception {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Exception::Interrupt => "interrupt",
            Exception::LoadAddressError => "address error (load/fetch)",
            Exception::StoreAddressError => "address error (store)",
            Exception::InstructionBusError => "bus error (fetch)",
            Exception::DataBusError => "bus error (data)",
            Exception::Syscall => "syscall",
            Exception::Break => "break",
            Exception::ReservedInstruction => "reserved instruction",
            Exception::CoprocessorUnusable => "coprocessor unusable",
            Exception::Overflow => "arithmetic overflow",
        };
        f.write_str(name)
    }
}

/// Fault raised by an instruction, before the delay slot context is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub exception: Exception,
    /// Offending address for address errors
    pub bad_vaddr: Option<u32>,
    /// Coprocessor number for coprocessor unusable
    pub coprocessor: u8,
}

impl Fault {
    pub fn new(exception: Exception) -> Self {
        Fault {
            exception,
            bad_vaddr: None,
            coprocessor: 0,
        }
    }

    pub fn address(exception: Exception, bad_vaddr: u32) -> Self {
        Fault {
            exception,
            bad_vaddr: Some(bad_vaddr),
            coprocessor: 0,
        }
    }

    pub fn coprocessor(coprocessor: u8) -> Self {
        Fault {
            exception: Exception::CoprocessorUnusable,
            bad_vaddr: None,
            coprocessor,
        }
    }
}

impl From<Exception> for Fault {
    fn from(exception: Exception) -> Self {
        Fault::new(exception)
    }
}

/// One-shot record consumed at the next instruction boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingException {
    pub exception: Exception,
    /// Instruction the fault belongs to (the interrupted instruction for
    /// interrupts)
    pub pc: u32,
    /// The faulting instruction sits in a branch delay slot
    pub in_delay_slot: bool,
    /// The branch owning that delay slot was taken
    pub branch_taken: bool,
    pub bad_vaddr: Option<u32>,
    pub coprocessor: u8,
}

/// Exception & breakpoint controller state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ControllerState {
    #[default]
    Running,
    ExceptionPending(Exception),
    Stepping,
    PausedAtBreakpoint(u32),
}
