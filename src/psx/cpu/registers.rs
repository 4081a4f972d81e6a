//! Architectural register file
//!
//! The layout is `repr(C)` because recompiled blocks address these fields
//! directly by offset. `load_delay_reg`/`next_load_delay_reg` hold a register
//! number or `NO_REGISTER`; committing a load writes through the index, and
//! index 32 lands in the `discard` slot that follows the GPRs.

use serde::{Deserialize, Serialize};

use crate::psx::memory_map::RESET_VECTOR;

/// Load delay register index meaning "nothing in flight"
pub const NO_REGISTER: u32 = 32;

#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    /// General purpose registers, $zero is always 0
    pub gpr: [u32; 32],
    /// Write target for loads committed to `NO_REGISTER`
    #[serde(skip)]
    pub discard: u32,
    pub hi: u32,
    pub lo: u32,
    /// Address of the next instruction to execute
    pub pc: u32,
    /// Address of the instruction after it (branch target after a branch)
    pub next_pc: u32,
    /// Address of the instruction being executed
    pub current_pc: u32,
    /// Load whose value becomes visible after the current instruction
    pub load_delay_reg: u32,
    pub load_delay_value: u32,
    /// Load issued by the current instruction
    pub next_load_delay_reg: u32,
    pub next_load_delay_value: u32,
    /// The instruction at `pc` sits in a branch delay slot
    pub branch_pending: bool,
    /// The instruction being executed sits in a branch delay slot
    pub in_delay_slot: bool,
    /// The branch owning the pending delay slot was taken
    pub branch_taken: bool,
}

impl Registers {
    pub fn new() -> Self {
        Registers {
            gpr: [0; 32],
            discard: 0,
            hi: 0,
            lo: 0,
            pc: RESET_VECTOR,
            next_pc: RESET_VECTOR.wrapping_add(4),
            current_pc: RESET_VECTOR,
            load_delay_reg: NO_REGISTER,
            load_delay_value: 0,
            next_load_delay_reg: NO_REGISTER,
            next_load_delay_value: 0,
            branch_pending: false,
            in_delay_slot: false,
            branch_taken: false,
        }
    }

    #[inline(always)]
    pub fn reg(&self, index: u8) -> u32 {
        self.gpr[index as usize]
    }

    /// Immediate register write. Cancels an in-flight load to the same
    /// register so the later write wins.
    #[inline(always)]
    pub fn set_reg(&mut self, index: u8, value: u32) {
        let index = index as u32;
        if index != 0 {
            self.gpr[index as usize] = value;
        }
        if self.load_delay_reg == index {
            self.load_delay_reg = NO_REGISTER;
        }
    }

    /// Register write through the load delay slot. A second load to the same
    /// register drops the first value.
    #[inline(always)]
    pub fn set_reg_delayed(&mut self, index: u8, value: u32) {
        let index = index as u32;
        if index == 0 {
            return;
        }
        if self.load_delay_reg == index {
            self.load_delay_reg = NO_REGISTER;
        }
        self.next_load_delay_reg = index;
        self.next_load_delay_value = value;
    }

    /// Value `index` will hold once the in-flight load lands. LWL/LWR merge
    /// with this rather than with the architectural value.
    #[inline(always)]
    pub fn reg_bypassing_load_delay(&self, index: u8) -> u32 {
        if self.load_delay_reg == index as u32 {
            self.load_delay_value
        } else {
            self.reg(index)
        }
    }

    /// End of instruction: commit the in-flight load and promote the one
    /// issued by this instruction.
    #[inline(always)]
    pub fn update_load_delay(&mut self) {
        if self.load_delay_reg != NO_REGISTER {
            self.gpr[self.load_delay_reg as usize] = self.load_delay_value;
        }
        self.load_delay_reg = self.next_load_delay_reg;
        self.load_delay_value = self.next_load_delay_value;
        self.next_load_delay_reg = NO_REGISTER;
    }

    /// Exception entry: the in-flight load completes, the faulting
    /// instruction's own load is dropped.
    pub fn flush_pipeline(&mut self) {
        self.next_load_delay_reg = NO_REGISTER;
        if self.load_delay_reg != NO_REGISTER {
            self.gpr[self.load_delay_reg as usize] = self.load_delay_value;
            self.load_delay_reg = NO_REGISTER;
        }
        self.branch_pending = false;
        self.in_delay_slot = false;
        self.branch_taken = false;
    }

    /// Redirect execution to `target` immediately (reset, exception vectors)
    pub fn jump_to(&mut self, target: u32) {
        self.pc = target;
        self.next_pc = target.wrapping_add(4);
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}
