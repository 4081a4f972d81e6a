//! R3000A instruction decoder
//!
//! `Instruction::decode` turns a raw opcode word into a variant carrying its
//! operand fields. The interpreter executes these variants directly, the cached
//! interpreter stores them in blocks so a block is decoded once, and the
//! recompiler lowers them to host code.

use crate::psx::memory_map::{JUMP_TARGET_MASK, PC_SEGMENT_MASK};
use crate::psx::AccessWidth;

/// Conventional MIPS register names, indexed by register number
pub const REGISTER_NAMES: [&str; 32] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp",
    "fp", "ra",
];

/// Return address register used by JAL and the linking REGIMM branches
pub const RA: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    // ========================================================================
    // SPECIAL (R-type)
    // ========================================================================
    Sll(u8, u8, u8), // rd, rt, sa
    Srl(u8, u8, u8),
    Sra(u8, u8, u8),
    Sllv(u8, u8, u8), // rd, rt, rs
    Srlv(u8, u8, u8),
    Srav(u8, u8, u8),
    Jr(u8),        // rs
    Jalr(u8, u8),  // rd, rs
    Syscall,
    Break,
    Mfhi(u8), // rd
    Mthi(u8), // rs
    Mflo(u8),
    Mtlo(u8),
    Mult(u8, u8), // rs, rt
    Multu(u8, u8),
    Div(u8, u8),
    Divu(u8, u8),
    Add(u8, u8, u8), // rd, rs, rt
    Addu(u8, u8, u8),
    Sub(u8, u8, u8),
    Subu(u8, u8, u8),
    And(u8, u8, u8),
    Or(u8, u8, u8),
    Xor(u8, u8, u8),
    Nor(u8, u8, u8),
    Slt(u8, u8, u8),
    Sltu(u8, u8, u8),

    // ========================================================================
    // Immediate (I-type)
    // ========================================================================
    Addi(u8, u8, i16), // rt, rs, imm
    Addiu(u8, u8, i16),
    Slti(u8, u8, i16),
    Sltiu(u8, u8, i16),
    Andi(u8, u8, u16),
    Ori(u8, u8, u16),
    Xori(u8, u8, u16),
    Lui(u8, u16), // rt, imm

    // ========================================================================
    // Branches and jumps
    // ========================================================================
    Beq(u8, u8, i16), // rs, rt, offset
    Bne(u8, u8, i16),
    Blez(u8, i16), // rs, offset
    Bgtz(u8, i16),
    Bltz(u8, i16),
    Bgez(u8, i16),
    Bltzal(u8, i16),
    Bgezal(u8, i16),
    J(u32), // target
    Jal(u32),

    // ========================================================================
    // Loads and stores
    // ========================================================================
    Lb(u8, u8, i16), // rt, base, offset
    Lh(u8, u8, i16),
    Lwl(u8, u8, i16),
    Lw(u8, u8, i16),
    Lbu(u8, u8, i16),
    Lhu(u8, u8, i16),
    Lwr(u8, u8, i16),
    Sb(u8, u8, i16),
    Sh(u8, u8, i16),
    Swl(u8, u8, i16),
    Sw(u8, u8, i16),
    Swr(u8, u8, i16),

    // ========================================================================
    // Coprocessors
    // ========================================================================
    Mfc0(u8, u8), // rt, rd
    Mtc0(u8, u8),
    Rfe,
    Mfc2(u8, u8), // rt, rd
    Cfc2(u8, u8),
    Mtc2(u8, u8),
    Ctc2(u8, u8),
    Cop2(u32), // command word
    Lwc2(u8, u8, i16), // rt, base, offset
    Swc2(u8, u8, i16),
    /// Any access to a coprocessor that does not exist on this CPU
    CopUnusable(u8),

    /// Reserved opcode
    Invalid(u32),
}

impl Instruction {
    pub fn decode(instruction: u32) -> Instruction {
        let opcode = (instruction >> 26) & 0x3f;
        let rs = ((instruction >> 21) & 0x1f) as u8;
        let rt = ((instruction >> 16) & 0x1f) as u8;
        let rd = ((instruction >> 11) & 0x1f) as u8;
        let sa = ((instruction >> 6) & 0x1f) as u8;
        let funct = instruction & 0x3f;
        let imm = (instruction & 0xffff) as i16;
        let uimm = (instruction & 0xffff) as u16;
        let target = instruction & JUMP_TARGET_MASK;

        match opcode {
            0x00 => match funct {
                0x00 => Instruction::Sll(rd, rt, sa),
                0x02 => Instruction::Srl(rd, rt, sa),
                0x03 => Instruction::Sra(rd, rt, sa),
                0x04 => Instruction::Sllv(rd, rt, rs),
                0x06 => Instruction::Srlv(rd, rt, rs),
                0x07 => Instruction::Srav(rd, rt, rs),
                0x08 => Instruction::Jr(rs),
                0x09 => Instruction::Jalr(rd, rs),
                0x0c => Instruction::Syscall,
                0x0d => Instruction::Break,
                0x10 => Instruction::Mfhi(rd),
                0x11 => Instruction::Mthi(rs),
                0x12 => Instruction::Mflo(rd),
                0x13 => Instruction::Mtlo(rs),
                0x18 => Instruction::Mult(rs, rt),
                0x19 => Instruction::Multu(rs, rt),
                0x1a => Instruction::Div(rs, rt),
                0x1b => Instruction::Divu(rs, rt),
                0x20 => Instruction::Add(rd, rs, rt),
                0x21 => Instruction::Addu(rd, rs, rt),
                0x22 => Instruction::Sub(rd, rs, rt),
                0x23 => Instruction::Subu(rd, rs, rt),
                0x24 => Instruction::And(rd, rs, rt),
                0x25 => Instruction::Or(rd, rs, rt),
                0x26 => Instruction::Xor(rd, rs, rt),
                0x27 => Instruction::Nor(rd, rs, rt),
                0x2a => Instruction::Slt(rd, rs, rt),
                0x2b => Instruction::Sltu(rd, rs, rt),
                _ => Instruction::Invalid(instruction),
            },
            0x01 => {
                // REGIMM only looks at bit 16 for the condition and bits
                // 17-20 for the link flag, every rt value decodes to a branch
                let bgez = (rt & 1) != 0;
                let link = (rt & 0x1e) == 0x10;
                match (bgez, link) {
                    (false, false) => Instruction::Bltz(rs, imm),
                    (true, false) => Instruction::Bgez(rs, imm),
                    (false, true) => Instruction::Bltzal(rs, imm),
                    (true, true) => Instruction::Bgezal(rs, imm),
                }
            }
            0x02 => Instruction::J(target),
            0x03 => Instruction::Jal(target),
            0x04 => Instruction::Beq(rs, rt, imm),
            0x05 => Instruction::Bne(rs, rt, imm),
            0x06 => Instruction::Blez(rs, imm),
            0x07 => Instruction::Bgtz(rs, imm),
            0x08 => Instruction::Addi(rt, rs, imm),
            0x09 => Instruction::Addiu(rt, rs, imm),
            0x0a => Instruction::Slti(rt, rs, imm),
            0x0b => Instruction::Sltiu(rt, rs, imm),
            0x0c => Instruction::Andi(rt, rs, uimm),
            0x0d => Instruction::Ori(rt, rs, uimm),
            0x0e => Instruction::Xori(rt, rs, uimm),
            0x0f => Instruction::Lui(rt, uimm),
            0x10 => match rs {
                0x00 => Instruction::Mfc0(rt, rd),
                0x04 => Instruction::Mtc0(rt, rd),
                0x10 if funct == 0x10 => Instruction::Rfe,
                _ => Instruction::Invalid(instruction),
            },
            0x11 => Instruction::CopUnusable(1),
            0x12 => {
                if rs & 0x10 != 0 {
                    Instruction::Cop2(instruction & 0x01ff_ffff)
                } else {
                    match rs {
                        0x00 => Instruction::Mfc2(rt, rd),
                        0x02 => Instruction::Cfc2(rt, rd),
                        0x04 => Instruction::Mtc2(rt, rd),
                        0x06 => Instruction::Ctc2(rt, rd),
                        _ => Instruction::Invalid(instruction),
                    }
                }
            }
            0x13 => Instruction::CopUnusable(3),
            0x20 => Instruction::Lb(rt, rs, imm),
            0x21 => Instruction::Lh(rt, rs, imm),
            0x22 => Instruction::Lwl(rt, rs, imm),
            0x23 => Instruction::Lw(rt, rs, imm),
            0x24 => Instruction::Lbu(rt, rs, imm),
            0x25 => Instruction::Lhu(rt, rs, imm),
            0x26 => Instruction::Lwr(rt, rs, imm),
            0x28 => Instruction::Sb(rt, rs, imm),
            0x29 => Instruction::Sh(rt, rs, imm),
            0x2a => Instruction::Swl(rt, rs, imm),
            0x2b => Instruction::Sw(rt, rs, imm),
            0x2e => Instruction::Swr(rt, rs, imm),
            0x30 | 0x38 => Instruction::CopUnusable(0),
            0x31 | 0x39 => Instruction::CopUnusable(1),
            0x32 => Instruction::Lwc2(rt, rs, imm),
            0x3a => Instruction::Swc2(rt, rs, imm),
            0x33 | 0x3b => Instruction::CopUnusable(3),
            _ => Instruction::Invalid(instruction),
        }
    }

    /// Branches and jumps: the next instruction is a delay slot
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Instruction::Jr(_)
                | Instruction::Jalr(..)
                | Instruction::Beq(..)
                | Instruction::Bne(..)
                | Instruction::Blez(..)
                | Instruction::Bgtz(..)
                | Instruction::Bltz(..)
                | Instruction::Bgez(..)
                | Instruction::Bltzal(..)
                | Instruction::Bgezal(..)
                | Instruction::J(_)
                | Instruction::Jal(_)
        )
    }

    /// Calls: execution is expected to come back to the instruction after
    /// the delay slot
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Instruction::Jal(_)
                | Instruction::Jalr(..)
                | Instruction::Bltzal(..)
                | Instruction::Bgezal(..)
        )
    }

    /// `jr $ra`
    pub fn is_return(&self) -> bool {
        matches!(self, Instruction::Jr(RA))
    }

    /// Instructions after which a block must end even without a delay slot:
    /// they always raise an exception or can change the interrupt and cache
    /// isolation state the dispatcher checks between blocks.
    pub fn is_block_exit(&self) -> bool {
        matches!(
            self,
            Instruction::Syscall
                | Instruction::Break
                | Instruction::Rfe
                | Instruction::Mtc0(..)
                | Instruction::CopUnusable(_)
                | Instruction::Invalid(_)
        )
    }

    /// Register loaded through the load delay slot, if any
    pub fn load_delay_target(&self) -> Option<u8> {
        match *self {
            Instruction::Lb(rt, ..)
            | Instruction::Lh(rt, ..)
            | Instruction::Lwl(rt, ..)
            | Instruction::Lw(rt, ..)
            | Instruction::Lbu(rt, ..)
            | Instruction::Lhu(rt, ..)
            | Instruction::Lwr(rt, ..)
            | Instruction::Mfc0(rt, _)
            | Instruction::Mfc2(rt, _)
            | Instruction::Cfc2(rt, _) => Some(rt),
            _ => None,
        }
    }

    /// Static branch target for PC relative branches and J/JAL, given the
    /// address of the branch instruction itself
    pub fn branch_target(&self, pc: u32) -> Option<u32> {
        let delay_slot = pc.wrapping_add(4);
        match *self {
            Instruction::Beq(_, _, offset)
            | Instruction::Bne(_, _, offset)
            | Instruction::Blez(_, offset)
            | Instruction::Bgtz(_, offset)
            | Instruction::Bltz(_, offset)
            | Instruction::Bgez(_, offset)
            | Instruction::Bltzal(_, offset)
            | Instruction::Bgezal(_, offset) => {
                Some(delay_slot.wrapping_add(((offset as i32) << 2) as u32))
            }
            Instruction::J(target) | Instruction::Jal(target) => {
                Some((delay_slot & PC_SEGMENT_MASK) | (target << 2))
            }
            _ => None,
        }
    }

    /// Guest memory access done by a load or store: base register, offset,
    /// width and direction. LWL/LWR/SWL/SWR report the aligned word.
    pub fn memory_access(&self) -> Option<MemoryAccess> {
        use Instruction::*;
        let (base, offset, width, store) = match *self {
            Lb(_, base, offset) | Lbu(_, base, offset) => (base, offset, AccessWidth::Byte, false),
            Lh(_, base, offset) | Lhu(_, base, offset) => {
                (base, offset, AccessWidth::HalfWord, false)
            }
            Lw(_, base, offset)
            | Lwl(_, base, offset)
            | Lwr(_, base, offset)
            | Lwc2(_, base, offset) => (base, offset, AccessWidth::Word, false),
            Sb(_, base, offset) => (base, offset, AccessWidth::Byte, true),
            Sh(_, base, offset) => (base, offset, AccessWidth::HalfWord, true),
            Sw(_, base, offset)
            | Swl(_, base, offset)
            | Swr(_, base, offset)
            | Swc2(_, base, offset) => (base, offset, AccessWidth::Word, true),
            _ => return None,
        };
        Some(MemoryAccess {
            base,
            offset,
            width,
            store,
            partial: matches!(self, Lwl(..) | Lwr(..) | Swl(..) | Swr(..)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub base: u8,
    pub offset: i16,
    pub width: AccessWidth,
    pub store: bool,
    partial: bool,
}

impl MemoryAccess {
    /// Address touched given the value of the base register
    pub fn address(&self, base_value: u32) -> u32 {
        let addr = base_value.wrapping_add(self.offset as i32 as u32);
        if self.partial {
            addr & !3
        } else {
            addr
        }
    }
}
