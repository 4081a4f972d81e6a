//! Text disassembly for the debugger

use std::fmt;

use super::instruction::{Instruction, REGISTER_NAMES};

/// One line of a disassembly listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    pub address: u32,
    pub word: u32,
    pub text: String,
}

impl fmt::Display for DisassembledInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}: {:08x}  {}", self.address, self.word, self.text)
    }
}

fn reg(r: u8) -> String {
    format!("${}", REGISTER_NAMES[(r & 0x1f) as usize])
}

fn signed_hex(value: i16) -> String {
    if value < 0 {
        format!("-{:#x}", -(value as i32))
    } else {
        format!("{:#x}", value)
    }
}

/// Disassemble `word` as if it was fetched from `pc`
pub fn disassemble(word: u32, pc: u32) -> String {
    let instruction = Instruction::decode(word);
    let target = instruction.branch_target(pc).unwrap_or(0);

    match instruction {
        Instruction::Sll(0, 0, 0) => "NOP".to_string(),
        Instruction::Sll(rd, rt, sa) => format!("SLL {}, {}, {}", reg(rd), reg(rt), sa),
        Instruction::Srl(rd, rt, sa) => format!("SRL {}, {}, {}", reg(rd), reg(rt), sa),
        Instruction::Sra(rd, rt, sa) => format!("SRA {}, {}, {}", reg(rd), reg(rt), sa),
        Instruction::Sllv(rd, rt, rs) => format!("SLLV {}, {}, {}", reg(rd), reg(rt), reg(rs)),
        Instruction::Srlv(rd, rt, rs) => format!("SRLV {}, {}, {}", reg(rd), reg(rt), reg(rs)),
        Instruction::Srav(rd, rt, rs) => format!("SRAV {}, {}, {}", reg(rd), reg(rt), reg(rs)),
        Instruction::Jr(rs) => format!("JR {}", reg(rs)),
        Instruction::Jalr(rd, rs) => format!("JALR {}, {}", reg(rd), reg(rs)),
        Instruction::Syscall => format!("SYSCALL {:#x}", (word >> 6) & 0xfffff),
        Instruction::Break => format!("BREAK {:#x}", (word >> 6) & 0xfffff),
        Instruction::Mfhi(rd) => format!("MFHI {}", reg(rd)),
        Instruction::Mthi(rs) => format!("MTHI {}", reg(rs)),
        Instruction::Mflo(rd) => format!("MFLO {}", reg(rd)),
        Instruction::Mtlo(rs) => format!("MTLO {}", reg(rs)),
        Instruction::Mult(rs, rt) => format!("MULT {}, {}", reg(rs), reg(rt)),
        Instruction::Multu(rs, rt) => format!("MULTU {}, {}", reg(rs), reg(rt)),
        Instruction::Div(rs, rt) => format!("DIV {}, {}", reg(rs), reg(rt)),
        Instruction::Divu(rs, rt) => format!("DIVU {}, {}", reg(rs), reg(rt)),
        Instruction::Add(rd, rs, rt) => format!("ADD {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::Addu(rd, rs, 0) => format!("MOVE {}, {}", reg(rd), reg(rs)),
        Instruction::Addu(rd, rs, rt) => format!("ADDU {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::Sub(rd, rs, rt) => format!("SUB {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::Subu(rd, rs, rt) => format!("SUBU {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::And(rd, rs, rt) => format!("AND {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::Or(rd, rs, rt) => format!("OR {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::Xor(rd, rs, rt) => format!("XOR {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::Nor(rd, rs, rt) => format!("NOR {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::Slt(rd, rs, rt) => format!("SLT {}, {}, {}", reg(rd), reg(rs), reg(rt)),
        Instruction::Sltu(rd, rs, rt) => format!("SLTU {}, {}, {}", reg(rd), reg(rs), reg(rt)),

        Instruction::Addi(rt, rs, imm) => {
            format!("ADDI {}, {}, {}", reg(rt), reg(rs), signed_hex(imm))
        }
        Instruction::Addiu(rt, 0, imm) => format!("LI {}, {}", reg(rt), signed_hex(imm)),
        Instruction::Addiu(rt, rs, imm) => {
            format!("ADDIU {}, {}, {}", reg(rt), reg(rs), signed_hex(imm))
        }
        Instruction::Slti(rt, rs, imm) => {
            format!("SLTI {}, {}, {}", reg(rt), reg(rs), signed_hex(imm))
        }
        Instruction::Sltiu(rt, rs, imm) => {
            format!("SLTIU {}, {}, {}", reg(rt), reg(rs), signed_hex(imm))
        }
        Instruction::Andi(rt, rs, imm) => format!("ANDI {}, {}, {:#x}", reg(rt), reg(rs), imm),
        Instruction::Ori(rt, rs, imm) => format!("ORI {}, {}, {:#x}", reg(rt), reg(rs), imm),
        Instruction::Xori(rt, rs, imm) => format!("XORI {}, {}, {:#x}", reg(rt), reg(rs), imm),
        Instruction::Lui(rt, imm) => format!("LUI {}, {:#x}", reg(rt), imm),

        Instruction::Beq(0, 0, _) => format!("B {:#010x}", target),
        Instruction::Beq(rs, rt, _) => format!("BEQ {}, {}, {:#010x}", reg(rs), reg(rt), target),
        Instruction::Bne(rs, rt, _) => format!("BNE {}, {}, {:#010x}", reg(rs), reg(rt), target),
        Instruction::Blez(rs, _) => format!("BLEZ {}, {:#010x}", reg(rs), target),
        Instruction::Bgtz(rs, _) => format!("BGTZ {}, {:#010x}", reg(rs), target),
        Instruction::Bltz(rs, _) => format!("BLTZ {}, {:#010x}", reg(rs), target),
        Instruction::Bgez(rs, _) => format!("BGEZ {}, {:#010x}", reg(rs), target),
        Instruction::Bltzal(rs, _) => format!("BLTZAL {}, {:#010x}", reg(rs), target),
        Instruction::Bgezal(rs, _) => format!("BGEZAL {}, {:#010x}", reg(rs), target),
        Instruction::J(_) => format!("J {:#010x}", target),
        Instruction::Jal(_) => format!("JAL {:#010x}", target),

        Instruction::Lb(rt, base, off) => mem("LB", rt, base, off),
        Instruction::Lh(rt, base, off) => mem("LH", rt, base, off),
        Instruction::Lwl(rt, base, off) => mem("LWL", rt, base, off),
        Instruction::Lw(rt, base, off) => mem("LW", rt, base, off),
        Instruction::Lbu(rt, base, off) => mem("LBU", rt, base, off),
        Instruction::Lhu(rt, base, off) => mem("LHU", rt, base, off),
        Instruction::Lwr(rt, base, off) => mem("LWR", rt, base, off),
        Instruction::Sb(rt, base, off) => mem("SB", rt, base, off),
        Instruction::Sh(rt, base, off) => mem("SH", rt, base, off),
        Instruction::Swl(rt, base, off) => mem("SWL", rt, base, off),
        Instruction::Sw(rt, base, off) => mem("SW", rt, base, off),
        Instruction::Swr(rt, base, off) => mem("SWR", rt, base, off),

        Instruction::Mfc0(rt, rd) => format!("MFC0 {}, $cop0_{}", reg(rt), rd),
        Instruction::Mtc0(rt, rd) => format!("MTC0 {}, $cop0_{}", reg(rt), rd),
        Instruction::Rfe => "RFE".to_string(),
        Instruction::Mfc2(rt, rd) => format!("MFC2 {}, $gte_data{}", reg(rt), rd),
        Instruction::Cfc2(rt, rd) => format!("CFC2 {}, $gte_ctrl{}", reg(rt), rd),
        Instruction::Mtc2(rt, rd) => format!("MTC2 {}, $gte_data{}", reg(rt), rd),
        Instruction::Ctc2(rt, rd) => format!("CTC2 {}, $gte_ctrl{}", reg(rt), rd),
        Instruction::Cop2(command) => format!("COP2 {:#09x}", command),
        Instruction::Lwc2(rt, base, off) => {
            format!("LWC2 $gte_data{}, {}({})", rt, signed_hex(off), reg(base))
        }
        Instruction::Swc2(rt, base, off) => {
            format!("SWC2 $gte_data{}, {}({})", rt, signed_hex(off), reg(base))
        }
        Instruction::CopUnusable(cop) => format!("COP{} {:#010x}", cop, word),
        Instruction::Invalid(word) => format!(".word {:#010x}", word),
    }
}

fn mem(mnemonic: &str, rt: u8, base: u8, offset: i16) -> String {
    format!("{} {}, {}({})", mnemonic, reg(rt), signed_hex(offset), reg(base))
}
