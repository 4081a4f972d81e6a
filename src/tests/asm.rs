// Tiny R3000A assembler for building test programs
#![allow(dead_code)]

use crate::psx::bus::Bus;

fn r_type(rs: u8, rt: u8, rd: u8, sa: u8, funct: u32) -> u32 {
    ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | ((sa as u32) << 6) | funct
}

fn i_type(opcode: u32, rs: u8, rt: u8, imm: u16) -> u32 {
    (opcode << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | imm as u32
}

/// Copy `program` into RAM at `addr`
pub fn load(bus: &mut Bus, addr: u32, program: &[u32]) {
    let bytes: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
    bus.write_ram_bytes(addr, &bytes);
}

pub fn nop() -> u32 {
    0
}

pub fn sll(rd: u8, rt: u8, sa: u8) -> u32 {
    r_type(0, rt, rd, sa, 0x00)
}

pub fn srl(rd: u8, rt: u8, sa: u8) -> u32 {
    r_type(0, rt, rd, sa, 0x02)
}

pub fn sra(rd: u8, rt: u8, sa: u8) -> u32 {
    r_type(0, rt, rd, sa, 0x03)
}

pub fn sllv(rd: u8, rt: u8, rs: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x04)
}

pub fn srav(rd: u8, rt: u8, rs: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x07)
}

pub fn jr(rs: u8) -> u32 {
    r_type(rs, 0, 0, 0, 0x08)
}

pub fn jalr(rd: u8, rs: u8) -> u32 {
    r_type(rs, 0, rd, 0, 0x09)
}

pub fn syscall() -> u32 {
    0x0000000c
}

pub fn brk() -> u32 {
    0x0000000d
}

pub fn mfhi(rd: u8) -> u32 {
    r_type(0, 0, rd, 0, 0x10)
}

pub fn mflo(rd: u8) -> u32 {
    r_type(0, 0, rd, 0, 0x12)
}

pub fn mult(rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, 0, 0, 0x18)
}

pub fn multu(rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, 0, 0, 0x19)
}

pub fn div(rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, 0, 0, 0x1a)
}

pub fn divu(rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, 0, 0, 0x1b)
}

pub fn add(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x20)
}

pub fn addu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x21)
}

pub fn subu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x23)
}

pub fn and(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x24)
}

pub fn or(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x25)
}

pub fn xor(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x26)
}

pub fn nor(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x27)
}

pub fn slt(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x2a)
}

pub fn sltu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x2b)
}

pub fn bltz(rs: u8, offset: i16) -> u32 {
    i_type(0x01, rs, 0x00, offset as u16)
}

pub fn bgez(rs: u8, offset: i16) -> u32 {
    i_type(0x01, rs, 0x01, offset as u16)
}

pub fn bgezal(rs: u8, offset: i16) -> u32 {
    i_type(0x01, rs, 0x11, offset as u16)
}

/// `j` to an absolute address in the same 256MB segment
pub fn j(target: u32) -> u32 {
    (0x02 << 26) | ((target >> 2) & 0x03ff_ffff)
}

pub fn jal(target: u32) -> u32 {
    (0x03 << 26) | ((target >> 2) & 0x03ff_ffff)
}

pub fn beq(rs: u8, rt: u8, offset: i16) -> u32 {
    i_type(0x04, rs, rt, offset as u16)
}

pub fn bne(rs: u8, rt: u8, offset: i16) -> u32 {
    i_type(0x05, rs, rt, offset as u16)
}

pub fn blez(rs: u8, offset: i16) -> u32 {
    i_type(0x06, rs, 0, offset as u16)
}

pub fn bgtz(rs: u8, offset: i16) -> u32 {
    i_type(0x07, rs, 0, offset as u16)
}

pub fn addi(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x08, rs, rt, imm as u16)
}

pub fn addiu(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x09, rs, rt, imm as u16)
}

pub fn slti(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x0a, rs, rt, imm as u16)
}

pub fn sltiu(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x0b, rs, rt, imm as u16)
}

pub fn andi(rt: u8, rs: u8, imm: u16) -> u32 {
    i_type(0x0c, rs, rt, imm)
}

pub fn ori(rt: u8, rs: u8, imm: u16) -> u32 {
    i_type(0x0d, rs, rt, imm)
}

pub fn xori(rt: u8, rs: u8, imm: u16) -> u32 {
    i_type(0x0e, rs, rt, imm)
}

pub fn lui(rt: u8, imm: u16) -> u32 {
    i_type(0x0f, 0, rt, imm)
}

pub fn mfc0(rt: u8, rd: u8) -> u32 {
    (0x10 << 26) | ((rt as u32) << 16) | ((rd as u32) << 11)
}

pub fn mtc0(rt: u8, rd: u8) -> u32 {
    (0x10 << 26) | (0x04 << 21) | ((rt as u32) << 16) | ((rd as u32) << 11)
}

pub fn rfe() -> u32 {
    0x42000010
}

pub fn mtc2(rt: u8, rd: u8) -> u32 {
    (0x12 << 26) | (0x04 << 21) | ((rt as u32) << 16) | ((rd as u32) << 11)
}

pub fn mfc2(rt: u8, rd: u8) -> u32 {
    (0x12 << 26) | ((rt as u32) << 16) | ((rd as u32) << 11)
}

pub fn cop2(command: u32) -> u32 {
    (0x12 << 26) | (1 << 25) | (command & 0x01ff_ffff)
}

pub fn lb(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x20, base, rt, offset as u16)
}

pub fn lh(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x21, base, rt, offset as u16)
}

pub fn lwl(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x22, base, rt, offset as u16)
}

pub fn lw(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x23, base, rt, offset as u16)
}

pub fn lbu(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x24, base, rt, offset as u16)
}

pub fn lhu(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x25, base, rt, offset as u16)
}

pub fn lwr(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x26, base, rt, offset as u16)
}

pub fn sb(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x28, base, rt, offset as u16)
}

pub fn sh(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x29, base, rt, offset as u16)
}

pub fn swl(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x2a, base, rt, offset as u16)
}

pub fn sw(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x2b, base, rt, offset as u16)
}

pub fn swr(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x2e, base, rt, offset as u16)
}

#[test]
fn test_encodings_match_decoder() {
    use crate::psx::cpu::instruction::Instruction;

    assert_eq!(addu(2, 4, 5), 0x00851021);
    assert_eq!(addiu(8, 0, -1), 0x2408ffff);
    assert_eq!(lui(1, 0x1f80), 0x3c011f80);
    assert_eq!(jr(31), 0x03e00008);
    assert_eq!(Instruction::decode(sw(9, 8, 12)), Instruction::Sw(9, 8, 12));
    assert_eq!(Instruction::decode(bgezal(1, 4)), Instruction::Bgezal(1, 4));
    assert_eq!(Instruction::decode(mtc0(12, 12)), Instruction::Mtc0(12, 12));
    assert_eq!(Instruction::decode(cop2(0x180001)), Instruction::Cop2(0x180001));
    assert_eq!(j(0x80100000) & 0x03ff_ffff, 0x00040000);
}
