//! Reference interpreter
//!
//! Fetches, decodes and executes one instruction at a time. The cached
//! interpreter reuses `run_instruction` on pre-decoded blocks and the
//! recompiler re-executes faulting instructions through `step`, so this file
//! defines the architectural behavior of every engine.

use super::exception::{Exception, Fault};
use super::instruction::{Instruction, RA};
use super::{Cpu, ExecutionEngine};
use crate::config::ExecutionMode;
use crate::performance_monitor::PerformanceMonitor;
use crate::psx::bus::{Bus, CodeWrite};
use crate::psx::cache::CacheControl;
use crate::psx::{Addressable, CycleCount};

/// Engine running one instruction per `run_block`. Holds no cached state.
#[derive(Debug, Default)]
pub struct Interpreter;

impl ExecutionEngine for Interpreter {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Interpreter
    }

    fn run_block(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        monitor: &mut PerformanceMonitor,
    ) -> CycleCount {
        let cycles = cpu.step(bus);
        monitor.record_block(ExecutionMode::Interpreter, 1, cycles as u64);
        cycles
    }

    fn flush(&mut self, _bus: &mut Bus) {}

    fn invalidate(&mut self, _bus: &mut Bus, _write: CodeWrite) -> usize {
        0
    }
}

impl Cpu {
    /// Execute one instruction and return the cycles it cost
    pub fn step(&mut self, bus: &mut Bus) -> CycleCount {
        self.service_boundary(bus);

        let pc = self.regs.pc;
        let cycles = match self.fetch(bus, pc) {
            Ok((word, cycles)) => {
                self.run_instruction(bus, Instruction::decode(word));
                cycles
            }
            Err(fault) => {
                self.advance_pipeline();
                self.raise(fault);
                1
            }
        };

        self.cycles += cycles as u64;
        cycles
    }

    /// Execute an instruction fetched from `regs.pc`. Returns false if it
    /// raised an exception.
    #[inline]
    pub(crate) fn run_instruction(&mut self, bus: &mut Bus, instruction: Instruction) -> bool {
        self.advance_pipeline();
        match self.execute(instruction, bus) {
            Ok(()) => {
                self.regs.update_load_delay();
                true
            }
            Err(fault) => {
                self.raise(fault);
                false
            }
        }
    }

    fn execute(&mut self, instruction: Instruction, bus: &mut Bus) -> Result<(), Fault> {
        use Instruction::*;

        match instruction {
            // Shifts
            Sll(rd, rt, sa) => self.regs.set_reg(rd, self.reg(rt) << sa),
            Srl(rd, rt, sa) => self.regs.set_reg(rd, self.reg(rt) >> sa),
            Sra(rd, rt, sa) => self.regs.set_reg(rd, ((self.reg(rt) as i32) >> sa) as u32),
            Sllv(rd, rt, rs) => self.regs.set_reg(rd, self.reg(rt) << (self.reg(rs) & 0x1f)),
            Srlv(rd, rt, rs) => self.regs.set_reg(rd, self.reg(rt) >> (self.reg(rs) & 0x1f)),
            Srav(rd, rt, rs) => {
                let value = (self.reg(rt) as i32) >> (self.reg(rs) & 0x1f);
                self.regs.set_reg(rd, value as u32)
            }

            // Jumps
            Jr(rs) => {
                let target = self.reg(rs);
                self.branch(target, true);
            }
            Jalr(rd, rs) => {
                let target = self.reg(rs);
                let ra = self.regs.next_pc;
                self.branch(target, true);
                self.regs.set_reg(rd, ra);
            }
            J(_) => {
                let target = self.static_target(instruction);
                self.branch(target, true);
            }
            Jal(_) => {
                let target = self.static_target(instruction);
                let ra = self.regs.next_pc;
                self.branch(target, true);
                self.regs.set_reg(RA, ra);
            }

            // Branches
            Beq(rs, rt, _) => {
                let taken = self.reg(rs) == self.reg(rt);
                self.conditional_branch(instruction, taken);
            }
            Bne(rs, rt, _) => {
                let taken = self.reg(rs) != self.reg(rt);
                self.conditional_branch(instruction, taken);
            }
            Blez(rs, _) => {
                let taken = (self.reg(rs) as i32) <= 0;
                self.conditional_branch(instruction, taken);
            }
            Bgtz(rs, _) => {
                let taken = (self.reg(rs) as i32) > 0;
                self.conditional_branch(instruction, taken);
            }
            Bltz(rs, _) => {
                let taken = (self.reg(rs) as i32) < 0;
                self.conditional_branch(instruction, taken);
            }
            Bgez(rs, _) => {
                let taken = (self.reg(rs) as i32) >= 0;
                self.conditional_branch(instruction, taken);
            }
            // The link register is written whether or not the branch is taken
            Bltzal(rs, _) => {
                let taken = (self.reg(rs) as i32) < 0;
                let ra = self.regs.next_pc;
                self.conditional_branch(instruction, taken);
                self.regs.set_reg(RA, ra);
            }
            Bgezal(rs, _) => {
                let taken = (self.reg(rs) as i32) >= 0;
                let ra = self.regs.next_pc;
                self.conditional_branch(instruction, taken);
                self.regs.set_reg(RA, ra);
            }

            // Arithmetic
            Add(rd, rs, rt) => {
                let value = (self.reg(rs) as i32)
                    .checked_add(self.reg(rt) as i32)
                    .ok_or(Exception::Overflow)?;
                self.regs.set_reg(rd, value as u32);
            }
            Addu(rd, rs, rt) => self.regs.set_reg(rd, self.reg(rs).wrapping_add(self.reg(rt))),
            Sub(rd, rs, rt) => {
                let value = (self.reg(rs) as i32)
                    .checked_sub(self.reg(rt) as i32)
                    .ok_or(Exception::Overflow)?;
                self.regs.set_reg(rd, value as u32);
            }
            Subu(rd, rs, rt) => self.regs.set_reg(rd, self.reg(rs).wrapping_sub(self.reg(rt))),
            Addi(rt, rs, imm) => {
                let value = (self.reg(rs) as i32)
                    .checked_add(imm as i32)
                    .ok_or(Exception::Overflow)?;
                self.regs.set_reg(rt, value as u32);
            }
            Addiu(rt, rs, imm) => {
                self.regs.set_reg(rt, self.reg(rs).wrapping_add(imm as i32 as u32))
            }

            // Logical
            And(rd, rs, rt) => self.regs.set_reg(rd, self.reg(rs) & self.reg(rt)),
            Or(rd, rs, rt) => self.regs.set_reg(rd, self.reg(rs) | self.reg(rt)),
            Xor(rd, rs, rt) => self.regs.set_reg(rd, self.reg(rs) ^ self.reg(rt)),
            Nor(rd, rs, rt) => self.regs.set_reg(rd, !(self.reg(rs) | self.reg(rt))),
            Andi(rt, rs, imm) => self.regs.set_reg(rt, self.reg(rs) & imm as u32),
            Ori(rt, rs, imm) => self.regs.set_reg(rt, self.reg(rs) | imm as u32),
            Xori(rt, rs, imm) => self.regs.set_reg(rt, self.reg(rs) ^ imm as u32),
            Lui(rt, imm) => self.regs.set_reg(rt, (imm as u32) << 16),

            // Set on less than
            Slt(rd, rs, rt) => {
                let value = (self.reg(rs) as i32) < (self.reg(rt) as i32);
                self.regs.set_reg(rd, value as u32);
            }
            Sltu(rd, rs, rt) => {
                let value = self.reg(rs) < self.reg(rt);
                self.regs.set_reg(rd, value as u32);
            }
            Slti(rt, rs, imm) => {
                let value = (self.reg(rs) as i32) < imm as i32;
                self.regs.set_reg(rt, value as u32);
            }
            Sltiu(rt, rs, imm) => {
                let value = self.reg(rs) < imm as i32 as u32;
                self.regs.set_reg(rt, value as u32);
            }

            // Multiply/divide
            Mult(rs, rt) => {
                let result = (self.reg(rs) as i32 as i64) * (self.reg(rt) as i32 as i64);
                self.regs.lo = result as u32;
                self.regs.hi = (result >> 32) as u32;
            }
            Multu(rs, rt) => {
                let result = (self.reg(rs) as u64) * (self.reg(rt) as u64);
                self.regs.lo = result as u32;
                self.regs.hi = (result >> 32) as u32;
            }
            Div(rs, rt) => {
                let (lo, hi) = divide_signed(self.reg(rs), self.reg(rt));
                self.regs.lo = lo;
                self.regs.hi = hi;
            }
            Divu(rs, rt) => {
                let (lo, hi) = divide_unsigned(self.reg(rs), self.reg(rt));
                self.regs.lo = lo;
                self.regs.hi = hi;
            }
            Mfhi(rd) => self.regs.set_reg(rd, self.regs.hi),
            Mthi(rs) => self.regs.hi = self.reg(rs),
            Mflo(rd) => self.regs.set_reg(rd, self.regs.lo),
            Mtlo(rs) => self.regs.lo = self.reg(rs),

            // Loads
            Lb(rt, base, offset) => {
                let value = self.load::<u8>(bus, self.address(base, offset))?;
                self.regs.set_reg_delayed(rt, value as i8 as i32 as u32);
            }
            Lbu(rt, base, offset) => {
                let value = self.load::<u8>(bus, self.address(base, offset))?;
                self.regs.set_reg_delayed(rt, value as u32);
            }
            Lh(rt, base, offset) => {
                let value = self.load::<u16>(bus, self.address(base, offset))?;
                self.regs.set_reg_delayed(rt, value as i16 as i32 as u32);
            }
            Lhu(rt, base, offset) => {
                let value = self.load::<u16>(bus, self.address(base, offset))?;
                self.regs.set_reg_delayed(rt, value as u32);
            }
            Lw(rt, base, offset) => {
                let value = self.load::<u32>(bus, self.address(base, offset))?;
                self.regs.set_reg_delayed(rt, value);
            }
            Lwl(rt, base, offset) => {
                let addr = self.address(base, offset);
                let word = self.load::<u32>(bus, addr & !3)?;
                let current = self.regs.reg_bypassing_load_delay(rt);
                self.regs.set_reg_delayed(rt, merge_lwl(current, word, addr));
            }
            Lwr(rt, base, offset) => {
                let addr = self.address(base, offset);
                let word = self.load::<u32>(bus, addr & !3)?;
                let current = self.regs.reg_bypassing_load_delay(rt);
                self.regs.set_reg_delayed(rt, merge_lwr(current, word, addr));
            }

            // Stores
            Sb(rt, base, offset) => {
                self.store(bus, self.address(base, offset), self.reg(rt) as u8)?
            }
            Sh(rt, base, offset) => {
                self.store(bus, self.address(base, offset), self.reg(rt) as u16)?
            }
            Sw(rt, base, offset) => self.store(bus, self.address(base, offset), self.reg(rt))?,
            Swl(rt, base, offset) => {
                let addr = self.address(base, offset);
                let current = self.load::<u32>(bus, addr & !3)?;
                self.store(bus, addr & !3, merge_swl(current, self.reg(rt), addr))?;
            }
            Swr(rt, base, offset) => {
                let addr = self.address(base, offset);
                let current = self.load::<u32>(bus, addr & !3)?;
                self.store(bus, addr & !3, merge_swr(current, self.reg(rt), addr))?;
            }

            // Coprocessor 0
            Mfc0(rt, rd) => {
                self.require_coprocessor(0)?;
                let value = self
                    .cop0
                    .read(rd)
                    .ok_or(Exception::ReservedInstruction)?;
                self.regs.set_reg_delayed(rt, value);
            }
            Mtc0(rt, rd) => {
                self.require_coprocessor(0)?;
                self.cop0.write(rd, self.reg(rt));
            }
            Rfe => {
                self.require_coprocessor(0)?;
                self.cop0.return_from_exception();
            }

            // Coprocessor 2
            Mfc2(rt, rd) => {
                self.require_coprocessor(2)?;
                let value = self.cop2.read_data(rd);
                self.regs.set_reg_delayed(rt, value);
            }
            Cfc2(rt, rd) => {
                self.require_coprocessor(2)?;
                let value = self.cop2.read_control(rd);
                self.regs.set_reg_delayed(rt, value);
            }
            Mtc2(rt, rd) => {
                self.require_coprocessor(2)?;
                let value = self.reg(rt);
                self.cop2.write_data(rd, value);
            }
            Ctc2(rt, rd) => {
                self.require_coprocessor(2)?;
                let value = self.reg(rt);
                self.cop2.write_control(rd, value);
            }
            Cop2(command) => {
                self.require_coprocessor(2)?;
                self.cop2.execute(command);
            }
            Lwc2(rt, base, offset) => {
                self.require_coprocessor(2)?;
                let value = self.load::<u32>(bus, self.address(base, offset))?;
                self.cop2.write_data(rt, value);
            }
            Swc2(rt, base, offset) => {
                self.require_coprocessor(2)?;
                let value = self.cop2.read_data(rt);
                self.store(bus, self.address(base, offset), value)?;
            }
            CopUnusable(n) => return Err(Fault::coprocessor(n)),

            Syscall => return Err(Exception::Syscall.into()),
            Break => return Err(Exception::Break.into()),
            Invalid(word) => {
                trace!("Reserved instruction {:#010x} at {:#010x}", word, self.regs.current_pc);
                return Err(Exception::ReservedInstruction.into());
            }
        }

        Ok(())
    }

    #[inline(always)]
    fn reg(&self, index: u8) -> u32 {
        self.regs.reg(index)
    }

    #[inline(always)]
    fn address(&self, base: u8, offset: i16) -> u32 {
        self.reg(base).wrapping_add(offset as i32 as u32)
    }

    fn static_target(&self, instruction: Instruction) -> u32 {
        instruction
            .branch_target(self.regs.current_pc)
            .unwrap_or(self.regs.next_pc)
    }

    fn conditional_branch(&mut self, instruction: Instruction, taken: bool) {
        let target = self.static_target(instruction);
        self.branch(target, taken);
    }

    /// The next instruction is a delay slot, after which execution continues
    /// at `target` if the branch is taken
    #[inline(always)]
    fn branch(&mut self, target: u32, taken: bool) {
        self.regs.branch_pending = true;
        self.regs.branch_taken = taken;
        if taken {
            self.regs.next_pc = target;
        }
    }

    fn require_coprocessor(&self, n: u8) -> Result<(), Fault> {
        if self.cop0.coprocessor_enabled(n) {
            Ok(())
        } else {
            Err(Fault::coprocessor(n))
        }
    }

    pub(crate) fn load<T: Addressable>(&mut self, bus: &mut Bus, addr: u32) -> Result<T, Fault> {
        if !T::width().is_aligned(addr) {
            return Err(Fault::address(Exception::LoadAddressError, addr));
        }
        bus.load::<T>(addr)
            .map_err(|_| Fault::new(Exception::DataBusError))
    }

    /// Stores while the cache is isolated only touch the ICache. In tag test
    /// mode they rewrite the line tag, otherwise they hit the cached data
    /// words, which are not modeled.
    pub(crate) fn store<T: Addressable>(
        &mut self,
        bus: &mut Bus,
        addr: u32,
        value: T,
    ) -> Result<(), Fault> {
        if !T::width().is_aligned(addr) {
            return Err(Fault::address(Exception::StoreAddressError, addr));
        }
        if self.cop0.cache_isolated() {
            if bus.cache_control().contains(CacheControl::TAG_TEST_MODE) {
                self.icache.isolated_store(addr);
            }
            return Ok(());
        }
        bus.store(addr, value)
            .map_err(|_| Fault::new(Exception::DataBusError))
    }
}

/// DIV results (lo, hi), including the values the hardware produces for a
/// zero divisor and for `i32::MIN / -1`
pub fn divide_signed(dividend: u32, divisor: u32) -> (u32, u32) {
    let n = dividend as i32;
    let d = divisor as i32;
    if d == 0 {
        let lo = if n >= 0 { 0xffff_ffff } else { 1 };
        (lo, n as u32)
    } else if n == i32::MIN && d == -1 {
        (i32::MIN as u32, 0)
    } else {
        ((n / d) as u32, (n % d) as u32)
    }
}

pub fn divide_unsigned(dividend: u32, divisor: u32) -> (u32, u32) {
    if divisor == 0 {
        (0xffff_ffff, dividend)
    } else {
        (dividend / divisor, dividend % divisor)
    }
}

pub fn merge_lwl(current: u32, word: u32, addr: u32) -> u32 {
    match addr & 3 {
        0 => (current & 0x00ff_ffff) | (word << 24),
        1 => (current & 0x0000_ffff) | (word << 16),
        2 => (current & 0x0000_00ff) | (word << 8),
        _ => word,
    }
}

pub fn merge_lwr(current: u32, word: u32, addr: u32) -> u32 {
    match addr & 3 {
        0 => word,
        1 => (current & 0xff00_0000) | (word >> 8),
        2 => (current & 0xffff_0000) | (word >> 16),
        _ => (current & 0xffff_ff00) | (word >> 24),
    }
}

pub fn merge_swl(current: u32, value: u32, addr: u32) -> u32 {
    match addr & 3 {
        0 => (current & 0xffff_ff00) | (value >> 24),
        1 => (current & 0xffff_0000) | (value >> 16),
        2 => (current & 0xff00_0000) | (value >> 8),
        _ => value,
    }
}

pub fn merge_swr(current: u32, value: u32, addr: u32) -> u32 {
    match addr & 3 {
        0 => value,
        1 => (current & 0x0000_00ff) | (value << 8),
        2 => (current & 0x0000_ffff) | (value << 16),
        _ => (current & 0x00ff_ffff) | (value << 24),
    }
}
