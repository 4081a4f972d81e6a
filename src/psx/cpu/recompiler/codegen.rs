//! Lowering of decoded blocks to Cranelift IR
//!
//! Guest registers live in the `Registers` struct for the whole block: each
//! use loads from it and each write stores back, so the struct is exact at
//! every point where control can leave. Only the load delay slot is tracked
//! at compile time.
//!
//! An instruction that may fault first writes the pipeline state "about to
//! execute this instruction" and then branches to a shared exit that makes
//! the block return with `REEXECUTE`. The dispatcher then runs that one
//! instruction through the interpreter, which raises the exception exactly
//! as it would have in the first place.

use std::fmt;
use std::mem::offset_of;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    types, AbiParam, Block as IrBlock, InstBuilder, MemFlags, SigRef, Signature, Type, Value,
};
use cranelift_frontend::FunctionBuilder;

use super::thunks::{self, Runtime, REEXECUTE};
use crate::psx::cpu::block::Block;
use crate::psx::cpu::instruction::{Instruction, RA};
use crate::psx::cpu::registers::{Registers, NO_REGISTER};
use crate::psx::cpu::MODE_CACHE_ISOLATED;
use crate::psx::memory_map::{PAGE_OFFSET_MASK, PAGE_SHIFT};
use crate::psx::AccessWidth;

const GPR: i32 = offset_of!(Registers, gpr) as i32;
const HI: i32 = offset_of!(Registers, hi) as i32;
const LO: i32 = offset_of!(Registers, lo) as i32;
const PC: i32 = offset_of!(Registers, pc) as i32;
const NEXT_PC: i32 = offset_of!(Registers, next_pc) as i32;
const CURRENT_PC: i32 = offset_of!(Registers, current_pc) as i32;
const LOAD_DELAY_REG: i32 = offset_of!(Registers, load_delay_reg) as i32;
const LOAD_DELAY_VALUE: i32 = offset_of!(Registers, load_delay_value) as i32;
const NEXT_LOAD_DELAY_REG: i32 = offset_of!(Registers, next_load_delay_reg) as i32;
const BRANCH_PENDING: i32 = offset_of!(Registers, branch_pending) as i32;
const IN_DELAY_SLOT: i32 = offset_of!(Registers, in_delay_slot) as i32;
const BRANCH_TAKEN: i32 = offset_of!(Registers, branch_taken) as i32;

const RT_LUT_READ: i32 = offset_of!(Runtime, lut_read) as i32;
const RT_LUT_WRITE: i32 = offset_of!(Runtime, lut_write) as i32;
const RT_FASTMEM_BASE: i32 = offset_of!(Runtime, fastmem_base) as i32;
const RT_INSTRUCTIONS: i32 = offset_of!(Runtime, instructions) as i32;
const RT_EXIT: i32 = offset_of!(Runtime, exit) as i32;

#[inline]
fn gpr_offset(index: u8) -> i32 {
    GPR + index as i32 * 4
}

/// How guest memory accesses are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLowering {
    /// Call into the bus for every access
    Call,
    /// Page table lookup, bus call on an empty entry
    Lut,
    /// Host access at `fastmem_base + address`; faults are recovered by
    /// the guarded call
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerOptions {
    pub memory: MemoryLowering,
    pub memory_exceptions: bool,
}

/// Why a block is left to the cached interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    Instruction { pc: u32, instruction: Instruction },
    CacheIsolated,
    BranchInDelaySlot,
    MissingDelaySlot,
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unsupported::Instruction { pc, instruction } => {
                write!(f, "{:?} at {:#010x}", instruction, pc)
            }
            Unsupported::CacheIsolated => f.write_str("cache isolated"),
            Unsupported::BranchInDelaySlot => f.write_str("branch in delay slot"),
            Unsupported::MissingDelaySlot => f.write_str("delay slot not fetchable"),
        }
    }
}

/// COP2 and the instructions that change COP0 state stay interpreted
fn is_lowerable(instruction: Instruction) -> bool {
    use Instruction::*;
    !matches!(
        instruction,
        Mtc0(..) | Rfe | Mfc2(..) | Cfc2(..) | Mtc2(..) | Ctc2(..) | Cop2(_) | Lwc2(..) | Swc2(..)
    )
}

pub fn check_block(block: &Block) -> Result<(), Unsupported> {
    if block.key.mode_bits & MODE_CACHE_ISOLATED != 0 {
        return Err(Unsupported::CacheIsolated);
    }
    if block.branch_in_delay_slot {
        return Err(Unsupported::BranchInDelaySlot);
    }
    if block
        .instructions
        .last()
        .map_or(false, |last| last.instruction.is_branch())
    {
        return Err(Unsupported::MissingDelaySlot);
    }
    match block
        .instructions
        .iter()
        .find(|d| !is_lowerable(d.instruction))
    {
        Some(d) => Err(Unsupported::Instruction {
            pc: d.pc,
            instruction: d.instruction,
        }),
        None => Ok(()),
    }
}

/// Load in flight at the start of the current instruction
#[derive(Debug, Clone, Copy)]
enum InFlight {
    None,
    /// Issued inside this block, register known
    Static { reg: u8, value: Value },
    /// Inherited from before the block
    Dynamic { reg: Value, value: Value },
}

#[derive(Debug, Clone, Copy)]
struct Branch {
    /// i8, 1 if taken
    taken: Value,
    /// Address executed after the delay slot
    next: Value,
}

struct Signatures {
    /// (runtime, addr) -> value | status << 32
    read: SigRef,
    /// (runtime, addr, value) -> status
    write: SigRef,
    /// (u32, u32) -> u64
    binary: SigRef,
}

enum Flow {
    Next,
    Exit,
}

fn import_signature(
    builder: &mut FunctionBuilder<'_>,
    params: &[Type],
    ret: Type,
) -> SigRef {
    let mut signature = Signature::new(builder.func.signature.call_conv);
    signature
        .params
        .extend(params.iter().map(|&ty| AbiParam::new(ty)));
    signature.returns.push(AbiParam::new(ret));
    builder.import_signature(signature)
}

/// Emit the body of `block` into `builder`, which sits in the entry block
pub fn emit_block(
    builder: &mut FunctionBuilder<'_>,
    pointer_type: Type,
    regs: Value,
    runtime: Value,
    block: &Block,
    options: LowerOptions,
) {
    let mut emitter = Emitter::new(builder, pointer_type, regs, runtime, options);

    let mut exited = false;
    for (index, decoded) in block.instructions.iter().enumerate() {
        emitter.pc = decoded.pc;
        emitter.index = index as u32;
        emitter.delay_slot = index > 0 && block.instructions[index - 1].instruction.is_branch();
        if let Flow::Exit = emitter.lower(decoded.instruction) {
            exited = true;
            break;
        }
        emitter.end_instruction();
    }

    if !exited {
        if let Some(last) = block.instructions.last() {
            emitter.finish(last.pc, block.ends_with_delay_slot(), block.len() as u32);
        } else {
            emitter.b.ins().return_(&[]);
        }
    }
    emitter.emit_reexecute_exit();
}

struct Emitter<'a, 'f> {
    b: &'a mut FunctionBuilder<'f>,
    ptr: Type,
    regs: Value,
    runtime: Value,
    options: LowerOptions,
    sigs: Signatures,
    in_flight: InFlight,
    /// Load issued by the current instruction
    next_load: Option<(u8, Value)>,
    branch: Option<Branch>,
    reexecute: Option<IrBlock>,
    pc: u32,
    index: u32,
    delay_slot: bool,
}

impl<'a, 'f> Emitter<'a, 'f> {
    fn new(
        b: &'a mut FunctionBuilder<'f>,
        ptr: Type,
        regs: Value,
        runtime: Value,
        options: LowerOptions,
    ) -> Self {
        let sigs = Signatures {
            read: import_signature(b, &[ptr, types::I32], types::I64),
            write: import_signature(b, &[ptr, types::I32, types::I32], types::I32),
            binary: import_signature(b, &[types::I32, types::I32], types::I64),
        };
        let flags = MemFlags::trusted();
        let reg = b.ins().load(types::I32, flags, regs, LOAD_DELAY_REG);
        let value = b.ins().load(types::I32, flags, regs, LOAD_DELAY_VALUE);

        Emitter {
            b,
            ptr,
            regs,
            runtime,
            options,
            sigs,
            in_flight: InFlight::Dynamic { reg, value },
            next_load: None,
            branch: None,
            reexecute: None,
            pc: 0,
            index: 0,
            delay_slot: false,
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn const32(&mut self, value: u32) -> Value {
        self.b.ins().iconst(types::I32, value as i64)
    }

    fn const8(&mut self, value: bool) -> Value {
        self.b.ins().iconst(types::I8, value as i64)
    }

    fn store_regs(&mut self, value: Value, offset: i32) {
        self.b
            .ins()
            .store(MemFlags::trusted(), value, self.regs, offset);
    }

    fn store_runtime(&mut self, value: Value, offset: i32) {
        self.b
            .ins()
            .store(MemFlags::trusted(), value, self.runtime, offset);
    }

    fn call(&mut self, sig: SigRef, target: usize, args: &[Value]) -> Value {
        let callee = self.b.ins().iconst(self.ptr, target as i64);
        let call = self.b.ins().call_indirect(sig, callee, args);
        self.b.inst_results(call)[0]
    }

    fn compare(&mut self, cc: IntCC, a: Value, b: Value) -> Value {
        self.b.ins().icmp(cc, a, b)
    }

    /// i8 condition to a 0/1 register value
    fn bool_to_reg(&mut self, condition: Value) -> Value {
        self.b.ins().uextend(types::I32, condition)
    }

    // ------------------------------------------------------------------
    // Registers and the load delay slot
    // ------------------------------------------------------------------

    fn reg(&mut self, index: u8) -> Value {
        if index == 0 {
            self.const32(0)
        } else {
            self.b
                .ins()
                .load(types::I32, MemFlags::trusted(), self.regs, gpr_offset(index))
        }
    }

    fn set_reg(&mut self, index: u8, value: Value) {
        if index == 0 {
            return;
        }
        self.store_regs(value, gpr_offset(index));
        self.cancel_load(index);
    }

    fn set_reg_delayed(&mut self, index: u8, value: Value) {
        if index == 0 {
            return;
        }
        self.cancel_load(index);
        self.next_load = Some((index, value));
    }

    /// The in-flight load to `index` is overridden by a newer write
    fn cancel_load(&mut self, index: u8) {
        match self.in_flight {
            InFlight::Static { reg, .. } if reg == index => self.in_flight = InFlight::None,
            InFlight::Dynamic { reg, value } => {
                let target = self.const32(index as u32);
                let hit = self.compare(IntCC::Equal, reg, target);
                let none = self.const32(NO_REGISTER);
                let reg = self.b.ins().select(hit, none, reg);
                self.in_flight = InFlight::Dynamic { reg, value };
            }
            _ => {}
        }
    }

    fn reg_bypassing_load_delay(&mut self, index: u8) -> Value {
        match self.in_flight {
            InFlight::Static { reg, value } if reg == index => value,
            InFlight::Dynamic { reg, value } => {
                let current = self.reg(index);
                let target = self.const32(index as u32);
                let hit = self.compare(IntCC::Equal, reg, target);
                self.b.ins().select(hit, value, current)
            }
            _ => self.reg(index),
        }
    }

    /// Commit the in-flight load and promote the one just issued
    fn end_instruction(&mut self) {
        match self.in_flight {
            InFlight::None => {}
            InFlight::Static { reg, value } => self.store_regs(value, gpr_offset(reg)),
            InFlight::Dynamic { reg, value } => {
                // index 32 lands in `discard`
                let index = self.b.ins().uextend(self.ptr, reg);
                let offset = self.b.ins().ishl_imm(index, 2);
                let slot = self.b.ins().iadd(self.regs, offset);
                self.b.ins().store(MemFlags::trusted(), value, slot, GPR);
            }
        }
        self.in_flight = match self.next_load.take() {
            Some((reg, value)) => InFlight::Static { reg, value },
            None => InFlight::None,
        };
    }

    fn store_load_delay(&mut self) {
        let (reg, value) = match self.in_flight {
            InFlight::None => (self.const32(NO_REGISTER), None),
            InFlight::Static { reg, value } => (self.const32(reg as u32), Some(value)),
            InFlight::Dynamic { reg, value } => (reg, Some(value)),
        };
        self.store_regs(reg, LOAD_DELAY_REG);
        if let Some(value) = value {
            self.store_regs(value, LOAD_DELAY_VALUE);
        }
        let none = self.const32(NO_REGISTER);
        self.store_regs(none, NEXT_LOAD_DELAY_REG);
    }

    // ------------------------------------------------------------------
    // Exits
    // ------------------------------------------------------------------

    /// Write the pipeline state as it is right before the current
    /// instruction executes
    fn flush_state(&mut self) {
        let pc = self.const32(self.pc);
        self.store_regs(pc, PC);

        match (self.delay_slot, self.branch) {
            (true, Some(branch)) => {
                self.store_regs(branch.next, NEXT_PC);
                let pending = self.const8(true);
                self.store_regs(pending, BRANCH_PENDING);
                self.store_regs(branch.taken, BRANCH_TAKEN);
            }
            _ => {
                let next = self.const32(self.pc.wrapping_add(4));
                self.store_regs(next, NEXT_PC);
                let pending = self.const8(false);
                self.store_regs(pending, BRANCH_PENDING);
            }
        }

        self.store_load_delay();
        let completed = self.const32(self.index);
        self.store_runtime(completed, RT_INSTRUCTIONS);
    }

    fn reexecute_target(&mut self) -> IrBlock {
        match self.reexecute {
            Some(block) => block,
            None => {
                let block = self.b.create_block();
                self.b.set_cold_block(block);
                self.reexecute = Some(block);
                block
            }
        }
    }

    /// Leave the block and re-run the current instruction in the
    /// interpreter if `condition` is non zero
    fn reexecute_if(&mut self, condition: Value) {
        let cold = self.b.create_block();
        let next = self.b.create_block();
        self.b.set_cold_block(cold);
        self.b.ins().brif(condition, cold, &[], next, &[]);

        self.b.switch_to_block(cold);
        self.flush_state();
        let target = self.reexecute_target();
        self.b.ins().jump(target, &[]);

        self.b.switch_to_block(next);
    }

    /// Hand the current instruction to the interpreter unconditionally
    fn exit_to_interpreter(&mut self) -> Flow {
        self.flush_state();
        let target = self.reexecute_target();
        self.b.ins().jump(target, &[]);
        Flow::Exit
    }

    fn emit_reexecute_exit(&mut self) {
        if let Some(block) = self.reexecute {
            self.b.switch_to_block(block);
            let status = self.const32(REEXECUTE);
            self.store_runtime(status, RT_EXIT);
            self.b.ins().return_(&[]);
        }
    }

    /// Normal end of the block
    fn finish(&mut self, last_pc: u32, ends_with_delay_slot: bool, count: u32) {
        let pc = match (ends_with_delay_slot, self.branch) {
            (true, Some(branch)) => branch.next,
            _ => self.const32(last_pc.wrapping_add(4)),
        };
        self.store_regs(pc, PC);
        let four = self.const32(4);
        let next = self.b.ins().iadd(pc, four);
        self.store_regs(next, NEXT_PC);

        let current = self.const32(last_pc);
        self.store_regs(current, CURRENT_PC);
        let in_delay_slot = self.const8(ends_with_delay_slot);
        self.store_regs(in_delay_slot, IN_DELAY_SLOT);
        let pending = self.const8(false);
        self.store_regs(pending, BRANCH_PENDING);
        if let Some(branch) = self.branch {
            self.store_regs(branch.taken, BRANCH_TAKEN);
        }

        self.store_load_delay();
        let completed = self.const32(count);
        self.store_runtime(completed, RT_INSTRUCTIONS);
        self.b.ins().return_(&[]);
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    fn branch(&mut self, taken: Value, target: Value) {
        let fallthrough = self.const32(self.pc.wrapping_add(8));
        let next = self.b.ins().select(taken, target, fallthrough);
        self.branch = Some(Branch { taken, next });
    }

    fn static_branch(&mut self, instruction: Instruction, taken: Value) {
        let target = instruction
            .branch_target(self.pc)
            .unwrap_or(self.pc.wrapping_add(8));
        let target = self.const32(target);
        self.branch(taken, target);
    }

    /// Conditional branch comparing `rs` against zero
    fn branch_zero(&mut self, instruction: Instruction, rs: u8, cc: IntCC) {
        let value = self.reg(rs);
        let zero = self.const32(0);
        let taken = self.compare(cc, value, zero);
        self.static_branch(instruction, taken);
    }

    fn link(&mut self, rd: u8) {
        let ra = self.const32(self.pc.wrapping_add(8));
        self.set_reg(rd, ra);
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    fn address(&mut self, base: u8, offset: i16) -> Value {
        let base = self.reg(base);
        let offset = self.const32(offset as i32 as u32);
        self.b.ins().iadd(base, offset)
    }

    /// Misaligned addresses leave the block so the interpreter raises the
    /// address error at the faulting instruction
    fn aligned(&mut self, addr: Value, width: AccessWidth) -> Value {
        if width != AccessWidth::Byte {
            let mask = self.const32(width.bytes() - 1);
            let low = self.b.ins().band(addr, mask);
            self.reexecute_if(low);
        }
        addr
    }

    fn lut_entry(&mut self, table_offset: i32, addr: Value) -> Value {
        let flags = MemFlags::trusted();
        let table = self.b.ins().load(self.ptr, flags, self.runtime, table_offset);
        let page = self.b.ins().ushr_imm(addr, PAGE_SHIFT as i64);
        let page = self.b.ins().uextend(self.ptr, page);
        let scale = self.ptr.bytes().trailing_zeros() as i64;
        let slot = self.b.ins().ishl_imm(page, scale);
        let slot = self.b.ins().iadd(table, slot);
        self.b.ins().load(self.ptr, flags, slot, 0)
    }

    fn page_address(&mut self, entry: Value, addr: Value) -> Value {
        let mask = self.const32(PAGE_OFFSET_MASK);
        let offset = self.b.ins().band(addr, mask);
        let offset = self.b.ins().uextend(self.ptr, offset);
        self.b.ins().iadd(entry, offset)
    }

    fn direct_address(&mut self, addr: Value) -> Value {
        let base = self
            .b
            .ins()
            .load(self.ptr, MemFlags::trusted(), self.runtime, RT_FASTMEM_BASE);
        let offset = self.b.ins().uextend(self.ptr, addr);
        self.b.ins().iadd(base, offset)
    }

    fn host_load(&mut self, width: AccessWidth, host: Value, flags: MemFlags) -> Value {
        match width {
            AccessWidth::Byte => self.b.ins().uload8(types::I32, flags, host, 0),
            AccessWidth::HalfWord => self.b.ins().uload16(types::I32, flags, host, 0),
            AccessWidth::Word => self.b.ins().load(types::I32, flags, host, 0),
        }
    }

    fn host_store(&mut self, width: AccessWidth, value: Value, host: Value, flags: MemFlags) {
        match width {
            AccessWidth::Byte => self.b.ins().istore8(flags, value, host, 0),
            AccessWidth::HalfWord => self.b.ins().istore16(flags, value, host, 0),
            AccessWidth::Word => self.b.ins().store(flags, value, host, 0),
        };
    }

    fn read_call(&mut self, addr: Value, width: AccessWidth) -> Value {
        self.flush_state();
        let target = match width {
            AccessWidth::Byte => thunks::read_byte as usize,
            AccessWidth::HalfWord => thunks::read_half as usize,
            AccessWidth::Word => thunks::read_word as usize,
        };
        let runtime = self.runtime;
        let result = self.call(self.sigs.read, target, &[runtime, addr]);
        if self.options.memory_exceptions {
            let status = self.b.ins().ushr_imm(result, 32);
            self.reexecute_if(status);
        }
        self.b.ins().ireduce(types::I32, result)
    }

    fn write_call(&mut self, target: usize, addr: Value, value: Value) {
        self.flush_state();
        let runtime = self.runtime;
        let status = self.call(self.sigs.write, target, &[runtime, addr, value]);
        self.reexecute_if(status);
    }

    /// Zero extended value at the aligned address `addr`
    fn read_memory(&mut self, addr: Value, width: AccessWidth) -> Value {
        match self.options.memory {
            MemoryLowering::Call => self.read_call(addr, width),
            MemoryLowering::Lut => {
                let entry = self.lut_entry(RT_LUT_READ, addr);
                let fast = self.b.create_block();
                let slow = self.b.create_block();
                let merge = self.b.create_block();
                self.b.append_block_param(merge, types::I32);
                self.b.ins().brif(entry, fast, &[], slow, &[]);

                self.b.switch_to_block(fast);
                let host = self.page_address(entry, addr);
                let value = self.host_load(width, host, MemFlags::trusted());
                self.b.ins().jump(merge, &[value]);

                self.b.switch_to_block(slow);
                let value = self.read_call(addr, width);
                self.b.ins().jump(merge, &[value]);

                self.b.switch_to_block(merge);
                self.b.block_params(merge)[0]
            }
            MemoryLowering::Direct => {
                self.flush_state();
                let host = self.direct_address(addr);
                self.host_load(width, host, MemFlags::new())
            }
        }
    }

    fn write_memory(&mut self, addr: Value, width: AccessWidth, value: Value) {
        let thunk = match width {
            AccessWidth::Byte => thunks::write_byte as usize,
            AccessWidth::HalfWord => thunks::write_half as usize,
            AccessWidth::Word => thunks::write_word as usize,
        };
        match self.options.memory {
            MemoryLowering::Call => self.write_call(thunk, addr, value),
            MemoryLowering::Lut => {
                // Code pages have no write entry and take the call
                let entry = self.lut_entry(RT_LUT_WRITE, addr);
                let fast = self.b.create_block();
                let slow = self.b.create_block();
                let merge = self.b.create_block();
                self.b.ins().brif(entry, fast, &[], slow, &[]);

                self.b.switch_to_block(fast);
                let host = self.page_address(entry, addr);
                self.host_store(width, value, host, MemFlags::trusted());
                self.b.ins().jump(merge, &[]);

                self.b.switch_to_block(slow);
                self.write_call(thunk, addr, value);
                self.b.ins().jump(merge, &[]);

                self.b.switch_to_block(merge);
            }
            MemoryLowering::Direct => {
                self.flush_state();
                let host = self.direct_address(addr);
                self.host_store(width, value, host, MemFlags::new());
            }
        }
    }

    fn load(&mut self, rt: u8, base: u8, offset: i16, width: AccessWidth, signed: bool) {
        let addr = self.address(base, offset);
        let addr = self.aligned(addr, width);
        let raw = self.read_memory(addr, width);
        let value = match (signed, width) {
            (true, AccessWidth::Byte) => {
                let narrow = self.b.ins().ireduce(types::I8, raw);
                self.b.ins().sextend(types::I32, narrow)
            }
            (true, AccessWidth::HalfWord) => {
                let narrow = self.b.ins().ireduce(types::I16, raw);
                self.b.ins().sextend(types::I32, narrow)
            }
            _ => raw,
        };
        self.set_reg_delayed(rt, value);
    }

    fn store(&mut self, rt: u8, base: u8, offset: i16, width: AccessWidth) {
        let addr = self.address(base, offset);
        let addr = self.aligned(addr, width);
        let value = self.reg(rt);
        self.write_memory(addr, width, value);
    }

    /// LWL/LWR: merge the aligned word into the register, seen through
    /// the load delay slot
    fn load_partial(&mut self, rt: u8, base: u8, offset: i16, left: bool) {
        let addr = self.address(base, offset);
        let mask = self.const32(!3);
        let aligned = self.b.ins().band(addr, mask);
        let word = self.read_memory(aligned, AccessWidth::Word);
        let current = self.reg_bypassing_load_delay(rt);

        let three = self.const32(3);
        let byte = self.b.ins().band(addr, three);
        let shift = self.b.ins().ishl_imm(byte, 3);
        let merged = if left {
            let keep = self.const32(0x00ff_ffff);
            let keep = self.b.ins().ushr(keep, shift);
            let kept = self.b.ins().band(current, keep);
            let twenty_four = self.const32(24);
            let amount = self.b.ins().isub(twenty_four, shift);
            let moved = self.b.ins().ishl(word, amount);
            self.b.ins().bor(kept, moved)
        } else {
            let all = self.const32(0xffff_ffff);
            let dropped = self.b.ins().ushr(all, shift);
            let keep = self.b.ins().bnot(dropped);
            let kept = self.b.ins().band(current, keep);
            let moved = self.b.ins().ushr(word, shift);
            self.b.ins().bor(kept, moved)
        };
        self.set_reg_delayed(rt, merged);
    }

    /// SWL/SWR always go through the bus
    fn store_partial(&mut self, rt: u8, base: u8, offset: i16, left: bool) {
        let addr = self.address(base, offset);
        let value = self.reg(rt);
        let target = if left {
            thunks::write_word_left as usize
        } else {
            thunks::write_word_right as usize
        };
        self.write_call(target, addr, value);
    }

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------

    /// ADD/ADDI/SUB: the result, or an exit on signed overflow
    fn checked(&mut self, a: Value, b: Value, subtract: bool) -> Value {
        let wide_a = self.b.ins().sextend(types::I64, a);
        let wide_b = self.b.ins().sextend(types::I64, b);
        let wide = if subtract {
            self.b.ins().isub(wide_a, wide_b)
        } else {
            self.b.ins().iadd(wide_a, wide_b)
        };
        let narrow = self.b.ins().ireduce(types::I32, wide);
        let back = self.b.ins().sextend(types::I64, narrow);
        let overflow = self.compare(IntCC::NotEqual, wide, back);
        self.reexecute_if(overflow);
        narrow
    }

    fn multiply(&mut self, rs: u8, rt: u8, signed: bool) {
        let a = self.reg(rs);
        let b = self.reg(rt);
        let (a, b) = if signed {
            (
                self.b.ins().sextend(types::I64, a),
                self.b.ins().sextend(types::I64, b),
            )
        } else {
            (
                self.b.ins().uextend(types::I64, a),
                self.b.ins().uextend(types::I64, b),
            )
        };
        let product = self.b.ins().imul(a, b);
        self.split_hi_lo(product);
    }

    fn divide(&mut self, rs: u8, rt: u8, signed: bool) {
        let a = self.reg(rs);
        let b = self.reg(rt);
        let target = if signed {
            thunks::divide as usize
        } else {
            thunks::divide_u as usize
        };
        let result = self.call(self.sigs.binary, target, &[a, b]);
        self.split_hi_lo(result);
    }

    /// Low half to LO, high half to HI
    fn split_hi_lo(&mut self, value: Value) {
        let lo = self.b.ins().ireduce(types::I32, value);
        let high = self.b.ins().ushr_imm(value, 32);
        let hi = self.b.ins().ireduce(types::I32, high);
        self.store_regs(lo, LO);
        self.store_regs(hi, HI);
    }

    fn move_from_cop0(&mut self, rt: u8, rd: u8) {
        self.flush_state();
        let index = self.const32(rd as u32);
        let runtime = self.runtime;
        let result = self.call(
            self.sigs.read,
            thunks::move_from_cop0 as usize,
            &[runtime, index],
        );
        let status = self.b.ins().ushr_imm(result, 32);
        self.reexecute_if(status);
        let value = self.b.ins().ireduce(types::I32, result);
        self.set_reg_delayed(rt, value);
    }

    fn binary(&mut self, rd: u8, rs: u8, rt: u8, op: fn(&mut Self, Value, Value) -> Value) {
        let a = self.reg(rs);
        let b = self.reg(rt);
        let value = op(self, a, b);
        self.set_reg(rd, value);
    }

    fn immediate(&mut self, rt: u8, rs: u8, imm: u32, op: fn(&mut Self, Value, Value) -> Value) {
        let a = self.reg(rs);
        let b = self.const32(imm);
        let value = op(self, a, b);
        self.set_reg(rt, value);
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    fn lower(&mut self, instruction: Instruction) -> Flow {
        use Instruction::*;

        match instruction {
            Sll(rd, rt, sa) => {
                let v = self.reg(rt);
                let r = self.b.ins().ishl_imm(v, sa as i64);
                self.set_reg(rd, r);
            }
            Srl(rd, rt, sa) => {
                let v = self.reg(rt);
                let r = self.b.ins().ushr_imm(v, sa as i64);
                self.set_reg(rd, r);
            }
            Sra(rd, rt, sa) => {
                let v = self.reg(rt);
                let r = self.b.ins().sshr_imm(v, sa as i64);
                self.set_reg(rd, r);
            }
            // Cranelift shift amounts are taken modulo 32 like the guest's
            Sllv(rd, rt, rs) => self.binary(rd, rt, rs, |e, a, b| e.b.ins().ishl(a, b)),
            Srlv(rd, rt, rs) => self.binary(rd, rt, rs, |e, a, b| e.b.ins().ushr(a, b)),
            Srav(rd, rt, rs) => self.binary(rd, rt, rs, |e, a, b| e.b.ins().sshr(a, b)),

            Jr(rs) => {
                let target = self.reg(rs);
                let taken = self.const8(true);
                self.branch(taken, target);
            }
            Jalr(rd, rs) => {
                let target = self.reg(rs);
                let taken = self.const8(true);
                self.branch(taken, target);
                self.link(rd);
            }
            J(_) => {
                let taken = self.const8(true);
                self.static_branch(instruction, taken);
            }
            Jal(_) => {
                let taken = self.const8(true);
                self.static_branch(instruction, taken);
                self.link(RA);
            }
            Beq(rs, rt, _) | Bne(rs, rt, _) => {
                let a = self.reg(rs);
                let b = self.reg(rt);
                let cc = if matches!(instruction, Beq(..)) {
                    IntCC::Equal
                } else {
                    IntCC::NotEqual
                };
                let taken = self.compare(cc, a, b);
                self.static_branch(instruction, taken);
            }
            Blez(rs, _) => self.branch_zero(instruction, rs, IntCC::SignedLessThanOrEqual),
            Bgtz(rs, _) => self.branch_zero(instruction, rs, IntCC::SignedGreaterThan),
            Bltz(rs, _) => self.branch_zero(instruction, rs, IntCC::SignedLessThan),
            Bgez(rs, _) => self.branch_zero(instruction, rs, IntCC::SignedGreaterThanOrEqual),
            Bltzal(rs, _) => {
                self.branch_zero(instruction, rs, IntCC::SignedLessThan);
                self.link(RA);
            }
            Bgezal(rs, _) => {
                self.branch_zero(instruction, rs, IntCC::SignedGreaterThanOrEqual);
                self.link(RA);
            }

            Add(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| e.checked(a, b, false)),
            Addu(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| e.b.ins().iadd(a, b)),
            Sub(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| e.checked(a, b, true)),
            Subu(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| e.b.ins().isub(a, b)),
            Addi(rt, rs, imm) => {
                self.immediate(rt, rs, imm as i32 as u32, |e, a, b| e.checked(a, b, false))
            }
            Addiu(rt, rs, imm) => {
                self.immediate(rt, rs, imm as i32 as u32, |e, a, b| e.b.ins().iadd(a, b))
            }

            And(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| e.b.ins().band(a, b)),
            Or(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| e.b.ins().bor(a, b)),
            Xor(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| e.b.ins().bxor(a, b)),
            Nor(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| {
                let or = e.b.ins().bor(a, b);
                e.b.ins().bnot(or)
            }),
            Andi(rt, rs, imm) => self.immediate(rt, rs, imm as u32, |e, a, b| e.b.ins().band(a, b)),
            Ori(rt, rs, imm) => self.immediate(rt, rs, imm as u32, |e, a, b| e.b.ins().bor(a, b)),
            Xori(rt, rs, imm) => self.immediate(rt, rs, imm as u32, |e, a, b| e.b.ins().bxor(a, b)),
            Lui(rt, imm) => {
                let value = self.const32((imm as u32) << 16);
                self.set_reg(rt, value);
            }

            Slt(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| {
                let c = e.compare(IntCC::SignedLessThan, a, b);
                e.bool_to_reg(c)
            }),
            Sltu(rd, rs, rt) => self.binary(rd, rs, rt, |e, a, b| {
                let c = e.compare(IntCC::UnsignedLessThan, a, b);
                e.bool_to_reg(c)
            }),
            Slti(rt, rs, imm) => self.immediate(rt, rs, imm as i32 as u32, |e, a, b| {
                let c = e.compare(IntCC::SignedLessThan, a, b);
                e.bool_to_reg(c)
            }),
            Sltiu(rt, rs, imm) => self.immediate(rt, rs, imm as i32 as u32, |e, a, b| {
                let c = e.compare(IntCC::UnsignedLessThan, a, b);
                e.bool_to_reg(c)
            }),

            Mult(rs, rt) => self.multiply(rs, rt, true),
            Multu(rs, rt) => self.multiply(rs, rt, false),
            Div(rs, rt) => self.divide(rs, rt, true),
            Divu(rs, rt) => self.divide(rs, rt, false),
            Mfhi(rd) => {
                let v = self.b.ins().load(types::I32, MemFlags::trusted(), self.regs, HI);
                self.set_reg(rd, v);
            }
            Mflo(rd) => {
                let v = self.b.ins().load(types::I32, MemFlags::trusted(), self.regs, LO);
                self.set_reg(rd, v);
            }
            Mthi(rs) => {
                let v = self.reg(rs);
                self.store_regs(v, HI);
            }
            Mtlo(rs) => {
                let v = self.reg(rs);
                self.store_regs(v, LO);
            }

            Lb(rt, base, offset) => self.load(rt, base, offset, AccessWidth::Byte, true),
            Lbu(rt, base, offset) => self.load(rt, base, offset, AccessWidth::Byte, false),
            Lh(rt, base, offset) => self.load(rt, base, offset, AccessWidth::HalfWord, true),
            Lhu(rt, base, offset) => self.load(rt, base, offset, AccessWidth::HalfWord, false),
            Lw(rt, base, offset) => self.load(rt, base, offset, AccessWidth::Word, false),
            Lwl(rt, base, offset) => self.load_partial(rt, base, offset, true),
            Lwr(rt, base, offset) => self.load_partial(rt, base, offset, false),
            Sb(rt, base, offset) => self.store(rt, base, offset, AccessWidth::Byte),
            Sh(rt, base, offset) => self.store(rt, base, offset, AccessWidth::HalfWord),
            Sw(rt, base, offset) => self.store(rt, base, offset, AccessWidth::Word),
            Swl(rt, base, offset) => self.store_partial(rt, base, offset, true),
            Swr(rt, base, offset) => self.store_partial(rt, base, offset, false),

            Mfc0(rt, rd) => self.move_from_cop0(rt, rd),

            // Always raise, or not lowered
            Syscall | Break | CopUnusable(_) | Invalid(_) | Mtc0(..) | Rfe | Mfc2(..)
            | Cfc2(..) | Mtc2(..) | Ctc2(..) | Cop2(_) | Lwc2(..) | Swc2(..) => {
                return self.exit_to_interpreter();
            }
        }

        Flow::Next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psx::bus::{Bus, NullPeripherals};
    use crate::psx::cpu::block::{build_block, BlockKey};
    use crate::tests::asm;

    fn block_of(program: &[u32], mode_bits: u32) -> Block {
        let mut bus = Bus::new(Box::new(NullPeripherals));
        asm::load(&mut bus, 0x80010000, program);
        let key = BlockKey {
            pc: 0x80010000,
            mode_bits,
        };
        build_block(&bus, key, 64).unwrap()
    }

    #[test]
    fn test_discard_slot_follows_gprs() {
        assert_eq!(
            offset_of!(Registers, discard) as i32,
            gpr_offset(NO_REGISTER as u8)
        );
    }

    #[test]
    fn test_check_block() {
        let block = block_of(&[asm::addiu(8, 0, 1), asm::jr(31), asm::nop()], 0);
        assert_eq!(check_block(&block), Ok(()));

        let block = block_of(&[asm::mtc2(8, 1), asm::syscall()], 0);
        assert!(matches!(
            check_block(&block),
            Err(Unsupported::Instruction { pc: 0x80010000, .. })
        ));

        let block = block_of(&[asm::jr(31), asm::j(0x80010000)], 0);
        assert_eq!(check_block(&block), Err(Unsupported::BranchInDelaySlot));

        let block = block_of(&[asm::syscall()], MODE_CACHE_ISOLATED);
        assert_eq!(check_block(&block), Err(Unsupported::CacheIsolated));
    }
}
