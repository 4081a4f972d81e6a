//! Cranelift recompiler
//!
//! Blocks are decoded with the same block builder as the cached interpreter
//! and lowered to host code one at a time. Anything the code generator
//! does not handle (COP2, MTC0/RFE, cache isolation, ICache timing) keeps
//! the decoded block and runs it through the interpreter instead, so every
//! block always has an entry in the cache.
//!
//! Exceptions inside compiled code are never raised by the generated code
//! itself: the block stops before the instruction and the dispatcher steps
//! it through the interpreter.

pub mod code_buffer;
pub mod codegen;
pub mod guarded;
pub mod thunks;

use std::collections::HashSet;
use std::ptr;

use self::code_buffer::{BlockFn, CodeBuffer};
use self::codegen::{check_block, emit_block, LowerOptions, MemoryLowering};
use self::thunks::{Runtime, REEXECUTE};
use super::block::{build_block, Block, BlockCache, BlockKey, CachedBlock};
use super::cached_interpreter::execute_block;
use super::{Cpu, ExecutionEngine, MODE_ICACHE};
use crate::config::{CpuConfig, ExecutionMode, FastmemMode};
use crate::error::Result;
use crate::performance_monitor::PerformanceMonitor;
use crate::psx::bus::{Bus, CodeWrite};
use crate::psx::CycleCount;

enum CompiledEntry {
    Native {
        start: u32,
        byte_len: u32,
        entry: BlockFn,
        lowering: MemoryLowering,
    },
    Interpreted(Block),
}

impl CachedBlock for CompiledEntry {
    fn start(&self) -> u32 {
        match self {
            CompiledEntry::Native { start, .. } => *start,
            CompiledEntry::Interpreted(block) => block.start(),
        }
    }

    fn byte_len(&self) -> u32 {
        match self {
            CompiledEntry::Native { byte_len, .. } => *byte_len,
            CompiledEntry::Interpreted(block) => block.byte_len(),
        }
    }
}

pub struct Recompiler {
    buffer: CodeBuffer,
    blocks: BlockCache<CompiledEntry>,
    max_block_instructions: usize,
    memory_exceptions: bool,
    /// Fastmem mode the cached blocks were lowered for
    lowered_for: FastmemMode,
    /// Blocks that faulted in the MMap arena, lowered through the LUT from
    /// then on
    slowmem: HashSet<u32>,
    /// Start addresses already reported as not compilable
    warned: HashSet<u32>,
}

impl Recompiler {
    pub fn new(config: &CpuConfig) -> Result<Self> {
        let buffer = CodeBuffer::new(config.code_buffer_size)?;
        info!(
            "Recompiler ready ({} KiB code buffer, memory exceptions {})",
            buffer.capacity() / 1024,
            if config.memory_exceptions { "on" } else { "off" }
        );
        Ok(Recompiler {
            buffer,
            blocks: BlockCache::new(),
            max_block_instructions: config.max_block_instructions.max(1),
            memory_exceptions: config.memory_exceptions,
            lowered_for: FastmemMode::Disabled,
            slowmem: HashSet::new(),
            warned: HashSet::new(),
        })
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// True if the block at `key` runs as host code
    pub fn is_compiled(&self, key: &BlockKey) -> bool {
        matches!(self.blocks.get(key), Some(CompiledEntry::Native { .. }))
    }

    pub fn code_buffer_used(&self) -> usize {
        self.buffer.used()
    }

    fn lowering(&self, mode: FastmemMode, pc: u32) -> MemoryLowering {
        match mode {
            FastmemMode::Disabled => MemoryLowering::Call,
            FastmemMode::Lut => MemoryLowering::Lut,
            FastmemMode::Mmap if self.slowmem.contains(&pc) => MemoryLowering::Lut,
            FastmemMode::Mmap => MemoryLowering::Direct,
        }
    }

    /// Decode and compile the block at `key`. False if nothing can be
    /// fetched there.
    fn build(&mut self, bus: &mut Bus, key: BlockKey, monitor: &mut PerformanceMonitor) -> bool {
        let Some(block) = build_block(bus, key, self.max_block_instructions) else {
            return false;
        };
        monitor.block_built();

        let entry = if key.mode_bits & MODE_ICACHE != 0 {
            // fetch timing needs the per instruction ICache model
            CompiledEntry::Interpreted(block)
        } else if let Err(reason) = check_block(&block) {
            if self.warned.insert(key.pc) {
                warn!("Block {:#010x} left to the interpreter: {}", key.pc, reason);
            }
            monitor.recompiler_fallback();
            CompiledEntry::Interpreted(block)
        } else {
            match self.compile(bus, &block, monitor) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to compile block {:#010x}: {}", key.pc, e);
                    monitor.recompiler_fallback();
                    CompiledEntry::Interpreted(block)
                }
            }
        };

        self.blocks.insert(bus, key, entry);
        true
    }

    fn compile(
        &mut self,
        bus: &mut Bus,
        block: &Block,
        monitor: &mut PerformanceMonitor,
    ) -> Result<CompiledEntry> {
        if self.buffer.is_full() {
            debug!(
                "Code buffer full ({} of {} bytes, {} blocks), resetting",
                self.buffer.used(),
                self.buffer.capacity(),
                self.buffer.function_count()
            );
            self.blocks.flush(bus);
            self.buffer.reset()?;
            monitor.code_buffer_reset();
        }

        let lowering = self.lowering(bus.fastmem_mode(), block.start());
        let options = LowerOptions {
            memory: lowering,
            memory_exceptions: self.memory_exceptions,
        };
        let entry = self.buffer.compile(|builder, pointer_type, regs, runtime| {
            emit_block(builder, pointer_type, regs, runtime, block, options)
        })?;

        trace!(
            "Compiled block {:#010x} ({} instructions, {:?})",
            block.start(),
            block.len(),
            lowering
        );
        monitor.block_compiled();
        Ok(CompiledEntry::Native {
            start: block.start(),
            byte_len: block.byte_len(),
            entry,
            lowering,
        })
    }

    /// Run a block lowered to host code. Returns the cycles charged.
    fn run_native(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        key: BlockKey,
        entry: BlockFn,
        lowering: MemoryLowering,
        monitor: &mut PerformanceMonitor,
    ) -> CycleCount {
        let arena = match lowering {
            MemoryLowering::Direct => bus.fastmem_range(),
            _ => None,
        };
        let cpu_ptr: *mut Cpu = cpu;
        let mut runtime = Runtime::new(cpu_ptr, bus, self.memory_exceptions);

        // SAFETY: the block was compiled into the live code buffer with the
        // `BlockFn` signature. `cpu` and `bus` outlive the call and are only
        // reached through the runtime while it runs.
        let fault = unsafe {
            let regs = ptr::addr_of_mut!((*cpu_ptr).regs);
            guarded::call(entry, regs, &mut runtime, arena)
        };
        let faulted = fault.is_some();

        let executed = runtime.instructions;
        cpu.cycles += executed as u64;
        let mut cycles = executed as CycleCount;
        let mut instructions = executed as u64;

        if let Some(host) = fault {
            monitor.fastmem_fault();
            debug!(
                "Fastmem fault at host {:#x} in block {:#010x}, lowering it through the LUT",
                host, key.pc
            );
            self.slowmem.insert(key.pc);
            self.blocks.remove(bus, &key);
        }
        if faulted || runtime.exit == REEXECUTE {
            // The deferred bus error of an earlier access wins
            if cpu.pending_exception().is_none() {
                cycles += cpu.step(bus);
                instructions += 1;
            }
        }

        monitor.record_block(ExecutionMode::Recompiler, instructions, cycles as u64);
        cycles
    }
}

impl ExecutionEngine for Recompiler {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Recompiler
    }

    fn run_block(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        monitor: &mut PerformanceMonitor,
    ) -> CycleCount {
        cpu.service_boundary(bus);

        if cpu.regs.branch_pending {
            let cycles = cpu.step(bus);
            monitor.record_block(ExecutionMode::Recompiler, 1, cycles as u64);
            return cycles;
        }

        if bus.fastmem_mode() != self.lowered_for {
            self.flush(bus);
            self.lowered_for = bus.fastmem_mode();
        }

        let key = BlockKey {
            pc: cpu.regs.pc,
            mode_bits: cpu.mode_bits(),
        };
        if self.blocks.contains(&key) {
            monitor.block_cache_hit();
        } else if !self.build(bus, key, monitor) {
            // raises the fetch exception
            let cycles = cpu.step(bus);
            monitor.record_block(ExecutionMode::Recompiler, 1, cycles as u64);
            return cycles;
        }

        let native = match self.blocks.get(&key) {
            Some(CompiledEntry::Native {
                entry, lowering, ..
            }) => (*entry, *lowering),
            Some(CompiledEntry::Interpreted(block)) => {
                let (executed, cycles) = execute_block(cpu, bus, block);
                monitor.record_block(ExecutionMode::Recompiler, executed, cycles as u64);
                return cycles;
            }
            None => return 0,
        };
        self.run_native(cpu, bus, key, native.0, native.1, monitor)
    }

    fn flush(&mut self, bus: &mut Bus) {
        if !self.blocks.is_empty() {
            debug!(
                "Flushing {} recompiled blocks ({} bytes of host code)",
                self.blocks.len(),
                self.buffer.used()
            );
        }
        self.blocks.flush(bus);
        self.slowmem.clear();
        if let Err(e) = self.buffer.reset() {
            warn!("Code buffer reset failed, keeping the old one: {}", e);
        }
    }

    fn invalidate(&mut self, bus: &mut Bus, write: CodeWrite) -> usize {
        self.blocks.invalidate(bus, write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psx::bus::NullPeripherals;
    use crate::psx::cpu::cop2::RegisterFileCop2;
    use crate::psx::cpu::exception::Exception;
    use crate::tests::asm;

    const BASE: u32 = 0x80010000;

    fn setup(program: &[u32]) -> (Cpu, Bus, Recompiler) {
        let mut bus = Bus::new(Box::new(NullPeripherals));
        asm::load(&mut bus, BASE, program);
        let mut cpu = Cpu::new(Box::new(RegisterFileCop2::new()));
        cpu.regs.jump_to(BASE);
        let config = CpuConfig {
            code_buffer_size: 1 << 20,
            ..CpuConfig::default()
        };
        (cpu, bus, Recompiler::new(&config).unwrap())
    }

    fn key(pc: u32) -> BlockKey {
        BlockKey { pc, mode_bits: 0 }
    }

    #[test]
    fn test_simple_block_runs_natively() {
        let (mut cpu, mut bus, mut jit) = setup(&[
            asm::addiu(8, 0, 5),
            asm::sll(9, 8, 4),
            asm::addu(10, 8, 9),
            asm::syscall(),
        ]);
        let mut monitor = PerformanceMonitor::new();

        jit.run_block(&mut cpu, &mut bus, &mut monitor);
        assert!(jit.is_compiled(&key(BASE)));
        assert_eq!(cpu.regs.gpr[10], 85);
        // syscall was re-executed by the interpreter
        assert_eq!(cpu.pending_exception().unwrap().exception, Exception::Syscall);
        assert_eq!(cpu.pending_exception().unwrap().pc, BASE + 12);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.blocks_compiled, 1);
        assert_eq!(snapshot.recompiler.instructions, 4);
    }

    #[test]
    fn test_cop2_block_falls_back_to_interpreter() {
        let (mut cpu, mut bus, mut jit) = setup(&[
            asm::addiu(8, 0, 0x123),
            asm::mtc2(8, 1),
            asm::nop(),
            asm::mfc2(9, 1),
            asm::nop(),
            asm::nop(),
            asm::syscall(),
        ]);
        cpu.cop0.sr |= 1 << 30;
        let mut monitor = PerformanceMonitor::new();

        jit.run_block(&mut cpu, &mut bus, &mut monitor);
        assert!(!jit.is_compiled(&key(BASE)));
        assert_eq!(jit.block_count(), 1);
        assert_eq!(monitor.snapshot().recompiler_fallbacks, 1);
        assert_eq!(cpu.regs.gpr[9], 0x123);
    }

    #[test]
    fn test_overflow_stops_at_faulting_instruction() {
        let (mut cpu, mut bus, mut jit) = setup(&[
            asm::addiu(9, 0, 1),
            asm::addi(8, 8, 1),
            asm::addiu(10, 0, 1),
            asm::syscall(),
        ]);
        cpu.regs.gpr[8] = 0x7fff_ffff;
        let mut monitor = PerformanceMonitor::new();

        jit.run_block(&mut cpu, &mut bus, &mut monitor);
        let pending = *cpu.pending_exception().unwrap();
        assert_eq!(pending.exception, Exception::Overflow);
        assert_eq!(pending.pc, BASE + 4);
        assert_eq!(cpu.regs.gpr[8], 0x7fff_ffff);
        assert_eq!(cpu.regs.gpr[9], 1);
        assert_eq!(cpu.regs.gpr[10], 0);
    }

    #[test]
    fn test_misaligned_access_stops_at_faulting_instruction() {
        let cases = [
            (asm::lw(9, 8, 2), Exception::LoadAddressError),
            (asm::sh(9, 8, 1), Exception::StoreAddressError),
        ];
        for fastmem in [FastmemMode::Disabled, FastmemMode::Lut] {
            for (access, exception) in cases {
                let (mut cpu, mut bus, mut jit) = setup(&[
                    asm::lui(8, 0x8000),
                    access,
                    asm::addiu(10, 0, 1),
                    asm::syscall(),
                ]);
                bus.set_fastmem_mode(fastmem);
                bus.poke_word(0x8000_0000, 0xaabb_ccdd).unwrap();
                let mut monitor = PerformanceMonitor::new();

                jit.run_block(&mut cpu, &mut bus, &mut monitor);
                assert!(jit.is_compiled(&key(BASE)));
                let pending = *cpu.pending_exception().unwrap();
                assert_eq!(pending.exception, exception, "{:?}", fastmem);
                assert_eq!(pending.pc, BASE + 4);
                assert_eq!(cpu.regs.gpr[9], 0);
                assert_eq!(cpu.regs.gpr[10], 0);
                assert_eq!(bus.peek_word(0x8000_0000), Some(0xaabb_ccdd));
            }
        }
    }

    #[test]
    fn test_invalidation_drops_compiled_block() {
        let (mut cpu, mut bus, mut jit) = setup(&[asm::addiu(8, 8, 1), asm::syscall()]);
        let mut monitor = PerformanceMonitor::new();
        jit.run_block(&mut cpu, &mut bus, &mut monitor);
        assert!(jit.is_compiled(&key(BASE)));

        let removed = jit.invalidate(
            &mut bus,
            CodeWrite {
                address: BASE & 0x1f_ffff,
                len: 4,
            },
        );
        assert_eq!(removed, 1);
        assert_eq!(jit.block_count(), 0);
        assert!(!bus.is_code_address(BASE));
    }

    #[test]
    fn test_fastmem_change_flushes_blocks() {
        let (mut cpu, mut bus, mut jit) = setup(&[asm::addiu(8, 8, 1), asm::syscall()]);
        let mut monitor = PerformanceMonitor::new();
        jit.run_block(&mut cpu, &mut bus, &mut monitor);
        assert_eq!(jit.block_count(), 1);

        bus.set_fastmem_mode(FastmemMode::Lut);
        cpu.set_pending_exception(None);
        cpu.regs.jump_to(BASE);
        jit.run_block(&mut cpu, &mut bus, &mut monitor);
        assert_eq!(cpu.regs.gpr[8], 2);
        assert_eq!(monitor.snapshot().blocks_compiled, 2);
    }
}
