//! Cached interpreter
//!
//! Decodes each block once and replays the decoded instructions through the
//! interpreter's `run_instruction`. Guest writes to code pages end the
//! current block right after the store so the owner can drop stale blocks
//! before anything else runs.

use super::block::{build_block, Block, BlockCache, BlockKey};
use super::{Cpu, ExecutionEngine};
use crate::config::ExecutionMode;
use crate::performance_monitor::PerformanceMonitor;
use crate::psx::bus::{Bus, CodeWrite};
use crate::psx::CycleCount;

pub struct CachedInterpreter {
    cache: BlockCache<Block>,
    max_block_instructions: usize,
}

impl CachedInterpreter {
    pub fn new(max_block_instructions: usize) -> Self {
        CachedInterpreter {
            cache: BlockCache::new(),
            max_block_instructions: max_block_instructions.max(1),
        }
    }

    pub fn block_count(&self) -> usize {
        self.cache.len()
    }

    pub fn has_block(&self, key: &BlockKey) -> bool {
        self.cache.contains(key)
    }

    /// Make sure a block for `key` is cached. False if nothing can be
    /// decoded there.
    fn ensure_block(
        &mut self,
        bus: &mut Bus,
        key: BlockKey,
        monitor: &mut PerformanceMonitor,
    ) -> bool {
        if self.cache.contains(&key) {
            monitor.block_cache_hit();
            return true;
        }
        match build_block(bus, key, self.max_block_instructions) {
            Some(block) => {
                trace!("Built block {:#010x} ({} instructions)", key.pc, block.len());
                self.cache.insert(bus, key, block);
                monitor.block_built();
                true
            }
            None => false,
        }
    }
}

/// Run the decoded instructions of `block`. Stops after a faulting
/// instruction or a store that hit a code page. Returns the instructions
/// executed and the cycles charged.
pub(crate) fn execute_block(cpu: &mut Cpu, bus: &mut Bus, block: &Block) -> (u64, CycleCount) {
    let icache = cpu.icache_emulation();
    let mut cycles: CycleCount = 0;
    let mut executed = 0u64;

    for decoded in &block.instructions {
        debug_assert_eq!(cpu.regs.pc, decoded.pc);
        cycles += if icache {
            cpu.fetch_cycles(bus, decoded.pc)
        } else {
            1
        };
        executed += 1;

        if !cpu.run_instruction(bus, decoded.instruction) || bus.has_code_writes() {
            break;
        }
    }

    cpu.cycles += cycles as u64;
    (executed, cycles)
}

impl ExecutionEngine for CachedInterpreter {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::CachedInterpreter
    }

    fn run_block(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        monitor: &mut PerformanceMonitor,
    ) -> CycleCount {
        cpu.service_boundary(bus);

        // Entering in the middle of a delay slot: finish it one step at a
        // time, blocks always start on a fresh instruction
        if cpu.regs.branch_pending {
            let cycles = cpu.step(bus);
            monitor.record_block(ExecutionMode::CachedInterpreter, 1, cycles as u64);
            return cycles;
        }

        let key = BlockKey {
            pc: cpu.regs.pc,
            mode_bits: cpu.mode_bits(),
        };
        if !self.ensure_block(bus, key, monitor) {
            // raises the fetch exception
            let cycles = cpu.step(bus);
            monitor.record_block(ExecutionMode::CachedInterpreter, 1, cycles as u64);
            return cycles;
        }

        let (executed, cycles) = match self.cache.get(&key) {
            Some(block) => execute_block(cpu, bus, block),
            None => return 0,
        };
        monitor.record_block(ExecutionMode::CachedInterpreter, executed, cycles as u64);
        cycles
    }

    fn flush(&mut self, bus: &mut Bus) {
        if !self.cache.is_empty() {
            debug!("Flushing {} cached blocks", self.cache.len());
        }
        self.cache.flush(bus);
    }

    fn invalidate(&mut self, bus: &mut Bus, write: CodeWrite) -> usize {
        self.cache.invalidate(bus, write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psx::bus::NullPeripherals;
    use crate::psx::cpu::cop2::RegisterFileCop2;
    use crate::tests::asm;

    fn setup(program: &[u32]) -> (Cpu, Bus) {
        let mut bus = Bus::new(Box::new(NullPeripherals));
        asm::load(&mut bus, 0x80010000, program);
        let mut cpu = Cpu::new(Box::new(RegisterFileCop2::new()));
        cpu.regs.jump_to(0x80010000);
        (cpu, bus)
    }

    #[test]
    fn test_block_is_reused() {
        let (mut cpu, mut bus) = setup(&[
            asm::addiu(8, 8, 1),
            asm::bne(8, 9, -2),
            asm::nop(),
            asm::syscall(),
        ]);
        cpu.regs.gpr[9] = 3;
        let mut engine = CachedInterpreter::new(64);
        let mut monitor = PerformanceMonitor::new();

        for _ in 0..3 {
            engine.run_block(&mut cpu, &mut bus, &mut monitor);
        }
        assert_eq!(cpu.regs.gpr[8], 3);
        assert_eq!(cpu.regs.pc, 0x8001000c);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.blocks_built, 1);
        assert_eq!(snapshot.block_cache_hits, 2);
        assert_eq!(snapshot.cached_interpreter.instructions, 9);
        assert_eq!(engine.block_count(), 1);
    }

    #[test]
    fn test_store_to_code_page_ends_block() {
        // sw $t1, 12($t0) rewrites the nop at 0x8001000c
        let (mut cpu, mut bus) = setup(&[
            asm::sw(9, 8, 12),
            asm::addiu(10, 0, 1),
            asm::nop(),
            asm::nop(),
            asm::syscall(),
        ]);
        cpu.regs.gpr[8] = 0x80010000;
        cpu.regs.gpr[9] = asm::addiu(11, 0, 7);
        let mut engine = CachedInterpreter::new(64);
        let mut monitor = PerformanceMonitor::new();

        engine.run_block(&mut cpu, &mut bus, &mut monitor);
        assert_eq!(cpu.regs.pc, 0x80010004);
        let writes = bus.take_code_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(engine.invalidate(&mut bus, writes[0]), 1);

        engine.run_block(&mut cpu, &mut bus, &mut monitor);
        assert_eq!(cpu.regs.gpr[11], 7);
    }

    #[test]
    fn test_unfetchable_pc_raises_bus_error() {
        let (mut cpu, mut bus) = setup(&[]);
        cpu.regs.jump_to(0x1f801000);
        let mut engine = CachedInterpreter::new(64);
        let mut monitor = PerformanceMonitor::new();

        engine.run_block(&mut cpu, &mut bus, &mut monitor);
        assert!(cpu.pending_exception().is_some());
        assert_eq!(engine.block_count(), 0);
        engine.run_block(&mut cpu, &mut bus, &mut monitor);
        assert_eq!(cpu.cop0.epc, 0x1f801000);
    }
}
