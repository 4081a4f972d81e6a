//! MIPS R3000A CPU
//!
//! `Cpu` holds the architectural state shared by the three execution
//! engines: the register file, COP0, the ICache model and the COP2
//! collaborator. The engines live in the submodules and all funnel through
//! the same fetch, exception and boundary helpers defined here.

pub mod block;
pub mod cached_interpreter;
pub mod cop0;
pub mod cop2;
pub mod disasm;
pub mod exception;
pub mod instruction;
pub mod interpreter;
pub mod recompiler;
pub mod registers;

use self::cop0::Cop0;
use self::cop2::Cop2;
use self::exception::{Exception, Fault, PendingException};
use self::registers::Registers;
use super::bus::{Bus, CodeWrite};
use super::cache::ICache;
use super::memory_map::is_cached;
use super::CycleCount;
use crate::config::ExecutionMode;
use crate::performance_monitor::PerformanceMonitor;

/// Block key bit: fetch timing comes from the ICache model
pub const MODE_ICACHE: u32 = 1 << 0;
/// Block key bit: SR.IsC is set, stores only reach the ICache
pub const MODE_CACHE_ISOLATED: u32 = 1 << 1;

/// Common interface of the three engines
pub trait ExecutionEngine {
    fn mode(&self) -> ExecutionMode;

    /// Execute one unit of work at `regs.pc`: one instruction for the
    /// interpreter, one block for the others. Returns the cycles charged.
    fn run_block(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        monitor: &mut PerformanceMonitor,
    ) -> CycleCount;

    /// Drop every cached or compiled block
    fn flush(&mut self, bus: &mut Bus);

    /// Drop the blocks a guest write overlaps. Returns how many went.
    fn invalidate(&mut self, bus: &mut Bus, write: CodeWrite) -> usize;
}

pub struct Cpu {
    pub regs: Registers,
    pub cop0: Cop0,
    pub icache: ICache,
    pub cop2: Box<dyn Cop2>,
    /// Total cycles charged since reset
    pub cycles: u64,
    pending_exception: Option<PendingException>,
    icache_emulation: bool,
}

impl Cpu {
    pub fn new(cop2: Box<dyn Cop2>) -> Self {
        Cpu {
            regs: Registers::new(),
            cop0: Cop0::new(),
            icache: ICache::new(),
            cop2,
            cycles: 0,
            pending_exception: None,
            icache_emulation: false,
        }
    }

    pub fn reset(&mut self) {
        self.regs = Registers::new();
        self.cop0 = Cop0::new();
        self.icache.invalidate();
        self.cycles = 0;
        self.pending_exception = None;
    }

    pub fn icache_emulation(&self) -> bool {
        self.icache_emulation
    }

    pub fn set_icache_emulation(&mut self, enabled: bool) {
        if self.icache_emulation != enabled {
            self.icache.invalidate();
        }
        self.icache_emulation = enabled;
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    /// Cycles one instruction fetch at `pc` costs. Updates the ICache tags
    /// when ICache emulation is on.
    #[inline]
    pub(crate) fn fetch_cycles(&mut self, bus: &Bus, pc: u32) -> CycleCount {
        if !self.icache_emulation {
            return 1;
        }
        let cached = is_cached(pc) && bus.cache_control().icache_enabled();
        self.icache.fetch_cycles(pc, cached, bus.fill_ticks(pc))
    }

    /// Fetch the word at `pc`
    pub(crate) fn fetch(&mut self, bus: &Bus, pc: u32) -> Result<(u32, CycleCount), Fault> {
        if pc & 3 != 0 {
            return Err(Fault::address(Exception::LoadAddressError, pc));
        }
        let word = bus
            .fetch_word(pc)
            .map_err(|_| Fault::new(Exception::InstructionBusError))?;
        Ok((word, self.fetch_cycles(bus, pc)))
    }

    /// Move the pipeline to the next instruction: `pc` becomes the
    /// instruction being executed
    #[inline(always)]
    pub(crate) fn advance_pipeline(&mut self) {
        let regs = &mut self.regs;
        regs.current_pc = regs.pc;
        regs.in_delay_slot = regs.branch_pending;
        regs.branch_pending = false;
        regs.pc = regs.next_pc;
        regs.next_pc = regs.pc.wrapping_add(4);
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    /// Record a fault of the instruction at `current_pc`. It is delivered
    /// at the next instruction boundary.
    pub(crate) fn raise(&mut self, fault: Fault) {
        self.pending_exception = Some(PendingException {
            exception: fault.exception,
            pc: self.regs.current_pc,
            in_delay_slot: self.regs.in_delay_slot,
            branch_taken: self.regs.in_delay_slot && self.regs.branch_taken,
            bad_vaddr: fault.bad_vaddr,
            coprocessor: fault.coprocessor,
        });
    }

    /// Record a fault described completely by the caller (recompiled code
    /// knows the faulting site without the pipeline registers)
    pub(crate) fn raise_at(&mut self, pending: PendingException) {
        if self.pending_exception.is_none() {
            self.pending_exception = Some(pending);
        }
    }

    pub fn pending_exception(&self) -> Option<&PendingException> {
        self.pending_exception.as_ref()
    }

    pub(crate) fn set_pending_exception(&mut self, pending: Option<PendingException>) {
        self.pending_exception = pending;
    }

    /// Redirect execution to the exception vector for the pending fault
    pub fn dispatch_pending_exception(&mut self) -> Option<Exception> {
        let pending = self.pending_exception.take()?;
        self.regs.flush_pipeline();
        let vector = self.cop0.enter_exception(&pending);
        self.regs.jump_to(vector);
        trace!(
            "{} at {:#010x}{} -> {:#010x}",
            pending.exception,
            pending.pc,
            if pending.in_delay_slot { " (delay slot)" } else { "" },
            vector
        );
        Some(pending.exception)
    }

    /// Work done between instructions or blocks: deliver the pending fault,
    /// then take an external interrupt if one is unmasked. Returns the
    /// exception entered, if any.
    pub fn service_boundary(&mut self, bus: &Bus) -> Option<Exception> {
        if let Some(exception) = self.dispatch_pending_exception() {
            return Some(exception);
        }

        self.cop0.set_interrupt_line(bus.interrupt_pending());
        if !self.cop0.interrupt_pending() {
            return None;
        }

        // EPC points at the instruction that did not execute yet
        self.pending_exception = Some(PendingException {
            exception: Exception::Interrupt,
            pc: self.regs.pc,
            in_delay_slot: self.regs.branch_pending,
            branch_taken: self.regs.branch_pending && self.regs.branch_taken,
            bad_vaddr: None,
            coprocessor: 0,
        });
        self.dispatch_pending_exception()
    }

    /// Block cache key bits for the current mode. Blocks built under one
    /// set of bits are never run under another.
    pub(crate) fn mode_bits(&self) -> u32 {
        let mut bits = 0;
        if self.icache_emulation {
            bits |= MODE_ICACHE;
        }
        if self.cop0.cache_isolated() {
            bits |= MODE_CACHE_ISOLATED;
        }
        bits
    }
}
