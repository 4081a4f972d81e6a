//! CPU core session
//!
//! `CpuCore` owns the architectural state, the memory access layer, the
//! active execution engine and the debugger. It is the single place where
//! engines are switched, where cached code is flushed after writes and
//! setting changes, and where execution stops for breakpoints.
//!
//! Everything here happens at block boundaries. Requests coming from other
//! threads go through a `ControlHandle` and are picked up by `run` before
//! the next block.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::{CpuConfig, ExecutionMode, FastmemMode};
use crate::debugger::{self, Debugger, StopReason};
use crate::error::{PsxError, Result};
use crate::performance_monitor::{PerformanceMonitor, PerformanceSnapshot, RunStats};
use crate::psx::bus::{Bus, Peripherals};
use crate::psx::cpu::cached_interpreter::CachedInterpreter;
use crate::psx::cpu::cop2::Cop2;
use crate::psx::cpu::disasm::DisassembledInstruction;
use crate::psx::cpu::exception::{ControllerState, Exception};
use crate::psx::cpu::interpreter::Interpreter;
use crate::psx::cpu::recompiler::Recompiler;
use crate::psx::cpu::{Cpu, ExecutionEngine};
use crate::save_state::SaveState;

const ICACHE_UNCHANGED: u8 = 0;
const ICACHE_DISABLE: u8 = 1;
const ICACHE_ENABLE: u8 = 2;

#[derive(Debug, Default)]
struct ControlFlags {
    stop: AtomicBool,
    flush: AtomicBool,
    icache: AtomicU8,
}

/// Cross-thread requests to a running core. Each one takes effect at the
/// next block boundary.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    flags: Arc<ControlFlags>,
}

impl ControlHandle {
    /// Make `run` return with `StopReason::StopRequested`
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::Release);
    }

    /// Drop every cached and compiled block
    pub fn request_flush(&self) {
        self.flags.flush.store(true, Ordering::Release);
    }

    pub fn request_icache_emulation(&self, enabled: bool) {
        let value = if enabled { ICACHE_ENABLE } else { ICACHE_DISABLE };
        self.flags.icache.store(value, Ordering::Release);
    }
}

/// Outcome of a `run` slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    /// Guest cycles executed
    pub cycles: u64,
    /// Why the slice ended early, `None` when the budget ran out
    pub stop: Option<StopReason>,
}

pub struct CpuCore {
    cpu: Cpu,
    bus: Bus,
    engine: Box<dyn ExecutionEngine>,
    debugger: Debugger,
    monitor: PerformanceMonitor,
    config: CpuConfig,
    state: ControllerState,
    flags: Arc<ControlFlags>,
}

impl CpuCore {
    pub fn new(
        config: CpuConfig,
        peripherals: Box<dyn Peripherals>,
        cop2: Box<dyn Cop2>,
    ) -> Result<Self> {
        config.validate()?;
        let mut config = config;

        let mut bus = Bus::new(peripherals);
        config.fastmem_mode = bus.set_fastmem_mode(config.fastmem_mode);

        let mut cpu = Cpu::new(cop2);
        cpu.set_icache_emulation(config.icache_emulation);

        let engine = create_engine(&mut config);
        info!(
            "CPU core {} started: {}, fastmem {:?}, icache emulation {}",
            crate::VERSION,
            config.execution_mode,
            config.fastmem_mode,
            config.icache_emulation
        );

        Ok(CpuCore {
            cpu,
            bus,
            engine,
            debugger: Debugger::new(),
            monitor: PerformanceMonitor::new(),
            config,
            state: ControllerState::Running,
            flags: Arc::new(ControlFlags::default()),
        })
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Direct memory access for loaders and the debugger. Writes to RAM
    /// holding code are picked up at the start of the next `run`.
    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    pub fn debugger_mut(&mut self) -> &mut Debugger {
        &mut self.debugger
    }

    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            flags: Arc::clone(&self.flags),
        }
    }

    pub fn load_bios(&mut self, data: &[u8]) -> Result<()> {
        self.flush();
        self.bus.load_bios(data)
    }

    /// Back to the reset vector. Memory is left alone.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.flush();
        self.state = ControllerState::Running;
    }

    /// Drop every cached and compiled block
    pub fn flush(&mut self) {
        self.engine.flush(&mut self.bus);
        self.bus.take_code_writes();
        self.monitor.block_cache_flushed();
    }

    // ------------------------------------------------------------------
    // Execution mode switch
    // ------------------------------------------------------------------

    pub fn execution_mode(&self) -> ExecutionMode {
        self.engine.mode()
    }

    /// Switch engines. Returns the engine actually running, the cached
    /// interpreter when the recompiler can't start.
    pub fn set_execution_mode(&mut self, mode: ExecutionMode) -> ExecutionMode {
        if mode == self.engine.mode() {
            return mode;
        }
        self.flush();
        self.config.execution_mode = mode;
        self.engine = create_engine(&mut self.config);
        info!("Execution mode: {}", self.config.execution_mode);
        self.config.execution_mode
    }

    pub fn fastmem_mode(&self) -> FastmemMode {
        self.bus.fastmem_mode()
    }

    /// Reinitialize the memory access layer. Returns the strategy in
    /// effect, the LUT when MMap is unavailable.
    pub fn set_fastmem_mode(&mut self, mode: FastmemMode) -> FastmemMode {
        if mode == self.bus.fastmem_mode() {
            return mode;
        }
        // blocks still hold code page marks in the old strategy
        self.flush();
        self.config.fastmem_mode = self.bus.set_fastmem_mode(mode);
        self.config.fastmem_mode
    }

    pub fn icache_emulation(&self) -> bool {
        self.cpu.icache_emulation()
    }

    pub fn set_icache_emulation(&mut self, enabled: bool) {
        if enabled == self.cpu.icache_emulation() {
            return;
        }
        self.flush();
        self.cpu.set_icache_emulation(enabled);
        self.config.icache_emulation = enabled;
        info!(
            "ICache emulation {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    pub fn controller_state(&self) -> ControllerState {
        match self.state {
            ControllerState::Running => match self.cpu.pending_exception() {
                Some(pending) => ControllerState::ExceptionPending(pending.exception),
                None => ControllerState::Running,
            },
            state => state,
        }
    }

    /// Execute until about `cycles` guest cycles have run or something
    /// stops execution. A paused core returns `StopReason::Paused` without
    /// running anything.
    pub fn run(&mut self, cycles: u64) -> RunResult {
        match self.state {
            ControllerState::PausedAtBreakpoint(_) => {
                return RunResult {
                    cycles: 0,
                    stop: Some(StopReason::Paused),
                }
            }
            ControllerState::Stepping => {
                self.debugger.resume_from(self.cpu.regs.pc);
                self.state = ControllerState::Running;
            }
            _ => {}
        }

        self.drain_code_writes();
        self.monitor.begin_slice();
        let start = self.cpu.cycles;
        let stop = loop {
            if self.cpu.cycles.wrapping_sub(start) >= cycles {
                break None;
            }
            self.service_boundary();
            if let Some(reason) = self.apply_requests() {
                break Some(reason);
            }
            if self.debugger.is_active() {
                if let Some(reason) = self.debugger.check(&self.cpu, &self.bus) {
                    self.state = ControllerState::PausedAtBreakpoint(self.cpu.regs.pc);
                    break Some(reason);
                }
            }
            self.execute_unit();
            self.drain_code_writes();
        };
        self.monitor.end_slice();

        RunResult {
            cycles: self.cpu.cycles.wrapping_sub(start),
            stop,
        }
    }

    /// Execute exactly one instruction with the interpreter, whatever
    /// engine is active
    pub fn step(&mut self) -> StopReason {
        self.service_boundary();
        let cycles = self.cpu.step(&mut self.bus);
        self.monitor
            .record_block(ExecutionMode::Interpreter, 1, cycles as u64);
        self.drain_code_writes();
        self.state = ControllerState::Stepping;
        StopReason::Step(self.cpu.regs.pc)
    }

    /// Run over the call at `pc`, stopping after its delay slot. Anything
    /// else is a plain step.
    pub fn step_over(&mut self, max_cycles: u64) -> RunResult {
        match debugger::step_over_target(&self.bus, self.cpu.regs.pc) {
            Some(target) => {
                self.debugger.set_transient(target);
                self.continue_from_pause();
                let result = self.run(max_cycles);
                self.debugger.clear_transient();
                result
            }
            None => self.single_step(),
        }
    }

    /// Run until the current function returns, stopping at the instruction
    /// its `jr $ra` goes back to
    pub fn step_out(&mut self, max_cycles: u64) -> Result<RunResult> {
        let ret = debugger::find_return(&self.bus, self.cpu.regs.pc)?;

        let mut result = if ret == self.cpu.regs.pc {
            RunResult {
                cycles: 0,
                stop: Some(StopReason::Breakpoint(ret)),
            }
        } else {
            self.debugger.set_transient(ret);
            self.continue_from_pause();
            let result = self.run(max_cycles);
            self.debugger.clear_transient();
            result
        };

        if result.stop == Some(StopReason::Breakpoint(ret)) {
            // the return and its delay slot
            let start = self.cpu.cycles;
            self.step();
            let stop = self.step();
            result.cycles += self.cpu.cycles.wrapping_sub(start);
            result.stop = Some(stop);
        }
        Ok(result)
    }

    /// Run until execution reaches `address`
    pub fn run_to(&mut self, address: u32, max_cycles: u64) -> RunResult {
        self.debugger.set_transient(address);
        self.continue_from_pause();
        let result = self.run(max_cycles);
        self.debugger.clear_transient();
        result
    }

    /// Leave a breakpoint or step pause. The instruction at the current pc
    /// runs without stopping again.
    pub fn resume(&mut self) -> Result<()> {
        if self.state == ControllerState::Running {
            return Err(PsxError::NotPaused);
        }
        self.continue_from_pause();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, ControllerState::PausedAtBreakpoint(_))
    }

    pub fn disassemble(&self, address: u32, count: usize) -> Vec<DisassembledInstruction> {
        debugger::disassemble_range(&self.bus, address, count)
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn stats(&self) -> PerformanceSnapshot {
        self.monitor.snapshot()
    }

    pub fn run_stats(&self) -> RunStats {
        self.monitor.run_stats()
    }

    pub fn reset_stats(&mut self) {
        self.monitor.reset();
    }

    // ------------------------------------------------------------------
    // Save states
    // ------------------------------------------------------------------

    pub fn save_state(&mut self) -> SaveState {
        SaveState::capture(&mut self.cpu, &self.bus)
    }

    pub fn load_state(&mut self, state: &SaveState) -> Result<()> {
        state.apply(&mut self.cpu, &mut self.bus)?;
        self.config.icache_emulation = state.icache_emulation;
        if state.needs_block_invalidation {
            self.flush();
        }
        self.state = ControllerState::Running;
        Ok(())
    }

    pub fn save_state_to_file(&mut self, path: &Path) -> Result<()> {
        self.save_state().save_to_file(path)
    }

    pub fn load_state_from_file(&mut self, path: &Path) -> Result<()> {
        let state = SaveState::load_from_file(path)?;
        self.load_state(&state)
    }

    // ------------------------------------------------------------------

    fn single_step(&mut self) -> RunResult {
        let start = self.cpu.cycles;
        let stop = self.step();
        RunResult {
            cycles: self.cpu.cycles.wrapping_sub(start),
            stop: Some(stop),
        }
    }

    fn continue_from_pause(&mut self) {
        if self.state != ControllerState::Running {
            self.debugger.resume_from(self.cpu.regs.pc);
            self.state = ControllerState::Running;
        }
    }

    fn service_boundary(&mut self) {
        if let Some(exception) = self.cpu.service_boundary(&self.bus) {
            self.monitor.exception(exception == Exception::Interrupt);
        }
    }

    /// Apply pending `ControlHandle` requests
    fn apply_requests(&mut self) -> Option<StopReason> {
        if self.flags.flush.swap(false, Ordering::AcqRel) {
            self.flush();
        }
        match self.flags.icache.swap(ICACHE_UNCHANGED, Ordering::AcqRel) {
            ICACHE_ENABLE => self.set_icache_emulation(true),
            ICACHE_DISABLE => self.set_icache_emulation(false),
            _ => {}
        }
        if self.flags.stop.swap(false, Ordering::AcqRel) {
            return Some(StopReason::StopRequested);
        }
        None
    }

    /// One block with the active engine, or one instruction when a stop
    /// could happen inside the block
    fn execute_unit(&mut self) {
        let pc = self.cpu.regs.pc;
        let window = (self.config.max_block_instructions as u32 + 1) * 4;
        let single = self.debugger.has_watchpoints()
            || (self.debugger.is_active() && self.debugger.breakpoint_in_range(pc, window));

        if single {
            let cycles = self.cpu.step(&mut self.bus);
            self.monitor
                .record_block(ExecutionMode::Interpreter, 1, cycles as u64);
        } else {
            self.engine
                .run_block(&mut self.cpu, &mut self.bus, &mut self.monitor);
        }
    }

    fn drain_code_writes(&mut self) {
        if !self.bus.has_code_writes() {
            return;
        }
        for write in self.bus.take_code_writes() {
            let removed = self.engine.invalidate(&mut self.bus, write);
            if removed > 0 {
                self.monitor.blocks_invalidated(removed);
            }
        }
    }
}

/// Engine for `config.execution_mode`. A recompiler that fails to start
/// is replaced by the cached interpreter and the config updated.
fn create_engine(config: &mut CpuConfig) -> Box<dyn ExecutionEngine> {
    match config.execution_mode {
        ExecutionMode::Interpreter => Box::new(Interpreter),
        ExecutionMode::CachedInterpreter => {
            Box::new(CachedInterpreter::new(config.max_block_instructions))
        }
        ExecutionMode::Recompiler => match Recompiler::new(config) {
            Ok(recompiler) => Box::new(recompiler),
            Err(e) => {
                warn!("Recompiler unavailable ({}), using the cached interpreter", e);
                config.execution_mode = ExecutionMode::CachedInterpreter;
                Box::new(CachedInterpreter::new(config.max_block_instructions))
            }
        },
    }
}
