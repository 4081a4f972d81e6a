// Execution statistics for the CPU core
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::ExecutionMode;

const SAMPLE_WINDOW_SIZE: usize = 120; // Keep the last 120 run slices

/// Work done by one engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub instructions: u64,
    pub cycles: u64,
    pub blocks: u64,
}

/// Counter values at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub interpreter: EngineCounters,
    pub cached_interpreter: EngineCounters,
    pub recompiler: EngineCounters,
    pub blocks_built: u64,
    pub blocks_compiled: u64,
    pub block_cache_hits: u64,
    pub blocks_invalidated: u64,
    pub block_cache_flushes: u64,
    pub recompiler_fallbacks: u64,
    pub fastmem_faults: u64,
    pub code_buffer_resets: u64,
    pub exceptions: u64,
    pub interrupts: u64,
}

impl PerformanceSnapshot {
    pub fn total_instructions(&self) -> u64 {
        self.interpreter.instructions
            + self.cached_interpreter.instructions
            + self.recompiler.instructions
    }

    pub fn total_cycles(&self) -> u64 {
        self.interpreter.cycles + self.cached_interpreter.cycles + self.recompiler.cycles
    }
}

impl fmt::Display for PerformanceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "instructions: {} (interp {}, cached {}, jit {})",
            self.total_instructions(),
            self.interpreter.instructions,
            self.cached_interpreter.instructions,
            self.recompiler.instructions
        )?;
        writeln!(
            f,
            "blocks: built {} compiled {} hits {} invalidated {} flushes {}",
            self.blocks_built,
            self.blocks_compiled,
            self.block_cache_hits,
            self.blocks_invalidated,
            self.block_cache_flushes
        )?;
        write!(
            f,
            "fallbacks {} fastmem faults {} code buffer resets {} exceptions {} interrupts {}",
            self.recompiler_fallbacks,
            self.fastmem_faults,
            self.code_buffer_resets,
            self.exceptions,
            self.interrupts
        )
    }
}

/// Host time spent in `run` slices
#[derive(Debug, Clone)]
pub struct RunStats {
    pub min_time: Duration,
    pub max_time: Duration,
    pub avg_time: Duration,
    pub percentile_95: Duration,
    /// Emulated instructions per host second over the window
    pub host_mips: f64,
}

/// Performance monitor for the execution engines
pub struct PerformanceMonitor {
    counters: PerformanceSnapshot,
    slice_start: Option<(Instant, u64)>,
    slices: VecDeque<(Duration, u64)>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        PerformanceMonitor {
            counters: PerformanceSnapshot::default(),
            slice_start: None,
            slices: VecDeque::with_capacity(SAMPLE_WINDOW_SIZE),
        }
    }

    fn engine(&mut self, mode: ExecutionMode) -> &mut EngineCounters {
        match mode {
            ExecutionMode::Interpreter => &mut self.counters.interpreter,
            ExecutionMode::CachedInterpreter => &mut self.counters.cached_interpreter,
            ExecutionMode::Recompiler => &mut self.counters.recompiler,
        }
    }

    /// Account a block (or single step) run by `mode`
    pub fn record_block(&mut self, mode: ExecutionMode, instructions: u64, cycles: u64) {
        let engine = self.engine(mode);
        engine.instructions = engine.instructions.wrapping_add(instructions);
        engine.cycles = engine.cycles.wrapping_add(cycles);
        engine.blocks += 1;
    }

    pub fn block_built(&mut self) {
        self.counters.blocks_built += 1;
    }

    pub fn block_compiled(&mut self) {
        self.counters.blocks_compiled += 1;
    }

    pub fn block_cache_hit(&mut self) {
        self.counters.block_cache_hits += 1;
    }

    pub fn blocks_invalidated(&mut self, count: usize) {
        self.counters.blocks_invalidated += count as u64;
    }

    pub fn block_cache_flushed(&mut self) {
        self.counters.block_cache_flushes += 1;
    }

    pub fn recompiler_fallback(&mut self) {
        self.counters.recompiler_fallbacks += 1;
    }

    pub fn fastmem_fault(&mut self) {
        self.counters.fastmem_faults += 1;
    }

    pub fn code_buffer_reset(&mut self) {
        self.counters.code_buffer_resets += 1;
    }

    pub fn exception(&mut self, interrupt: bool) {
        if interrupt {
            self.counters.interrupts += 1;
        } else {
            self.counters.exceptions += 1;
        }
    }

    /// Start timing a `run` slice
    pub fn begin_slice(&mut self) {
        self.slice_start = Some((Instant::now(), self.counters.total_instructions()));
    }

    /// End slice timing
    pub fn end_slice(&mut self) {
        if let Some((start, instructions)) = self.slice_start.take() {
            if self.slices.len() >= SAMPLE_WINDOW_SIZE {
                self.slices.pop_front();
            }
            let executed = self.counters.total_instructions() - instructions;
            self.slices.push_back((start.elapsed(), executed));
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.counters.clone()
    }

    /// Get run slice statistics
    pub fn run_stats(&self) -> RunStats {
        if self.slices.is_empty() {
            return RunStats {
                min_time: Duration::ZERO,
                max_time: Duration::ZERO,
                avg_time: Duration::ZERO,
                percentile_95: Duration::ZERO,
                host_mips: 0.0,
            };
        }

        let mut sorted_times: Vec<Duration> = self.slices.iter().map(|(t, _)| *t).collect();
        sorted_times.sort();

        let sum: Duration = sorted_times.iter().sum();
        let instructions: u64 = self.slices.iter().map(|(_, n)| *n).sum();
        let p95_index = (sorted_times.len() as f64 * 0.95) as usize;

        RunStats {
            min_time: sorted_times[0],
            max_time: sorted_times[sorted_times.len() - 1],
            avg_time: sum / sorted_times.len() as u32,
            percentile_95: sorted_times[p95_index.min(sorted_times.len() - 1)],
            host_mips: if sum.as_secs_f64() > 0.0 {
                instructions as f64 / sum.as_secs_f64() / 1_000_000.0
            } else {
                0.0
            },
        }
    }

    /// Clear all counters and history
    pub fn reset(&mut self) {
        self.counters = PerformanceSnapshot::default();
        self.slice_start = None;
        self.slices.clear();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
