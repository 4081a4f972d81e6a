// Test suites exercising the CPU core across modules

use crate::config::{CpuConfig, ExecutionMode, FastmemMode};
use crate::psx::bus::{NullPeripherals, Peripherals};
use crate::psx::cpu::cop2::RegisterFileCop2;
use crate::system::CpuCore;

#[cfg(test)]
pub mod asm;


#[cfg(test)]
mod save_state_tests;

#[cfg(test)]
mod debugger_tests;

#[cfg(test)]
mod fastmem_tests;




#[cfg(test)]
mod default_config_tests;

#[cfg(test)]
mod interrupt_tests;

/// Where test programs are loaded
pub const PROGRAM_BASE: u32 = 0x8000_1000;

pub const ALL_MODES: [ExecutionMode; 3] = [
    ExecutionMode::Interpreter,
    ExecutionMode::CachedInterpreter,
    ExecutionMode::Recompiler,
];

pub const ALL_FASTMEM: [FastmemMode; 3] =
    [FastmemMode::Disabled, FastmemMode::Lut, FastmemMode::Mmap];

/// Core with precise memory exceptions in every engine
pub fn new_core(mode: ExecutionMode, fastmem: FastmemMode) -> CpuCore {
    let config = CpuConfig {
        memory_exceptions: true,
        code_buffer_size: 1 << 20,
        ..default_config(mode, fastmem)
    };
    new_core_with(config, Box::new(NullPeripherals))
}

/// Shipped defaults, only the engine and fastmem strategy picked
pub fn default_config(mode: ExecutionMode, fastmem: FastmemMode) -> CpuConfig {
    CpuConfig {
        execution_mode: mode,
        fastmem_mode: fastmem,
        ..CpuConfig::default()
    }
}

pub fn new_core_with(config: CpuConfig, peripherals: Box<dyn Peripherals>) -> CpuCore {
    CpuCore::new(config, peripherals, Box::new(RegisterFileCop2::new())).unwrap()
}

/// Load `program` at `PROGRAM_BASE` and point the CPU at it
pub fn start(core: &mut CpuCore, program: &[u32]) {
    asm::load(core.bus_mut(), PROGRAM_BASE, program);
    core.cpu_mut().regs.jump_to(PROGRAM_BASE);
}

/// Address of instruction `index` of a program loaded by `start`
pub fn at(index: u32) -> u32 {
    PROGRAM_BASE + index * 4
}
