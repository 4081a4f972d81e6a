//! MIPS R3000A CPU core
//!
//! Three interchangeable execution engines (interpreter, cached
//! interpreter, Cranelift recompiler) over one memory access layer with
//! optional fastmem, an ICache model, exception delivery, save states and a
//! debugger. `system::CpuCore` ties them together.

#[macro_use]
extern crate log;

pub mod config;
pub mod debugger;
pub mod error;
pub mod performance_monitor;
pub mod psx;
pub mod save_state;
pub mod system;

#[cfg(test)]
mod tests;

pub use config::{CpuConfig, ExecutionMode, FastmemMode};
pub use error::{PsxError, Result};
pub use system::{ControlHandle, CpuCore, RunResult};

include!(concat!(env!("OUT_DIR"), "/version.rs"));
