//! Calls from recompiled code back into Rust
//!
//! Generated code passes a `Runtime` pointer to every memory thunk. The
//! guest registers are flushed before any call that can fail, so a thunk
//! sees `regs.pc` at the instruction doing the access.
//!
//! Status values: `OK` continues the block, `REEXECUTE` makes the block
//! return so the interpreter runs the instruction again. Memory thunks that
//! return a value pack the status into the upper 32 bits.

use std::ptr;

use crate::psx::bus::Bus;
use crate::psx::cpu::exception::{Exception, PendingException};
use crate::psx::cpu::interpreter::{divide_signed, divide_unsigned, merge_swl, merge_swr};
use crate::psx::cpu::Cpu;
use crate::psx::AccessWidth;

pub const OK: u32 = 0;
pub const REEXECUTE: u32 = 1;

/// Context shared between the dispatcher and a running block. Generated
/// code reads the table pointers by offset.
#[repr(C)]
pub struct Runtime {
    pub cpu: *mut Cpu,
    pub bus: *mut Bus,
    pub lut_read: *const usize,
    pub lut_write: *const usize,
    pub fastmem_base: *mut u8,
    /// Instructions completed before the current exit point
    pub instructions: u32,
    pub exit: u32,
    /// Non zero: bus errors make the instruction re-execute
    pub memory_exceptions: u32,
}

impl Runtime {
    pub fn new(cpu: *mut Cpu, bus: &mut Bus, memory_exceptions: bool) -> Self {
        let (lut_read, lut_write) = bus
            .lut_tables()
            .unwrap_or((ptr::null(), ptr::null()));
        let fastmem_base = bus.fastmem_base().unwrap_or(ptr::null_mut());
        Runtime {
            cpu,
            bus: bus as *mut Bus,
            lut_read,
            lut_write,
            fastmem_base,
            instructions: 0,
            exit: OK,
            memory_exceptions: memory_exceptions as u32,
        }
    }
}

/// Record a bus error to be delivered after the block
fn defer_bus_error(cpu: &mut Cpu) {
    let regs = &cpu.regs;
    cpu.raise_at(PendingException {
        exception: Exception::DataBusError,
        pc: regs.pc,
        in_delay_slot: regs.branch_pending,
        branch_taken: regs.branch_pending && regs.branch_taken,
        bad_vaddr: None,
        coprocessor: 0,
    });
}

#[inline(always)]
fn pack(value: u32, status: u32) -> u64 {
    value as u64 | ((status as u64) << 32)
}

fn read(runtime: *mut Runtime, addr: u32, width: AccessWidth) -> u64 {
    // SAFETY: `runtime` is the live context created by the dispatcher for
    // this block, its pointers come from the `&mut` it holds
    let rt = unsafe { &mut *runtime };
    let bus = unsafe { &mut *rt.bus };
    match bus.read(addr, width) {
        Ok(value) => pack(value & width.value_mask(), OK),
        Err(_) if rt.memory_exceptions != 0 => pack(0, REEXECUTE),
        Err(_) => {
            // SAFETY: as above
            defer_bus_error(unsafe { &mut *rt.cpu });
            pack(0, OK)
        }
    }
}

fn write(runtime: *mut Runtime, addr: u32, width: AccessWidth, value: u32) -> u32 {
    // SAFETY: see `read`
    let rt = unsafe { &mut *runtime };
    let bus = unsafe { &mut *rt.bus };
    // Stores to code go through the interpreter so the block ends right
    // after them
    if bus.is_code_address(addr) {
        return REEXECUTE;
    }
    match bus.write(addr, width, value) {
        Ok(()) => OK,
        Err(_) if rt.memory_exceptions != 0 => REEXECUTE,
        Err(_) => {
            // SAFETY: as above
            defer_bus_error(unsafe { &mut *rt.cpu });
            OK
        }
    }
}

/// SWL/SWR: read-modify-write of the aligned word
fn write_partial(
    runtime: *mut Runtime,
    addr: u32,
    value: u32,
    merge: fn(u32, u32, u32) -> u32,
) -> u32 {
    let aligned = addr & !3;
    // SAFETY: see `read`
    let bus = unsafe { &mut *(*runtime).bus };
    if bus.is_code_address(aligned) {
        return REEXECUTE;
    }
    let current = read(runtime, aligned, AccessWidth::Word);
    if current >> 32 != OK as u64 {
        return REEXECUTE;
    }
    write(runtime, aligned, AccessWidth::Word, merge(current as u32, value, addr))
}

pub extern "C" fn read_byte(runtime: *mut Runtime, addr: u32) -> u64 {
    read(runtime, addr, AccessWidth::Byte)
}

pub extern "C" fn read_half(runtime: *mut Runtime, addr: u32) -> u64 {
    read(runtime, addr, AccessWidth::HalfWord)
}

pub extern "C" fn read_word(runtime: *mut Runtime, addr: u32) -> u64 {
    read(runtime, addr, AccessWidth::Word)
}

pub extern "C" fn write_byte(runtime: *mut Runtime, addr: u32, value: u32) -> u32 {
    write(runtime, addr, AccessWidth::Byte, value)
}

pub extern "C" fn write_half(runtime: *mut Runtime, addr: u32, value: u32) -> u32 {
    write(runtime, addr, AccessWidth::HalfWord, value)
}

pub extern "C" fn write_word(runtime: *mut Runtime, addr: u32, value: u32) -> u32 {
    write(runtime, addr, AccessWidth::Word, value)
}

pub extern "C" fn write_word_left(runtime: *mut Runtime, addr: u32, value: u32) -> u32 {
    write_partial(runtime, addr, value, merge_swl)
}

pub extern "C" fn write_word_right(runtime: *mut Runtime, addr: u32, value: u32) -> u32 {
    write_partial(runtime, addr, value, merge_swr)
}

/// MFC0. Unusable coprocessor and unknown registers re-execute to raise
/// the exception.
pub extern "C" fn move_from_cop0(runtime: *mut Runtime, index: u32) -> u64 {
    // SAFETY: see `read`
    let cpu = unsafe { &mut *(*runtime).cpu };
    if !cpu.cop0.coprocessor_enabled(0) {
        return pack(0, REEXECUTE);
    }
    match cpu.cop0.read(index as u8) {
        Some(value) => pack(value, OK),
        None => pack(0, REEXECUTE),
    }
}

/// DIV, returns `lo | hi << 32`
pub extern "C" fn divide(dividend: u32, divisor: u32) -> u64 {
    let (lo, hi) = divide_signed(dividend, divisor);
    pack(lo, hi)
}

pub extern "C" fn divide_u(dividend: u32, divisor: u32) -> u64 {
    let (lo, hi) = divide_unsigned(dividend, divisor);
    pack(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psx::bus::NullPeripherals;
    use crate::psx::cpu::cop2::RegisterFileCop2;

    fn with_runtime<R>(
        memory_exceptions: bool,
        f: impl FnOnce(*mut Runtime, &mut Cpu) -> R,
    ) -> R {
        let mut bus = Bus::new(Box::new(NullPeripherals));
        let mut cpu = Cpu::new(Box::new(RegisterFileCop2::new()));
        let cpu_ptr: *mut Cpu = &mut cpu;
        let mut runtime = Runtime::new(cpu_ptr, &mut bus, memory_exceptions);
        f(&mut runtime, unsafe { &mut *cpu_ptr })
    }

    #[test]
    fn test_read_write_round_trip_through_bus() {
        with_runtime(true, |rt, _| {
            assert_eq!(write_half(rt, 0x80000100, 0xbeef), OK);
            assert_eq!(read_half(rt, 0x00000100), 0xbeef);
            assert_eq!(read_byte(rt, 0xa0000101), 0xbe);
        });
    }

    #[test]
    fn test_bus_error_reexecutes_or_defers() {
        with_runtime(true, |rt, cpu| {
            assert_eq!(read_word(rt, 0x1f900000) >> 32, REEXECUTE as u64);
            assert!(cpu.pending_exception().is_none());
        });
        with_runtime(false, |rt, cpu| {
            cpu.regs.pc = 0x80001234;
            assert_eq!(write_word(rt, 0x1f900000, 1), OK);
            let pending = cpu.pending_exception().unwrap();
            assert_eq!(pending.exception, Exception::DataBusError);
            assert_eq!(pending.pc, 0x80001234);
        });
    }

    #[test]
    fn test_code_page_store_reexecutes() {
        with_runtime(true, |rt, _| {
            // SAFETY: test owns the runtime
            let bus = unsafe { &mut *(*rt).bus };
            bus.add_code_range(0x80002000, 16);
            assert_eq!(write_word(rt, 0x80002ff0, 1), REEXECUTE);
            assert_eq!(write_word_left(rt, 0x80002ff1, 1), REEXECUTE);
            assert!(!bus.has_code_writes());
        });
    }

    #[test]
    fn test_partial_store_merges() {
        with_runtime(true, |rt, _| {
            write_word(rt, 0x80000200, 0xaabbccdd);
            assert_eq!(write_word_right(rt, 0x80000201, 0x11223344), OK);
            assert_eq!(read_word(rt, 0x80000200) as u32, merge_swr(0xaabbccdd, 0x11223344, 1));
        });
    }
}
