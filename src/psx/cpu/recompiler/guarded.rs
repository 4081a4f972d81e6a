//! Entering recompiled code with fastmem fault recovery
//!
//! Blocks lowered for the MMap arena access guest memory with plain host
//! loads and stores. Before calling one, the callee saved registers, the
//! stack pointer and a resume address are stored in a `HostContext`. A
//! fault inside the arena makes the signal handler restore them and resume
//! with `rax = 1`, as if the block had returned "faulted".

use super::code_buffer::BlockFn;
use super::thunks::Runtime;
use crate::psx::bus::fault_handler::{self, HostContext};
use crate::psx::cpu::registers::Registers;

/// Run `entry`. With `arena`, faults inside that host range are recovered
/// and the faulting host address is returned; the guest state is then the
/// one flushed before the faulting access.
///
/// # Safety
///
/// `regs` and `runtime` must be valid for the whole call and `entry` must
/// come from the live code buffer.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub unsafe fn call(
    entry: BlockFn,
    regs: *mut Registers,
    runtime: *mut Runtime,
    arena: Option<(usize, usize)>,
) -> Option<usize> {
    let Some((arena_start, arena_end)) = arena else {
        entry(regs, runtime);
        return None;
    };

    let mut ctx = HostContext {
        arena_start,
        arena_end,
        ..HostContext::default()
    };
    let _scope = fault_handler::enter(&mut ctx);
    let ctx_ptr: *mut HostContext = &mut ctx;
    let faulted: u64;

    std::arch::asm!(
        "mov [{ctx}], rbx",
        "mov [{ctx} + 8], rbp",
        "mov [{ctx} + 16], r12",
        "mov [{ctx} + 24], r13",
        "mov [{ctx} + 32], r14",
        "mov [{ctx} + 40], r15",
        "lea rax, [rip + 2f]",
        "mov [{ctx} + 56], rax",
        "mov [{ctx} + 48], rsp",
        "call {entry}",
        "xor eax, eax",
        "2:",
        ctx = in(reg) ctx_ptr,
        entry = in(reg) entry as usize,
        in("rdi") regs,
        in("rsi") runtime,
        out("rax") faulted,
        clobber_abi("C"),
    );

    // written by the signal handler behind the compiler's back
    (faulted != 0).then(|| std::ptr::read_volatile(std::ptr::addr_of!((*ctx_ptr).fault_address)))
}

/// # Safety
///
/// See the x86_64 Linux version. Without fault recovery the recompiler
/// never lowers for the MMap arena, so `arena` is always `None` here.
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub unsafe fn call(
    entry: BlockFn,
    regs: *mut Registers,
    runtime: *mut Runtime,
    _arena: Option<(usize, usize)>,
) -> Option<usize> {
    entry(regs, runtime);
    None
}
