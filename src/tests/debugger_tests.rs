// Breakpoints, stepping and watchpoints driven through CpuCore

use super::{asm, at, new_core, start, ALL_MODES};
use crate::config::{ExecutionMode, FastmemMode};
use crate::debugger::{StopReason, WatchKind};
use crate::error::PsxError;
use crate::psx::cpu::exception::{ControllerState, Exception};
use crate::system::CpuCore;

const DONE: u32 = 0x8000_8000;
const FAR: u32 = 0x8000_6000;

fn core_with(mode: ExecutionMode, program: &[u32]) -> CpuCore {
    let mut core = new_core(mode, FastmemMode::Lut);
    asm::load(core.bus_mut(), DONE, &[asm::j(DONE), asm::nop()]);
    start(&mut core, program);
    core
}

/// Main program calling a function at 8 that returns `2 * ($a0 + 1)`
fn call_program() -> Vec<u32> {
    vec![
        asm::addiu(4, 0, 7),
        asm::jal(at(8)),
        asm::nop(),
        asm::addu(6, 2, 0),
        asm::j(DONE),
        asm::nop(),
        asm::nop(),
        asm::nop(),
        // function
        asm::addiu(2, 4, 1),
        asm::addu(2, 2, 2),
        asm::jr(31),
        asm::nop(),
    ]
}

#[test]
fn test_breakpoint_stops_before_instruction() {
    for mode in ALL_MODES {
        let mut core = core_with(
            mode,
            &[
                asm::addiu(8, 0, 20),
                // loop a while so whole blocks run first
                asm::addiu(8, 8, -1),
                asm::bne(8, 0, -2),
                asm::nop(),
                asm::j(FAR),
                asm::nop(),
            ],
        );
        asm::load(
            core.bus_mut(),
            FAR,
            &[
                asm::addiu(8, 0, 1),
                asm::addiu(9, 0, 1),
                asm::j(DONE),
                asm::nop(),
            ],
        );
        core.debugger_mut().add_breakpoint(FAR + 4).unwrap();

        let result = core.run(100_000);
        assert_eq!(result.stop, Some(StopReason::Breakpoint(FAR + 4)), "{:?}", mode);
        assert_eq!(core.cpu().regs.pc, FAR + 4);
        assert_eq!(core.cpu().regs.gpr[8], 1);
        assert_eq!(core.cpu().regs.gpr[9], 0);
        assert_eq!(
            core.controller_state(),
            ControllerState::PausedAtBreakpoint(FAR + 4)
        );
        assert_eq!(core.debugger().breakpoint(FAR + 4).unwrap().hit_count, 1);

        // paused: nothing runs until resumed
        assert_eq!(core.run(1_000).stop, Some(StopReason::Paused));
        assert_eq!(core.cpu().regs.gpr[9], 0);

        core.resume().unwrap();
        let result = core.run_to(DONE, 100_000);
        assert_eq!(result.stop, Some(StopReason::Breakpoint(DONE)));
        assert_eq!(core.cpu().regs.gpr[9], 1);

        if mode == ExecutionMode::Recompiler {
            assert!(core.stats().blocks_compiled > 0);
        }
    }
}

#[test]
fn test_disabled_breakpoint_does_not_stop() {
    let mut core = core_with(
        ExecutionMode::CachedInterpreter,
        &[asm::addiu(8, 0, 1), asm::addiu(9, 0, 1), asm::j(DONE), asm::nop()],
    );
    let debugger = core.debugger_mut();
    debugger.add_breakpoint(at(1)).unwrap();
    assert!(!debugger.toggle_breakpoint(at(1)).unwrap());
    assert!(matches!(
        debugger.add_breakpoint(at(1)),
        Err(PsxError::DuplicateBreakpoint(_))
    ));

    let result = core.run_to(DONE, 10_000);
    assert_eq!(result.stop, Some(StopReason::Breakpoint(DONE)));
    assert_eq!(core.cpu().regs.gpr[9], 1);
}

#[test]
fn test_step_uses_interpreter() {
    let mut core = core_with(ExecutionMode::Recompiler, &call_program());
    assert_eq!(core.step(), StopReason::Step(at(1)));
    assert_eq!(core.cpu().regs.gpr[4], 7);
    assert_eq!(core.controller_state(), ControllerState::Stepping);
    assert_eq!(core.stats().interpreter.instructions, 1);
    assert_eq!(core.stats().recompiler.instructions, 0);
}

#[test]
fn test_step_over_call() {
    let mut core = core_with(ExecutionMode::Recompiler, &call_program());
    let result = core.run_to(at(1), 1_000);
    assert_eq!(result.stop, Some(StopReason::Breakpoint(at(1))));

    let result = core.step_over(10_000);
    assert_eq!(result.stop, Some(StopReason::Breakpoint(at(3))));
    assert_eq!(core.cpu().regs.pc, at(3));
    assert_eq!(core.cpu().regs.gpr[2], 16);
    assert_eq!(core.cpu().regs.gpr[6], 0);
    assert_eq!(core.debugger().transient(), None);

    // not a call: a single step
    let result = core.step_over(10_000);
    assert_eq!(result.stop, Some(StopReason::Step(at(4))));
    assert_eq!(core.cpu().regs.gpr[6], 16);
}

#[test]
fn test_step_out_returns_to_caller() {
    let mut core = core_with(ExecutionMode::CachedInterpreter, &call_program());
    core.run_to(at(8), 1_000);

    let result = core.step_out(10_000).unwrap();
    assert_eq!(result.stop, Some(StopReason::Step(at(3))));
    assert_eq!(core.cpu().regs.pc, at(3));
    assert_eq!(core.cpu().regs.gpr[2], 16);
}

#[test]
fn test_step_out_outside_function() {
    let mut core = core_with(ExecutionMode::Interpreter, &[]);
    // nothing but zero words from here on
    core.cpu_mut().regs.jump_to(0x8010_0000);
    let pc = core.cpu().regs.pc;
    assert!(matches!(
        core.step_out(1_000),
        Err(PsxError::NotInFunction(addr)) if addr == pc
    ));
    assert_eq!(core.cpu().regs.pc, pc);
}

#[test]
fn test_write_watchpoint_pauses_before_store() {
    let mut core = core_with(
        ExecutionMode::Recompiler,
        &[
            asm::lui(10, 0x8000),
            asm::ori(10, 10, 0x2000),
            asm::addiu(8, 0, 5),
            asm::sb(8, 10, 2),
            asm::addiu(9, 0, 1),
            asm::j(DONE),
            asm::nop(),
        ],
    );
    core.debugger_mut()
        .add_watchpoint(0x8000_2000, WatchKind::Write)
        .unwrap();
    core.debugger_mut()
        .add_watchpoint(0x8000_2002, WatchKind::Read)
        .unwrap();
    core.debugger_mut()
        .add_watchpoint(0x8000_2002, WatchKind::Write)
        .unwrap();

    let result = core.run(10_000);
    assert_eq!(
        result.stop,
        Some(StopReason::Watchpoint {
            pc: at(3),
            address: 0x8000_2002,
            kind: WatchKind::Write,
        })
    );
    assert_eq!(core.bus().ram()[0x2002], 0);

    core.resume().unwrap();
    let result = core.run_to(DONE, 10_000);
    assert_eq!(result.stop, Some(StopReason::Breakpoint(DONE)));
    assert_eq!(core.bus().ram()[0x2002], 5);
    assert_eq!(core.cpu().regs.gpr[9], 1);
}

#[test]
fn test_pending_exception_state() {
    let mut core = core_with(ExecutionMode::Interpreter, &[asm::syscall(), asm::nop()]);
    core.step();
    assert!(matches!(core.resume(), Ok(())));
    assert_eq!(
        core.controller_state(),
        ControllerState::ExceptionPending(Exception::Syscall)
    );
    core.step();
    assert_eq!(core.controller_state(), ControllerState::Stepping);
    assert_eq!(core.cpu().cop0.epc, at(0));
}

#[test]
fn test_disassemble_listing() {
    let core = core_with(ExecutionMode::Interpreter, &call_program());
    let listing = core.disassemble(at(0), 3);
    assert_eq!(listing.len(), 3);
    assert_eq!(listing[0].address, at(0));
    assert_eq!(listing[0].text, "LI $a0, 0x7");
    assert!(listing[1].text.starts_with("JAL"));
    assert_eq!(listing[2].text, "NOP");
}
