// External interrupt delivery through the Peripherals interrupt line

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{asm, at, default_config, new_core_with, start, ALL_MODES};
use crate::config::{ExecutionMode, FastmemMode};
use crate::debugger::StopReason;
use crate::psx::bus::{BusError, Peripherals};
use crate::psx::memory_map::EXCEPTION_VECTOR_ROM;
use crate::psx::AccessWidth;
use crate::system::CpuCore;

const DONE: u32 = 0x8000_8000;

const CAUSE_IP2: u32 = 1 << 10;

/// Open bus with an interrupt request line the test drives
struct IrqLine(Arc<AtomicBool>);

impl Peripherals for IrqLine {
    fn read(&mut self, _addr: u32, _width: AccessWidth) -> Result<u32, BusError> {
        Ok(0)
    }

    fn write(&mut self, _addr: u32, _width: AccessWidth, _value: u32) -> Result<(), BusError> {
        Ok(())
    }

    fn interrupt_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

fn core_with_line(mode: ExecutionMode, asserted: bool) -> (CpuCore, Arc<AtomicBool>) {
    let line = Arc::new(AtomicBool::new(asserted));
    let mut core = new_core_with(
        default_config(mode, FastmemMode::Lut),
        Box::new(IrqLine(line.clone())),
    );
    asm::load(core.bus_mut(), DONE, &[asm::j(DONE), asm::nop()]);
    (core, line)
}

/// Sets SR to BEV plus `low`, then runs a few instructions
fn enable_program(low: u16) -> Vec<u32> {
    vec![
        asm::lui(8, 0x0040),
        asm::ori(8, 8, low),
        asm::mtc0(8, 12),
        asm::addiu(9, 0, 1),
        asm::addiu(10, 0, 2),
        asm::j(DONE),
        asm::nop(),
    ]
}

#[test]
fn test_unmasked_interrupt_is_taken_after_mtc0() {
    for mode in ALL_MODES {
        let (mut core, _line) = core_with_line(mode, true);
        // IM2 | IEc
        start(&mut core, &enable_program(0x0401));
        let result = core.run_to(EXCEPTION_VECTOR_ROM, 10_000);
        assert_eq!(
            result.stop,
            Some(StopReason::Breakpoint(EXCEPTION_VECTOR_ROM)),
            "{:?}",
            mode
        );

        let cop0 = &core.cpu().cop0;
        assert_eq!((cop0.cause >> 2) & 0x1f, 0, "{:?}", mode);
        assert_ne!(cop0.cause & CAUSE_IP2, 0);
        assert_eq!(cop0.cause >> 31, 0);
        assert_eq!(cop0.epc, at(3), "{:?}", mode);
        // interrupt enable pushed down the mode stack
        assert_eq!(cop0.sr, 0x0040_0404);
        assert_eq!(core.cpu().regs.gpr[9], 0);
        assert_eq!(core.stats().interrupts, 1);
    }
}

#[test]
fn test_masked_interrupt_is_not_taken() {
    // IM2 without IEc, then IEc without IM2
    for low in [0x0400, 0x0001] {
        for mode in ALL_MODES {
            let (mut core, _line) = core_with_line(mode, true);
            start(&mut core, &enable_program(low));
            let result = core.run_to(DONE, 10_000);
            assert_eq!(result.stop, Some(StopReason::Breakpoint(DONE)), "{:?}", mode);

            let cpu = core.cpu();
            // the request stays visible in CAUSE
            assert_ne!(cpu.cop0.cause & CAUSE_IP2, 0);
            assert_eq!(cpu.regs.gpr[9], 1);
            assert_eq!(cpu.regs.gpr[10], 2);
            assert_eq!(core.stats().interrupts, 0);
        }
    }
}

#[test]
fn test_released_line_is_not_taken() {
    for mode in ALL_MODES {
        let (mut core, _line) = core_with_line(mode, false);
        start(&mut core, &enable_program(0x0401));
        let result = core.run_to(DONE, 10_000);
        assert_eq!(result.stop, Some(StopReason::Breakpoint(DONE)), "{:?}", mode);
        assert_eq!(core.cpu().cop0.cause & CAUSE_IP2, 0);
        assert_eq!(core.stats().exceptions, 0);
    }
}

#[test]
fn test_interrupt_in_delay_slot_points_at_branch() {
    let program = [
        asm::lui(8, 0x0040),
        asm::ori(8, 8, 0x0401),
        asm::mtc0(8, 12),
        asm::addiu(10, 0, 7),
        asm::beq(0, 0, 2),
        asm::addiu(9, 0, 1),
        asm::nop(),
        asm::j(DONE),
        asm::nop(),
    ];

    for mode in ALL_MODES {
        let (mut core, line) = core_with_line(mode, false);
        start(&mut core, &program);
        let result = core.run_to(at(4), 10_000);
        assert_eq!(result.stop, Some(StopReason::Breakpoint(at(4))), "{:?}", mode);

        // the branch runs, its delay slot has not
        core.step();
        assert!(core.cpu().regs.branch_pending);
        line.store(true, Ordering::Release);

        let result = core.run_to(EXCEPTION_VECTOR_ROM, 10_000);
        assert_eq!(
            result.stop,
            Some(StopReason::Breakpoint(EXCEPTION_VECTOR_ROM)),
            "{:?}",
            mode
        );

        let cpu = core.cpu();
        assert_eq!((cpu.cop0.cause >> 2) & 0x1f, 0);
        // BD and BT
        assert_eq!(cpu.cop0.cause >> 30, 0b11, "{:?}", mode);
        assert_eq!(cpu.cop0.epc, at(4), "{:?}", mode);
        assert_eq!(cpu.regs.gpr[9], 0);
        assert_eq!(cpu.regs.gpr[10], 7);
    }
}

#[test]
fn test_handler_return_resumes_after_interrupt() {
    // Masks IM2, clears the stacked enables and returns to EPC
    let handler = [
        asm::mfc0(26, 14),
        asm::lui(8, 0x0040),
        asm::mtc0(8, 12),
        asm::jr(26),
        asm::rfe(),
    ];

    for mode in ALL_MODES {
        let (mut core, _line) = core_with_line(mode, true);
        start(&mut core, &enable_program(0x0401));
        let result = core.run_to(EXCEPTION_VECTOR_ROM, 10_000);
        assert_eq!(result.stop, Some(StopReason::Breakpoint(EXCEPTION_VECTOR_ROM)));

        // handler in RAM, the ROM vector has no code
        asm::load(core.bus_mut(), 0x8000_4000, &handler);
        core.cpu_mut().regs.jump_to(0x8000_4000);
        let result = core.run_to(DONE, 10_000);
        assert_eq!(result.stop, Some(StopReason::Breakpoint(DONE)), "{:?}", mode);
        assert_eq!(core.cpu().regs.gpr[9], 1);
        assert_eq!(core.cpu().regs.gpr[10], 2);
        assert_eq!(core.stats().interrupts, 1);
    }
}
