// Memory exceptions with the shipped configuration, where the recompiler
// lowers accesses without bus error checks

use super::{asm, at, default_config, new_core_with, start, ALL_FASTMEM, ALL_MODES};
use crate::config::{ExecutionMode, FastmemMode};
use crate::debugger::StopReason;
use crate::psx::bus::NullPeripherals;
use crate::psx::memory_map::EXCEPTION_VECTOR_ROM;

#[derive(Debug, PartialEq)]
struct Outcome {
    gpr: [u32; 32],
    pc: u32,
    epc: u32,
    cause: u32,
    bad_vaddr: u32,
    data: Vec<u8>,
}

fn run_program(mode: ExecutionMode, fastmem: FastmemMode, program: &[u32]) -> Outcome {
    let config = default_config(mode, fastmem);
    assert!(!config.memory_exceptions);
    let mut core = new_core_with(config, Box::new(NullPeripherals));
    core.bus_mut().poke_word(0x8000_2000, 0x1122_3344).unwrap();
    core.bus_mut().poke_word(0x8000_2004, 0x5566_7788).unwrap();
    start(&mut core, program);

    let result = core.run_to(EXCEPTION_VECTOR_ROM, 100_000);
    assert_eq!(
        result.stop,
        Some(StopReason::Breakpoint(EXCEPTION_VECTOR_ROM)),
        "{:?}/{:?} took no exception",
        mode,
        fastmem
    );

    let cpu = core.cpu();
    Outcome {
        gpr: cpu.regs.gpr,
        pc: cpu.regs.pc,
        epc: cpu.cop0.epc,
        cause: cpu.cop0.cause,
        bad_vaddr: cpu.cop0.bad_vaddr,
        data: core.bus().ram()[0x2000..0x2010].to_vec(),
    }
}

fn assert_equivalent(program: &[u32]) -> Outcome {
    let reference = run_program(ExecutionMode::Interpreter, FastmemMode::Disabled, program);
    for mode in ALL_MODES {
        for fastmem in ALL_FASTMEM {
            let outcome = run_program(mode, fastmem, program);
            assert_eq!(outcome, reference, "{:?} with {:?} fastmem", mode, fastmem);
        }
    }
    reference
}

/// Parks the recompiled path in a loop if the access went through
fn spin() -> [u32; 2] {
    [asm::j(at(6)), asm::nop()]
}

#[test]
fn test_misaligned_load_is_precise() {
    let mut program = vec![
        asm::lui(10, 0x8000),
        asm::ori(10, 10, 0x2002),
        asm::lw(8, 10, 0),
        asm::addiu(9, 0, 1),
        asm::nop(),
        asm::nop(),
    ];
    program.extend(spin());

    let outcome = assert_equivalent(&program);
    assert_eq!((outcome.cause >> 2) & 0x1f, 0x04);
    assert_eq!(outcome.epc, at(2));
    assert_eq!(outcome.bad_vaddr, 0x8000_2002);
    assert_eq!(outcome.gpr[8], 0);
    assert_eq!(outcome.gpr[9], 0);
}

#[test]
fn test_misaligned_halfword_load_is_precise() {
    let mut program = vec![
        asm::lui(10, 0x8000),
        asm::ori(10, 10, 0x2005),
        asm::lhu(8, 10, 0),
        asm::addiu(9, 0, 1),
        asm::nop(),
        asm::nop(),
    ];
    program.extend(spin());

    let outcome = assert_equivalent(&program);
    assert_eq!((outcome.cause >> 2) & 0x1f, 0x04);
    assert_eq!(outcome.bad_vaddr, 0x8000_2005);
    assert_eq!(outcome.gpr[9], 0);
}

#[test]
fn test_misaligned_stores_are_precise() {
    for (store, offset) in [(asm::sw(8, 10, 2), 2), (asm::sh(8, 10, 1), 1)] {
        let mut program = vec![
            asm::lui(10, 0x8000),
            asm::ori(10, 10, 0x2000),
            asm::addiu(8, 0, -1),
            store,
            asm::addiu(9, 0, 1),
            asm::nop(),
        ];
        program.extend(spin());

        let outcome = assert_equivalent(&program);
        assert_eq!((outcome.cause >> 2) & 0x1f, 0x05);
        assert_eq!(outcome.epc, at(3));
        assert_eq!(outcome.bad_vaddr, 0x8000_2000 + offset);
        assert_eq!(outcome.gpr[9], 0);
        // memory keeps its old contents
        assert_eq!(outcome.data[..8], [0x44, 0x33, 0x22, 0x11, 0x88, 0x77, 0x66, 0x55]);
    }
}

#[test]
fn test_unmapped_accesses_raise_bus_errors() {
    // The faulting access is the last one before the block leaves, so the
    // end-of-block delivery of the recompiler lands on the same state
    let load = [
        asm::lui(12, 0x9f00),
        asm::addiu(8, 0, 3),
        asm::lw(13, 12, -4),
        asm::j(at(3)),
        asm::nop(),
    ];
    let store = [
        asm::lui(12, 0x9f00),
        asm::addiu(8, 0, 3),
        asm::sw(8, 12, -4),
        asm::j(at(3)),
        asm::nop(),
    ];

    for program in [&load[..], &store[..]] {
        let outcome = assert_equivalent(program);
        assert_eq!((outcome.cause >> 2) & 0x1f, 0x07);
        assert_eq!(outcome.cause >> 31, 0);
        assert_eq!(outcome.epc, at(2));
        assert_eq!(outcome.gpr[8], 3);
        assert_eq!(outcome.pc, EXCEPTION_VECTOR_ROM);
    }
}
