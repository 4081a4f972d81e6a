// Fastmem strategies only change how accesses are made, never their result

use super::{asm, at, new_core, start, ALL_FASTMEM, ALL_MODES};
use crate::config::{ExecutionMode, FastmemMode};
use crate::debugger::StopReason;
use crate::psx::memory_map::EXCEPTION_VECTOR_ROM;
use crate::system::CpuCore;

const DONE: u32 = 0x8000_8000;

fn bios_image() -> Vec<u8> {
    let mut bios = vec![0u8; 0x200];
    bios[0x100..0x104].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    bios
}

/// Enables the scratchpad, reads BIOS, RAM and scratchpad, tries to write
/// the BIOS, then touches an address nothing decodes
fn region_program() -> Vec<u32> {
    vec![
        asm::lui(20, 0xfffe),
        asm::ori(21, 0, 0x88),
        asm::sw(21, 20, 0x130),
        asm::lui(10, 0xbfc0),
        asm::lw(8, 10, 0x100),
        asm::lui(11, 0x8000),
        asm::lw(9, 11, 0x2000),
        asm::sw(0, 10, 0x100),
        asm::lw(16, 10, 0x100),
        asm::lui(14, 0x1f80),
        asm::sw(9, 14, 0x10),
        asm::lw(15, 14, 0x10),
        asm::sh(8, 11, 0x2006),
        asm::lui(12, 0x9f00),
        asm::lw(13, 12, -4),
        asm::addiu(17, 0, 1),
    ]
}

fn prepared(mode: ExecutionMode, fastmem: FastmemMode) -> CpuCore {
    let mut core = new_core(mode, fastmem);
    core.load_bios(&bios_image()).unwrap();
    core.bus_mut().poke_word(0x8000_2000, 0xcafe_babe).unwrap();
    start(&mut core, &region_program());
    core
}

#[test]
fn test_regions_behave_the_same_under_every_strategy() {
    let mut reference = None;
    for mode in ALL_MODES {
        for fastmem in ALL_FASTMEM {
            let mut core = prepared(mode, fastmem);
            let result = core.run_to(EXCEPTION_VECTOR_ROM, 100_000);
            assert_eq!(
                result.stop,
                Some(StopReason::Breakpoint(EXCEPTION_VECTOR_ROM)),
                "{:?}/{:?}",
                mode,
                fastmem
            );

            let cpu = core.cpu();
            assert_eq!(cpu.regs.gpr[8], 0x1234_5678);
            assert_eq!(cpu.regs.gpr[9], 0xcafe_babe);
            assert_eq!(cpu.regs.gpr[15], 0xcafe_babe);
            // BIOS ignores writes
            assert_eq!(cpu.regs.gpr[16], 0x1234_5678);
            assert_eq!(cpu.regs.gpr[17], 0);
            // data bus error on the unmapped load
            assert_eq!((cpu.cop0.cause >> 2) & 0x1f, 0x07);
            assert_eq!(cpu.cop0.epc, at(14));

            let outcome = (
                cpu.regs.gpr,
                core.bus().ram()[0x2000..0x2010].to_vec(),
                core.bus().scratchpad()[..0x20].to_vec(),
            );
            let expected = reference.get_or_insert_with(|| outcome.clone());
            assert_eq!(&outcome, expected, "{:?}/{:?}", mode, fastmem);
        }
    }
}

#[test]
fn test_set_fastmem_mode_reports_effective_mode() {
    let mut core = new_core(ExecutionMode::Recompiler, FastmemMode::Disabled);
    assert_eq!(core.fastmem_mode(), FastmemMode::Disabled);

    assert_eq!(core.set_fastmem_mode(FastmemMode::Lut), FastmemMode::Lut);
    assert_eq!(core.fastmem_mode(), FastmemMode::Lut);

    // MMap either works or falls back to the LUT, never to nothing
    let effective = core.set_fastmem_mode(FastmemMode::Mmap);
    assert!(matches!(effective, FastmemMode::Mmap | FastmemMode::Lut));
    assert_eq!(core.fastmem_mode(), effective);
    assert_eq!(core.config().fastmem_mode, effective);

    assert_eq!(
        core.set_fastmem_mode(FastmemMode::Disabled),
        FastmemMode::Disabled
    );
}

#[test]
fn test_switching_strategy_mid_run_keeps_memory() {
    let program = [
        asm::addiu(8, 0, 64),
        asm::lui(10, 0x8000),
        asm::ori(10, 10, 0x3000),
        // loop:
        asm::sw(8, 10, 0),
        asm::addiu(10, 10, 4),
        asm::addiu(8, 8, -1),
        asm::bne(8, 0, -4),
        asm::nop(),
        asm::j(DONE),
        asm::nop(),
    ];

    let mut expected_core = new_core(ExecutionMode::Recompiler, FastmemMode::Disabled);
    asm::load(expected_core.bus_mut(), DONE, &[asm::j(DONE), asm::nop()]);
    start(&mut expected_core, &program);
    expected_core.run_to(DONE, 100_000);
    let expected = expected_core.bus().ram()[0x3000..0x3100].to_vec();

    let mut core = new_core(ExecutionMode::Recompiler, FastmemMode::Mmap);
    asm::load(core.bus_mut(), DONE, &[asm::j(DONE), asm::nop()]);
    start(&mut core, &program);
    core.run(100);
    core.set_fastmem_mode(FastmemMode::Lut);
    core.run(100);
    core.set_fastmem_mode(FastmemMode::Disabled);
    let result = core.run_to(DONE, 100_000);

    assert_eq!(result.stop, Some(StopReason::Breakpoint(DONE)));
    assert_eq!(core.bus().ram()[0x3000..0x3100], expected[..]);
    assert_eq!(core.cpu().regs.gpr[8], 0);
}

#[test]
fn test_disabled_scratchpad_faults_under_every_strategy() {
    let program = [
        asm::lui(14, 0x1f80),
        asm::addiu(9, 0, 5),
        asm::sw(9, 14, 0x10),
        asm::addiu(17, 0, 1),
    ];
    for mode in ALL_MODES {
        for fastmem in ALL_FASTMEM {
            let mut core = new_core(mode, fastmem);
            start(&mut core, &program);
            let result = core.run_to(EXCEPTION_VECTOR_ROM, 100_000);
            assert_eq!(
                result.stop,
                Some(StopReason::Breakpoint(EXCEPTION_VECTOR_ROM)),
                "{:?}/{:?}",
                mode,
                fastmem
            );

            let cpu = core.cpu();
            assert_eq!((cpu.cop0.cause >> 2) & 0x1f, 0x07, "{:?}/{:?}", mode, fastmem);
            assert_eq!(cpu.cop0.epc, at(2));
            assert_eq!(cpu.regs.gpr[17], 0);
            assert_eq!(core.bus().scratchpad()[0x10], 0);
        }
    }
}
