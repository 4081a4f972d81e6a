// Save state tests

use byteorder::{ByteOrder, LittleEndian};

use super::{asm, new_core, start};
use crate::config::{ExecutionMode, FastmemMode};
use crate::debugger::StopReason;
use crate::error::PsxError;
use crate::save_state::*;
use crate::system::CpuCore;

const DONE: u32 = 0x8000_8000;

fn counting_program() -> Vec<u32> {
    vec![
        asm::addiu(8, 0, 200),
        asm::lui(10, 0x8000),
        asm::ori(10, 10, 0x2000),
        // loop:
        asm::addu(9, 9, 8),
        asm::sw(9, 10, 0),
        asm::addiu(10, 10, 4),
        asm::addiu(8, 8, -1),
        asm::bne(8, 0, -5),
        asm::xor(11, 11, 9),
        asm::j(DONE),
        asm::nop(),
    ]
}

fn prepared(mode: ExecutionMode) -> CpuCore {
    let mut core = new_core(mode, FastmemMode::Lut);
    asm::load(core.bus_mut(), DONE, &[asm::j(DONE), asm::nop()]);
    start(&mut core, &counting_program());
    core
}

fn finish(core: &mut CpuCore) -> ([u32; 32], Vec<u8>) {
    let result = core.run_to(DONE, 1_000_000);
    assert_eq!(result.stop, Some(StopReason::Breakpoint(DONE)));
    (core.cpu().regs.gpr, core.bus().ram()[0x2000..0x3000].to_vec())
}

#[test]
fn test_round_trip_reproduces_execution() {
    let mut core = prepared(ExecutionMode::Recompiler);
    core.run(300);
    let state = core.save_state();
    let expected = finish(&mut core);

    core.load_state(&state).unwrap();
    assert_eq!(finish(&mut core), expected);
}

#[test]
fn test_state_moves_between_engines() {
    let mut core = prepared(ExecutionMode::CachedInterpreter);
    core.run(300);
    let bytes = core.save_state().to_bytes().unwrap();
    let expected = finish(&mut core);

    let mut other = new_core(ExecutionMode::Recompiler, FastmemMode::Disabled);
    other.load_state(&SaveState::from_bytes(&bytes).unwrap()).unwrap();
    assert_eq!(finish(&mut other), expected);
}

#[test]
fn test_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slot1.r3k");

    let mut core = prepared(ExecutionMode::Interpreter);
    core.cpu_mut().regs.hi = 0x1234_5678;
    core.set_icache_emulation(true);
    core.save_state_to_file(&path).unwrap();

    let mut other = new_core(ExecutionMode::Interpreter, FastmemMode::Disabled);
    other.load_state_from_file(&path).unwrap();
    assert_eq!(other.cpu().regs.hi, 0x1234_5678);
    assert_eq!(other.cpu().regs.pc, core.cpu().regs.pc);
    assert!(other.icache_emulation());
    assert_eq!(other.bus().ram(), core.bus().ram());
}

#[test]
fn test_rejected_state_leaves_core_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.r3k");

    let mut core = prepared(ExecutionMode::Interpreter);
    let mut bytes = core.save_state().to_bytes().unwrap();
    LittleEndian::write_u32(&mut bytes[8..12], SAVE_STATE_VERSION + 1);
    std::fs::write(&path, &bytes).unwrap();

    core.cpu_mut().regs.gpr[3] = 77;
    let err = core.load_state_from_file(&path).unwrap_err();
    assert!(matches!(err, PsxError::UnsupportedSaveStateVersion { .. }));
    assert!(!err.is_recoverable());
    assert_eq!(core.cpu().regs.gpr[3], 77);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = SaveState::load_from_file(&dir.path().join("none")).unwrap_err();
    assert!(matches!(err, PsxError::IoError(_)));
}
