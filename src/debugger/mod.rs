//! Breakpoints, watchpoints and stepping helpers
//!
//! The debugger only holds state. `CpuCore` consults it at every block
//! boundary: `check` reports a stop before the instruction at `pc` runs,
//! and `breakpoint_in_range` tells the core when the next block could run
//! past a breakpoint so it single steps instead.

#[cfg(feature = "debugger")]
pub mod gdb;

use std::collections::BTreeMap;

use crate::error::{PsxError, Result};
use crate::psx::bus::Bus;
use crate::psx::cpu::disasm::{disassemble, DisassembledInstruction};
use crate::psx::cpu::instruction::Instruction;
use crate::psx::cpu::Cpu;

/// Instructions scanned forward for `jr $ra` by step out
pub const STEP_OUT_SCAN_LIMIT: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: u32,
    pub enabled: bool,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    pub address: u32,
    pub kind: WatchKind,
    pub hit_count: u64,
}

/// Why `CpuCore::run` returned before using up its cycle budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// About to execute the instruction at this address
    Breakpoint(u32),
    /// The instruction at `pc` is about to access a watched address
    Watchpoint {
        pc: u32,
        address: u32,
        kind: WatchKind,
    },
    /// A single step completed, execution stands at this address
    Step(u32),
    /// Stop requested through the control handle
    StopRequested,
    /// Execution is paused, `resume` first
    Paused,
}

#[derive(Debug, Default)]
pub struct Debugger {
    breakpoints: BTreeMap<u32, Breakpoint>,
    watchpoints: Vec<Watchpoint>,
    /// One-shot breakpoint of step over, step out and run to
    transient: Option<u32>,
    /// Address execution resumes from; its breakpoint is not reported again
    resume_pc: Option<u32>,
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anything that can stop execution is set
    pub fn is_active(&self) -> bool {
        self.transient.is_some()
            || !self.watchpoints.is_empty()
            || self.breakpoints.values().any(|bp| bp.enabled)
    }

    // ------------------------------------------------------------------
    // Breakpoints
    // ------------------------------------------------------------------

    pub fn add_breakpoint(&mut self, address: u32) -> Result<()> {
        if self.breakpoints.contains_key(&address) {
            return Err(PsxError::DuplicateBreakpoint(address));
        }
        self.breakpoints.insert(
            address,
            Breakpoint {
                address,
                enabled: true,
                hit_count: 0,
            },
        );
        debug!("Breakpoint added at {:#010x}", address);
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, address: u32) -> Result<()> {
        self.breakpoints
            .remove(&address)
            .map(|_| ())
            .ok_or(PsxError::NoSuchBreakpoint(address))
    }

    /// Flip the enabled flag, returning the new value
    pub fn toggle_breakpoint(&mut self, address: u32) -> Result<bool> {
        let bp = self
            .breakpoints
            .get_mut(&address)
            .ok_or(PsxError::NoSuchBreakpoint(address))?;
        bp.enabled = !bp.enabled;
        Ok(bp.enabled)
    }

    pub fn set_breakpoint_enabled(&mut self, address: u32, enabled: bool) -> Result<()> {
        let bp = self
            .breakpoints
            .get_mut(&address)
            .ok_or(PsxError::NoSuchBreakpoint(address))?;
        bp.enabled = enabled;
        Ok(())
    }

    pub fn breakpoint(&self, address: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    /// Breakpoints in address order
    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
        self.transient = None;
    }

    /// An enabled or transient breakpoint lies in `[start, start + len)`
    pub fn breakpoint_in_range(&self, start: u32, len: u32) -> bool {
        let end = start.saturating_add(len);
        if self.transient.map_or(false, |t| t >= start && t < end) {
            return true;
        }
        self.breakpoints
            .range(start..end)
            .any(|(_, bp)| bp.enabled)
    }

    pub fn set_transient(&mut self, address: u32) {
        self.transient = Some(address);
    }

    pub fn transient(&self) -> Option<u32> {
        self.transient
    }

    pub fn clear_transient(&mut self) {
        self.transient = None;
    }

    // ------------------------------------------------------------------
    // Watchpoints
    // ------------------------------------------------------------------

    pub fn add_watchpoint(&mut self, address: u32, kind: WatchKind) -> Result<()> {
        if self
            .watchpoints
            .iter()
            .any(|w| w.address == address && w.kind == kind)
        {
            return Err(PsxError::DuplicateBreakpoint(address));
        }
        self.watchpoints.push(Watchpoint {
            address,
            kind,
            hit_count: 0,
        });
        debug!("{:?} watchpoint added at {:#010x}", kind, address);
        Ok(())
    }

    pub fn remove_watchpoint(&mut self, address: u32, kind: WatchKind) -> Result<()> {
        let before = self.watchpoints.len();
        self.watchpoints
            .retain(|w| !(w.address == address && w.kind == kind));
        if self.watchpoints.len() == before {
            Err(PsxError::NoSuchBreakpoint(address))
        } else {
            Ok(())
        }
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        &self.watchpoints
    }

    pub fn has_watchpoints(&self) -> bool {
        !self.watchpoints.is_empty()
    }

    pub fn clear_watchpoints(&mut self) {
        self.watchpoints.clear();
    }

    // ------------------------------------------------------------------
    // Stop checks
    // ------------------------------------------------------------------

    /// Execution continues from `pc`; a breakpoint or watchpoint there
    /// must not stop it again right away
    pub fn resume_from(&mut self, pc: u32) {
        self.resume_pc = Some(pc);
    }

    /// Reason to stop before executing the instruction at `cpu.regs.pc`
    pub fn check(&mut self, cpu: &Cpu, bus: &Bus) -> Option<StopReason> {
        let pc = cpu.regs.pc;
        if self.resume_pc.take() == Some(pc) {
            return None;
        }

        if self.transient == Some(pc) {
            self.transient = None;
            debug!("Reached {:#010x}", pc);
            return Some(StopReason::Breakpoint(pc));
        }
        if let Some(bp) = self.breakpoints.get_mut(&pc) {
            if bp.enabled {
                bp.hit_count += 1;
                debug!("Breakpoint hit at {:#010x} (hit {})", pc, bp.hit_count);
                return Some(StopReason::Breakpoint(pc));
            }
        }

        if self.watchpoints.is_empty() {
            return None;
        }
        let access = Instruction::decode(bus.peek_word(pc)?).memory_access()?;
        let address = access.address(cpu.regs.reg(access.base));
        let kind = if access.store {
            WatchKind::Write
        } else {
            WatchKind::Read
        };
        let width = access.width.bytes();
        let watch = self.watchpoints.iter_mut().find(|w| {
            w.kind == kind && w.address.wrapping_sub(address) < width
        })?;
        watch.hit_count += 1;
        debug!(
            "{:?} watchpoint {:#010x} hit by {:#010x}",
            kind, watch.address, pc
        );
        Some(StopReason::Watchpoint { pc, address, kind })
    }
}

/// Address step over should stop at: after the delay slot of a call at
/// `pc`, `None` if the instruction is not a call
pub fn step_over_target(bus: &Bus, pc: u32) -> Option<u32> {
    let word = bus.peek_word(pc)?;
    if Instruction::decode(word).is_call() {
        Some(pc.wrapping_add(8))
    } else {
        None
    }
}

/// First `jr $ra` at or after `pc`
pub fn find_return(bus: &Bus, pc: u32) -> Result<u32> {
    (0..STEP_OUT_SCAN_LIMIT)
        .map(|i| pc.wrapping_add(i * 4))
        .map_while(|addr| bus.peek_word(addr).map(|word| (addr, word)))
        .find(|&(_, word)| Instruction::decode(word).is_return())
        .map(|(addr, _)| addr)
        .ok_or(PsxError::NotInFunction(pc))
}

/// Listing of `count` instructions from `address`. Unreadable words show
/// up as `??`.
pub fn disassemble_range(bus: &Bus, address: u32, count: usize) -> Vec<DisassembledInstruction> {
    (0..count as u32)
        .map(|i| {
            let pc = address.wrapping_add(i * 4);
            match bus.peek_word(pc) {
                Some(word) => DisassembledInstruction {
                    address: pc,
                    word,
                    text: disassemble(word, pc),
                },
                None => DisassembledInstruction {
                    address: pc,
                    word: 0,
                    text: "??".to_string(),
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psx::bus::NullPeripherals;
    use crate::psx::cpu::cop2::RegisterFileCop2;
    use crate::tests::asm;

    #[test]
    fn test_breakpoint_management() {
        let mut debugger = Debugger::new();
        assert!(!debugger.is_active());
        debugger.add_breakpoint(0x80010000).unwrap();
        assert!(matches!(
            debugger.add_breakpoint(0x80010000),
            Err(PsxError::DuplicateBreakpoint(0x80010000))
        ));
        assert!(debugger.is_active());

        assert_eq!(debugger.toggle_breakpoint(0x80010000).unwrap(), false);
        assert!(!debugger.is_active());
        assert!(!debugger.breakpoint_in_range(0x80010000, 16));
        debugger.set_breakpoint_enabled(0x80010000, true).unwrap();
        assert!(debugger.breakpoint_in_range(0x8000fff0, 0x14));
        assert!(!debugger.breakpoint_in_range(0x8000fff0, 0x10));

        debugger.remove_breakpoint(0x80010000).unwrap();
        assert!(matches!(
            debugger.remove_breakpoint(0x80010000),
            Err(PsxError::NoSuchBreakpoint(_))
        ));
    }

    #[test]
    fn test_check_skips_resume_address_once() {
        let bus = Bus::new(Box::new(NullPeripherals));
        let mut cpu = Cpu::new(Box::new(RegisterFileCop2::new()));
        cpu.regs.jump_to(0x80010000);

        let mut debugger = Debugger::new();
        debugger.add_breakpoint(0x80010000).unwrap();
        assert_eq!(
            debugger.check(&cpu, &bus),
            Some(StopReason::Breakpoint(0x80010000))
        );
        debugger.resume_from(0x80010000);
        assert_eq!(debugger.check(&cpu, &bus), None);
        assert_eq!(
            debugger.check(&cpu, &bus),
            Some(StopReason::Breakpoint(0x80010000))
        );
        assert_eq!(debugger.breakpoint(0x80010000).unwrap().hit_count, 2);
    }

    #[test]
    fn test_watchpoint_matches_access_width() {
        let mut bus = Bus::new(Box::new(NullPeripherals));
        asm::load(&mut bus, 0x80010000, &[asm::sw(9, 8, 4)]);
        let mut cpu = Cpu::new(Box::new(RegisterFileCop2::new()));
        cpu.regs.jump_to(0x80010000);
        cpu.regs.gpr[8] = 0x80000100;

        let mut debugger = Debugger::new();
        debugger.add_watchpoint(0x80000106, WatchKind::Read).unwrap();
        assert_eq!(debugger.check(&cpu, &bus), None);

        debugger.add_watchpoint(0x80000106, WatchKind::Write).unwrap();
        assert_eq!(
            debugger.check(&cpu, &bus),
            Some(StopReason::Watchpoint {
                pc: 0x80010000,
                address: 0x80000104,
                kind: WatchKind::Write
            })
        );
    }

    #[test]
    fn test_step_targets() {
        let mut bus = Bus::new(Box::new(NullPeripherals));
        asm::load(
            &mut bus,
            0x80010000,
            &[asm::jal(0x80020000), asm::nop(), asm::addiu(8, 8, 1), asm::jr(31)],
        );
        assert_eq!(step_over_target(&bus, 0x80010000), Some(0x80010008));
        assert_eq!(step_over_target(&bus, 0x80010008), None);
        assert_eq!(find_return(&bus, 0x80010008).unwrap(), 0x8001000c);
        assert!(matches!(
            find_return(&bus, 0x80010010),
            Err(PsxError::NotInFunction(0x80010010))
        ));
    }

    #[test]
    fn test_disassemble_range() {
        let mut bus = Bus::new(Box::new(NullPeripherals));
        asm::load(&mut bus, 0x80010000, &[asm::nop(), asm::jr(31)]);
        let listing = disassemble_range(&bus, 0x80010000, 2);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].text, "NOP");
        assert_eq!(listing[1].word, asm::jr(31));
        let unmapped = disassemble_range(&bus, 0x1f801000, 1);
        assert_eq!(unmapped[0].text, "??");
    }
}
