//! Coprocessor 2 collaborator
//!
//! The geometry engine itself lives outside the CPU core. The core only
//! moves words in and out of its register files and forwards command words.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Interface the CPU uses to drive coprocessor 2
pub trait Cop2: Send {
    fn read_data(&mut self, index: u8) -> u32;
    fn write_data(&mut self, index: u8, value: u32);
    fn read_control(&mut self, index: u8) -> u32;
    fn write_control(&mut self, index: u8, value: u32);
    /// Execute a command word (the low 25 bits of a COP2 instruction)
    fn execute(&mut self, command: u32);

    /// Full register state for save states: data registers then control
    /// registers
    fn snapshot(&mut self) -> Cop2Registers {
        let mut regs = Cop2Registers::default();
        for i in 0..32u8 {
            regs.data[i as usize] = self.read_data(i);
            regs.control[i as usize] = self.read_control(i);
        }
        regs
    }

    fn restore(&mut self, regs: &Cop2Registers) {
        for i in 0..32u8 {
            self.write_control(i, regs.control[i as usize]);
            self.write_data(i, regs.data[i as usize]);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cop2Registers {
    #[serde(with = "BigArray")]
    pub data: [u32; 32],
    #[serde(with = "BigArray")]
    pub control: [u32; 32],
}

/// Plain register storage. Commands are counted and otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct RegisterFileCop2 {
    regs: Cop2Registers,
    pub commands_executed: u64,
    pub last_command: u32,
}

impl RegisterFileCop2 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cop2 for RegisterFileCop2 {
    fn read_data(&mut self, index: u8) -> u32 {
        self.regs.data[(index & 0x1f) as usize]
    }

    fn write_data(&mut self, index: u8, value: u32) {
        self.regs.data[(index & 0x1f) as usize] = value;
    }

    fn read_control(&mut self, index: u8) -> u32 {
        self.regs.control[(index & 0x1f) as usize]
    }

    fn write_control(&mut self, index: u8, value: u32) {
        self.regs.control[(index & 0x1f) as usize] = value;
    }

    fn execute(&mut self, command: u32) {
        self.commands_executed += 1;
        self.last_command = command;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_restore() {
        let mut cop2 = RegisterFileCop2::new();
        cop2.write_data(3, 0x1234);
        cop2.write_control(31, 0x8000_0000);
        let snapshot = cop2.snapshot();

        let mut other = RegisterFileCop2::new();
        other.restore(&snapshot);
        assert_eq!(other.read_data(3), 0x1234);
        assert_eq!(other.read_control(31), 0x8000_0000);
    }
}
