//! Memory Control and Access Timing
//!
//! Holds the MEMCTRL delay registers (0x1f801000-0x1f801023) and the RAM_SIZE
//! register. The CPU core only uses them to derive how many cycles an uncached
//! fetch or an ICache line fill costs for each region.

use serde::{Deserialize, Serialize};

use super::memory_map::{BIOS_PHYSICAL_ADDR, BIOS_SIZE, RAM_WINDOW_SIZE};
use super::{AccessWidth, CycleCount};

/// Cycles for one RAM read as seen by the instruction fetch path
pub const RAM_READ_TICKS: CycleCount = 6;

/// Register indices inside the MEMCTRL window
const EXP1_BASE_REG: usize = 0;
const EXP2_BASE_REG: usize = 1;
const BIOS_DELAY_REG: usize = 4;
const COMMON_DELAY_REG: usize = 8;

/// Values the BIOS programs at boot
const DEFAULT_REGISTERS: [u32; 9] = [
    0x1f000000, 0x1f802000, 0x0013243f, 0x00003022, 0x0013243f, 0x200931e1, 0x00020843,
    0x00070777, 0x00031125,
];

const DEFAULT_RAM_SIZE: u32 = 0x00000b88;

/// One delay/size register (EXP1, EXP3, BIOS, SPU, CDROM, EXP2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTiming {
    /// Read access time, in cycles minus one
    pub access_time: u8,
    pub use_com0: bool,
    pub use_com1: bool,
    pub use_com2: bool,
    pub use_com3: bool,
    pub bus_width: BusWidth,
    /// Size of the region window as a power of two
    pub window_size_log2: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusWidth {
    Width8,
    Width16,
}

impl MemoryTiming {
    /// Parse from control register value
    pub fn from_u32(value: u32) -> Self {
        MemoryTiming {
            access_time: ((value >> 4) & 0xf) as u8,
            use_com0: (value & 0x100) != 0,
            use_com1: (value & 0x200) != 0,
            use_com2: (value & 0x400) != 0,
            use_com3: (value & 0x800) != 0,
            bus_width: if (value & 0x1000) != 0 {
                BusWidth::Width16
            } else {
                BusWidth::Width8
            },
            window_size_log2: ((value >> 16) & 0x1f) as u8,
        }
    }

    /// Byte, halfword and word access times against the common delay register
    pub fn access_times(&self, common_delay: u32) -> [CycleCount; 3] {
        let com0 = (common_delay & 0xf) as CycleCount;
        let com2 = ((common_delay >> 8) & 0xf) as CycleCount;
        let com3 = ((common_delay >> 12) & 0xf) as CycleCount;

        let mut first: CycleCount = 0;
        let mut sequential: CycleCount = 0;
        let mut min: CycleCount = 0;

        if self.use_com0 {
            first += com0 - 1;
            sequential += com0 - 1;
        }
        if self.use_com2 {
            first += com2;
            sequential += com2;
        }
        if self.use_com3 {
            min = com3;
        }
        if first < 6 {
            first += 1;
        }

        first += self.access_time as CycleCount + 2;
        sequential += self.access_time as CycleCount + 2;
        first = first.max(min + 6);
        sequential = sequential.max(min + 2);

        let (halfword, word) = match self.bus_width {
            BusWidth::Width16 => (first, first + sequential),
            BusWidth::Width8 => (first + sequential, first + 3 * sequential),
        };

        [(first - 1).max(0), (halfword - 1).max(0), (word - 1).max(0)]
    }
}

/// Memory control system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryControl {
    registers: [u32; 9],
    ram_size: u32,
    /// Cached BIOS access times, indexed by access width
    bios_access: [CycleCount; 3],
}

impl MemoryControl {
    pub fn new() -> Self {
        let mut ctrl = MemoryControl {
            registers: DEFAULT_REGISTERS,
            ram_size: DEFAULT_RAM_SIZE,
            bios_access: [0; 3],
        };
        ctrl.recalculate();
        ctrl
    }

    /// Read memory control register at `offset` bytes into the window
    pub fn read(&self, offset: u32) -> u32 {
        let index = (offset >> 2) as usize;
        self.registers.get(index).copied().unwrap_or_else(|| {
            warn!("Invalid memory control register read at offset {:#x}", offset);
            0xffffffff
        })
    }

    /// Write memory control register at `offset` bytes into the window
    pub fn write(&mut self, offset: u32, value: u32) {
        let index = (offset >> 2) as usize;
        if index >= self.registers.len() {
            warn!("Invalid memory control register write at offset {:#x} = {:#010x}", offset, value);
            return;
        }

        self.registers[index] = match index {
            // Base registers only decode the low 24 bits of the address
            EXP1_BASE_REG | EXP2_BASE_REG => (value & 0x00ffffff) | 0x1f000000,
            _ => value,
        };

        if index == BIOS_DELAY_REG || index == COMMON_DELAY_REG {
            self.recalculate();
        }

        debug!("Memory control[{}] = {:#010x}", index, value);
    }

    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    pub fn set_ram_size(&mut self, value: u32) {
        self.ram_size = value;
        debug!("RAM_SIZE = {:#010x}", value);
    }

    pub fn bios_timing(&self) -> MemoryTiming {
        MemoryTiming::from_u32(self.registers[BIOS_DELAY_REG])
    }

    pub fn bios_access_ticks(&self, width: AccessWidth) -> CycleCount {
        self.bios_access[width.index()]
    }

    /// Cycles for one uncached word fetch from `physical`
    pub fn fetch_ticks(&self, physical: u32) -> CycleCount {
        if physical < RAM_WINDOW_SIZE {
            RAM_READ_TICKS
        } else if physical.wrapping_sub(BIOS_PHYSICAL_ADDR) < BIOS_SIZE {
            self.bios_access[AccessWidth::Word.index()]
        } else {
            1
        }
    }

    fn recalculate(&mut self) {
        self.bios_access = self
            .bios_timing()
            .access_times(self.registers[COMMON_DELAY_REG]);
    }
}

impl Default for MemoryControl {
    fn default() -> Self {
        Self::new()
    }
}
