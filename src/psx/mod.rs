//! Guest-side building blocks of the R3000A core: the memory access layer,
//! the instruction cache model and the CPU with its three execution engines.

pub mod bus;
pub mod cache;
pub mod cpu;
pub mod memory_control;
pub mod memory_map;

use serde::{Deserialize, Serialize};

/// Cycle counts charged by fetches, fills and accesses
pub type CycleCount = i32;

/// Width of a guest memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessWidth {
    Byte,
    HalfWord,
    Word,
}

impl AccessWidth {
    #[inline(always)]
    pub const fn bytes(self) -> u32 {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::HalfWord => 2,
            AccessWidth::Word => 4,
        }
    }

    /// Position in per-width tables
    #[inline(always)]
    pub const fn index(self) -> usize {
        match self {
            AccessWidth::Byte => 0,
            AccessWidth::HalfWord => 1,
            AccessWidth::Word => 2,
        }
    }

    /// Mask selecting the value bits of this width
    #[inline(always)]
    pub const fn value_mask(self) -> u32 {
        match self {
            AccessWidth::Byte => 0xff,
            AccessWidth::HalfWord => 0xffff,
            AccessWidth::Word => 0xffff_ffff,
        }
    }

    /// True if `addr` is naturally aligned for this width
    #[inline(always)]
    pub const fn is_aligned(self, addr: u32) -> bool {
        addr & (self.bytes() - 1) == 0
    }
}

/// Types that can be loaded from or stored to the guest bus
pub trait Addressable: Copy {
    fn width() -> AccessWidth;
    fn from_u32(val: u32) -> Self;
    fn to_u32(self) -> u32;
}

impl Addressable for u8 {
    fn width() -> AccessWidth {
        AccessWidth::Byte
    }

    fn from_u32(val: u32) -> Self {
        val as u8
    }

    fn to_u32(self) -> u32 {
        self as u32
    }
}

impl Addressable for u16 {
    fn width() -> AccessWidth {
        AccessWidth::HalfWord
    }

    fn from_u32(val: u32) -> Self {
        val as u16
    }

    fn to_u32(self) -> u32 {
        self as u32
    }
}

impl Addressable for u32 {
    fn width() -> AccessWidth {
        AccessWidth::Word
    }

    fn from_u32(val: u32) -> Self {
        val
    }

    fn to_u32(self) -> u32 {
        self
    }
}
