//! Guest address map
//!
//! Addresses, ranges and masks for the guest address space as seen by the CPU
//! core. The memory layer, the ICache model and the recompiler all decode
//! addresses through these helpers so the three fastmem strategies agree on
//! every region boundary.

// Segments

/// User segment, no TLB on this CPU
pub const KUSEG_BASE: u32 = 0x00000000;

/// Cached kernel segment
pub const KSEG0_BASE: u32 = 0x80000000;

/// Uncached kernel segment
pub const KSEG1_BASE: u32 = 0xa0000000;

/// Only holds the cache control register
pub const KSEG2_BASE: u32 = 0xc0000000;

/// Segment bases that alias physical memory
pub const MIRRORED_SEGMENTS: [u32; 3] = [KUSEG_BASE, KSEG0_BASE, KSEG1_BASE];

// RAM

/// Installed RAM
pub const RAM_SIZE: u32 = 0x00200000;
pub const RAM_MASK: u32 = RAM_SIZE - 1;

/// RAM is mirrored four times inside this window
pub const RAM_WINDOW_SIZE: u32 = 0x00800000;
pub const RAM_MIRRORS: u32 = RAM_WINDOW_SIZE / RAM_SIZE;

// Host page granularity used by the fastmem strategies

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;

/// Number of pages covering the whole 32 bit guest space
pub const GUEST_PAGE_COUNT: usize = 1 << (32 - PAGE_SHIFT);

/// Number of pages of installed RAM (code page tracking granularity)
pub const RAM_PAGE_COUNT: usize = (RAM_SIZE >> PAGE_SHIFT) as usize;

// BIOS ROM

pub const BIOS_PHYSICAL_ADDR: u32 = 0x1fc00000;
pub const BIOS_SIZE: u32 = 0x00080000;

/// First instruction after reset, uncached BIOS
pub const RESET_VECTOR: u32 = 0xbfc00000;

// Scratchpad

pub const SCRATCHPAD_ADDR: u32 = 0x1f800000;
pub const SCRATCHPAD_SIZE: u32 = 0x00000400;

// Hardware register windows

/// Memory control delay/base registers
pub const MEMCTRL_BASE: u32 = 0x1f801000;
pub const MEMCTRL_SIZE: u32 = 0x00000024;

/// RAM_SIZE configuration register
pub const RAM_SIZE_REG: u32 = 0x1f801060;

/// Peripheral I/O ports handled by the external memory subsystem
pub const IO_BASE: u32 = 0x1f801000;
pub const IO_SIZE: u32 = 0x00002000;

/// Expansion regions, routed to the external memory subsystem
pub const EXP1_BASE: u32 = 0x1f000000;
pub const EXP1_SIZE: u32 = 0x00800000;
pub const EXP2_BASE: u32 = 0x1f802000;
pub const EXP2_SIZE: u32 = 0x00002000;
pub const EXP3_BASE: u32 = 0x1fa00000;
pub const EXP3_SIZE: u32 = 0x00200000;

/// BIU / cache control register (KSEG2)
pub const CACHE_CONTROL_ADDR: u32 = 0xfffe0130;

// Masks

pub const PHYSICAL_ADDR_MASK: u32 = 0x1fffffff;

/// Segment selection mask
pub const SEGMENT_MASK: u32 = 0xe0000000;

// Jumps

/// J/JAL keep the top four pc bits and replace the rest
pub const JUMP_TARGET_MASK: u32 = 0x03ffffff;

pub const PC_SEGMENT_MASK: u32 = 0xf0000000;

// Exception vectors

pub const EXCEPTION_VECTOR_RAM: u32 = 0x80000080;
pub const EXCEPTION_VECTOR_ROM: u32 = 0xbfc00180;

/// Convert a virtual address to a physical address. KSEG2 is not translated.
#[inline(always)]
pub const fn to_physical_address(addr: u32) -> u32 {
    if addr >= KSEG2_BASE {
        addr
    } else {
        addr & PHYSICAL_ADDR_MASK
    }
}

#[inline(always)]
pub const fn is_kseg1(addr: u32) -> bool {
    (addr & SEGMENT_MASK) == KSEG1_BASE
}

#[inline(always)]
pub const fn is_kseg2(addr: u32) -> bool {
    addr >= KSEG2_BASE
}

/// Instruction fetches through KUSEG and KSEG0 go through the ICache
#[inline(always)]
pub const fn is_cached(addr: u32) -> bool {
    addr < KSEG1_BASE
}

/// Index of the RAM page backing a physical address inside the RAM window
#[inline(always)]
pub const fn ram_page(physical: u32) -> usize {
    ((physical & RAM_MASK) >> PAGE_SHIFT) as usize
}
