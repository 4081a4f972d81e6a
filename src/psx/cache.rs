//! R3000A Instruction Cache Model
//!
//! The R3000A has a 4KB direct mapped instruction cache: 256 lines of four
//! words. Only the tag and per-word valid state is modeled, fetched words
//! always come from memory so written code is seen on the next fetch. The
//! model exists to charge the fill latency a real cache miss costs.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use super::CycleCount;

pub const ICACHE_LINES: usize = 256;
pub const ICACHE_LINE_SIZE: u32 = 16;
pub const ICACHE_WORDS_PER_LINE: u32 = ICACHE_LINE_SIZE / 4;

const TAG_MASK: u32 = !(ICACHE_LINE_SIZE - 1);
const ALL_WORDS_VALID: u8 = 0x0f;

bitflags! {
    /// Cache control register (0xfffe0130)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheControl: u32 {
        const LOCK_MODE = 1 << 0;
        const INVALIDATE_MODE = 1 << 1;
        const TAG_TEST_MODE = 1 << 2;
        const SCRATCHPAD_ENABLE_1 = 1 << 3;
        const SCRATCHPAD_ENABLE_2 = 1 << 7;
        const ICACHE_ENABLE = 1 << 11;
    }
}

impl CacheControl {
    pub fn icache_enabled(self) -> bool {
        self.contains(CacheControl::ICACHE_ENABLE)
    }

    pub fn scratchpad_enabled(self) -> bool {
        self.contains(CacheControl::SCRATCHPAD_ENABLE_1 | CacheControl::SCRATCHPAD_ENABLE_2)
    }
}

impl Default for CacheControl {
    fn default() -> Self {
        CacheControl::empty()
    }
}

/// Outcome of one instruction fetch through the cache model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Hit,
    /// Line (re)filled from the fetched word to the end of the line
    Miss { words_filled: u32 },
}

/// Tag/valid state of the instruction cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ICache {
    #[serde(with = "BigArray")]
    tags: [u32; ICACHE_LINES],
    /// One bit per word of the line
    #[serde(with = "BigArray")]
    valid: [u8; ICACHE_LINES],
    #[serde(skip)]
    hits: u64,
    #[serde(skip)]
    misses: u64,
}

impl ICache {
    pub fn new() -> Self {
        ICache {
            tags: [0; ICACHE_LINES],
            valid: [0; ICACHE_LINES],
            hits: 0,
            misses: 0,
        }
    }

    #[inline(always)]
    fn line_index(addr: u32) -> usize {
        ((addr >> 4) & 0xff) as usize
    }

    #[inline(always)]
    fn word_offset(addr: u32) -> u32 {
        (addr >> 2) & 0x3
    }

    /// Look `pc` up and fill on a miss
    pub fn access(&mut self, pc: u32) -> FetchKind {
        let index = Self::line_index(pc);
        let word = Self::word_offset(pc);
        let tag = pc & TAG_MASK;

        if self.tags[index] == tag && self.valid[index] & (1 << word) != 0 {
            self.hits += 1;
            return FetchKind::Hit;
        }

        self.misses += 1;
        let fill_mask = ALL_WORDS_VALID & !((1u8 << word) - 1);
        if self.tags[index] != tag {
            self.tags[index] = tag;
            self.valid[index] = fill_mask;
        } else {
            self.valid[index] |= fill_mask;
        }

        FetchKind::Miss {
            words_filled: ICACHE_WORDS_PER_LINE - word,
        }
    }

    /// Cycles charged for one fetch. `fill_ticks` is the cost of one word
    /// read from the backing memory.
    pub fn fetch_cycles(&mut self, pc: u32, cached: bool, fill_ticks: CycleCount) -> CycleCount {
        if !cached {
            return fill_ticks;
        }
        match self.access(pc) {
            FetchKind::Hit => 1,
            FetchKind::Miss { words_filled } => 1 + fill_ticks * words_filled as CycleCount,
        }
    }

    /// Isolated store in tag test mode: the line is retagged to the written
    /// address and marked invalid
    pub fn isolated_store(&mut self, addr: u32) {
        let index = Self::line_index(addr);
        self.tags[index] = addr & TAG_MASK;
        self.valid[index] = 0;
    }

    pub fn invalidate(&mut self) {
        self.valid = [0; ICACHE_LINES];
        debug!("I-cache invalidated (hits: {}, misses: {})", self.hits, self.misses);
    }

    /// Tag and valid bits of the line `addr` maps to
    pub fn line_state(&self, addr: u32) -> (u32, u8) {
        let index = Self::line_index(addr);
        (self.tags[index], self.valid[index])
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl Default for ICache {
    fn default() -> Self {
        Self::new()
    }
}
