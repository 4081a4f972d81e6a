//! Basic blocks and the block cache
//!
//! A block is the run of instructions from a start address up to and
//! including the delay slot of the first branch, stopping earlier at an
//! instruction that always leaves the block (syscall, break, RFE, MTC0,
//! reserved opcodes), at the size limit, or before a word that can't be
//! fetched. The cache is keyed by `(pc, mode bits)` and keeps a per RAM page
//! index so a write only drops the blocks it overlaps.

use std::collections::HashMap;

use super::instruction::Instruction;
use crate::psx::bus::{Bus, CodeWrite};
use crate::psx::memory_map::{to_physical_address, RAM_MASK, RAM_PAGE_COUNT, RAM_WINDOW_SIZE};
use crate::psx::memory_map::{ram_page, PAGE_SHIFT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub pc: u32,
    pub mode_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub pc: u32,
    pub word: u32,
    pub instruction: Instruction,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub key: BlockKey,
    pub instructions: Vec<DecodedInstruction>,
    /// A branch sits in the delay slot of the block's last branch
    pub branch_in_delay_slot: bool,
}

impl Block {
    pub fn start(&self) -> u32 {
        self.key.pc
    }

    /// Size of the guest code in bytes
    pub fn byte_len(&self) -> u32 {
        self.instructions.len() as u32 * 4
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Last instruction is a branch's delay slot
    pub fn ends_with_delay_slot(&self) -> bool {
        let n = self.instructions.len();
        n >= 2 && self.instructions[n - 2].instruction.is_branch()
    }
}

/// Anything the cache can hold: it only needs the guest range
pub trait CachedBlock {
    fn start(&self) -> u32;
    fn byte_len(&self) -> u32;
}

impl CachedBlock for Block {
    fn start(&self) -> u32 {
        Block::start(self)
    }

    fn byte_len(&self) -> u32 {
        Block::byte_len(self)
    }
}

/// Decode a block starting at `key.pc`. `None` if the first word can't be
/// fetched, the interpreter then raises the fetch exception.
pub fn build_block(bus: &Bus, key: BlockKey, max_instructions: usize) -> Option<Block> {
    if key.pc & 3 != 0 {
        return None;
    }

    let mut instructions = Vec::new();
    let mut branch_in_delay_slot = false;
    let mut pc = key.pc;
    let mut in_delay_slot = false;

    loop {
        let word = match bus.fetch_word(pc) {
            Ok(word) => word,
            Err(_) => break,
        };
        let instruction = Instruction::decode(word);
        instructions.push(DecodedInstruction {
            pc,
            word,
            instruction,
        });
        pc = pc.wrapping_add(4);

        if in_delay_slot {
            branch_in_delay_slot = instruction.is_branch();
            break;
        }
        if instruction.is_branch() {
            in_delay_slot = true;
            continue;
        }
        if instruction.is_block_exit() || instructions.len() >= max_instructions.max(1) {
            break;
        }
    }

    if instructions.is_empty() {
        None
    } else {
        Some(Block {
            key,
            instructions,
            branch_in_delay_slot,
        })
    }
}

/// RAM offsets `[start, end)` a virtual range maps to, `None` outside RAM
fn ram_range(start: u32, len: u32) -> Option<(u32, u32)> {
    let physical = to_physical_address(start);
    if physical >= RAM_WINDOW_SIZE {
        return None;
    }
    let offset = physical & RAM_MASK;
    Some((offset, offset + len))
}

pub struct BlockCache<B> {
    blocks: HashMap<BlockKey, B>,
    pages: Vec<Vec<BlockKey>>,
}

impl<B: CachedBlock> BlockCache<B> {
    pub fn new() -> Self {
        BlockCache {
            blocks: HashMap::new(),
            pages: vec![Vec::new(); RAM_PAGE_COUNT],
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, key: &BlockKey) -> Option<&B> {
        self.blocks.get(key)
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.blocks.contains_key(key)
    }

    /// Add a block and mark the RAM pages it was decoded from
    pub fn insert(&mut self, bus: &mut Bus, key: BlockKey, block: B) {
        let (start, len) = (block.start(), block.byte_len());
        if let Some(old) = self.blocks.insert(key, block) {
            bus.remove_code_range(old.start(), old.byte_len());
            self.unindex(key, old.start(), old.byte_len());
        }
        bus.add_code_range(start, len);
        for page in Self::pages_of(start, len) {
            self.pages[page].push(key);
        }
    }

    pub fn remove(&mut self, bus: &mut Bus, key: &BlockKey) -> Option<B> {
        let block = self.blocks.remove(key)?;
        bus.remove_code_range(block.start(), block.byte_len());
        self.unindex(*key, block.start(), block.byte_len());
        Some(block)
    }

    /// Drop every block overlapping the written RAM bytes. Returns the
    /// number of blocks removed.
    pub fn invalidate(&mut self, bus: &mut Bus, write: CodeWrite) -> usize {
        let write_end = write.address + write.len;
        let first = (write.address >> PAGE_SHIFT) as usize;
        let last = ((write_end - 1) >> PAGE_SHIFT) as usize;

        let mut doomed = Vec::new();
        for page in first..=last.min(RAM_PAGE_COUNT - 1) {
            for key in &self.pages[page] {
                let Some(block) = self.blocks.get(key) else {
                    continue;
                };
                let Some((start, end)) = ram_range(block.start(), block.byte_len()) else {
                    continue;
                };
                if start < write_end && write.address < end && !doomed.contains(key) {
                    doomed.push(*key);
                }
            }
        }

        for key in &doomed {
            self.remove(bus, key);
        }
        doomed.len()
    }

    /// Remove every block
    pub fn flush(&mut self, bus: &mut Bus) {
        for (_, block) in self.blocks.drain() {
            bus.remove_code_range(block.start(), block.byte_len());
        }
        for page in self.pages.iter_mut() {
            page.clear();
        }
    }

    fn unindex(&mut self, key: BlockKey, start: u32, len: u32) {
        for page in Self::pages_of(start, len) {
            self.pages[page].retain(|k| *k != key);
        }
    }

    fn pages_of(start: u32, len: u32) -> impl Iterator<Item = usize> {
        let pages = ram_range(start, len).map(|(begin, end)| {
            let first = ram_page(begin);
            let last = ((end - 1) >> PAGE_SHIFT) as usize;
            first..last.min(RAM_PAGE_COUNT - 1) + 1
        });
        pages.into_iter().flatten()
    }
}

impl<B: CachedBlock> Default for BlockCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psx::bus::NullPeripherals;

    fn bus_with(words: &[(u32, u32)]) -> Bus {
        let mut bus = Bus::new(Box::new(NullPeripherals));
        for &(addr, word) in words {
            bus.write_ram_bytes(addr, &word.to_le_bytes());
        }
        bus
    }

    fn key(pc: u32) -> BlockKey {
        BlockKey { pc, mode_bits: 0 }
    }

    #[test]
    fn test_block_ends_after_delay_slot() {
        let bus = bus_with(&[
            (0x80001000, 0x24080001), // addiu $t0, $zero, 1
            (0x80001004, 0x1000fffe), // b -2
            (0x80001008, 0x24090002), // addiu $t1, $zero, 2
            (0x8000100c, 0x240a0003),
        ]);
        let block = build_block(&bus, key(0x80001000), 64).unwrap();
        assert_eq!(block.len(), 3);
        assert!(block.ends_with_delay_slot());
        assert!(!block.branch_in_delay_slot);
    }

    #[test]
    fn test_block_stops_at_syscall_and_limit() {
        let bus = bus_with(&[(0x80002008, 0x0000000c)]);
        let block = build_block(&bus, key(0x80002000), 64).unwrap();
        assert_eq!(block.len(), 3);
        let block = build_block(&bus, key(0x80002000), 2).unwrap();
        assert_eq!(block.len(), 2);
        assert!(build_block(&bus, key(0x1f801000), 64).is_none());
    }

    #[test]
    fn test_invalidation_only_drops_overlapping_blocks() {
        let mut bus = bus_with(&[(0x80001008, 0x0000000c), (0x80001018, 0x0000000c)]);
        let mut cache = BlockCache::new();
        let a = build_block(&bus, key(0x80001000), 64).unwrap();
        let b = build_block(&bus, key(0x80001010), 64).unwrap();
        cache.insert(&mut bus, a.key, a);
        cache.insert(&mut bus, b.key, b);
        assert!(bus.is_code_address(0x00001004));

        let removed = cache.invalidate(
            &mut bus,
            CodeWrite {
                address: 0x1014,
                len: 4,
            },
        );
        assert_eq!(removed, 1);
        assert!(cache.contains(&key(0x80001000)));
        assert!(!cache.contains(&key(0x80001010)));

        cache.flush(&mut bus);
        assert!(cache.is_empty());
        assert!(!bus.is_code_address(0x00001004));
    }
}
