//! Memory access layer
//!
//! Every CPU data access and instruction fetch goes through `Bus`. The
//! dispatch path decodes the address region and handles RAM, scratchpad,
//! BIOS, the memory control registers and the cache control register itself;
//! I/O ports and the expansion regions belong to the external `Peripherals`.
//! Unmapped addresses fail with a `BusError` which the CPU turns into a bus
//! error exception.
//!
//! The fastmem strategies only add a faster route to the same bytes: with
//! `FastmemMode::Lut` reads and writes first try the page table, with
//! `FastmemMode::Mmap` recompiled code additionally accesses the host
//! mapping of the guest space directly.

pub mod fault_handler;
pub mod lut;
pub mod mmap;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use self::lut::FastmemLut;
use self::mmap::{MmapArena, SharedMemory};
use super::cache::CacheControl;
use super::memory_control::MemoryControl;
use super::memory_map::*;
use super::{AccessWidth, Addressable};
use crate::config::FastmemMode;
use crate::error::Result;

/// Access to an address nothing answers to
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bus error at {address:#010x}")]
pub struct BusError {
    pub address: u32,
}

/// External memory subsystem: I/O ports and expansion regions
pub trait Peripherals: Send {
    fn read(&mut self, addr: u32, width: AccessWidth) -> std::result::Result<u32, BusError>;
    fn write(
        &mut self,
        addr: u32,
        width: AccessWidth,
        value: u32,
    ) -> std::result::Result<(), BusError>;

    /// Level of the interrupt request line
    fn interrupt_pending(&self) -> bool {
        false
    }
}

/// Open bus: reads return 0, writes are dropped
#[derive(Debug, Default)]
pub struct NullPeripherals;

impl Peripherals for NullPeripherals {
    fn read(&mut self, _addr: u32, _width: AccessWidth) -> std::result::Result<u32, BusError> {
        Ok(0)
    }

    fn write(
        &mut self,
        _addr: u32,
        _width: AccessWidth,
        _value: u32,
    ) -> std::result::Result<(), BusError> {
        Ok(())
    }
}

/// A write that hit a RAM page holding cached or compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeWrite {
    /// Offset into RAM
    pub address: u32,
    pub len: u32,
}

enum RamBacking {
    Heap(Box<[u8]>),
    Shared(SharedMemory),
}

impl RamBacking {
    fn as_slice(&self) -> &[u8] {
        match self {
            RamBacking::Heap(ram) => ram,
            RamBacking::Shared(shm) => shm.as_slice(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            RamBacking::Heap(ram) => ram,
            RamBacking::Shared(shm) => shm.as_mut_slice(),
        }
    }
}

pub struct Bus {
    ram: RamBacking,
    bios: Box<[u8]>,
    scratchpad: Box<[u8]>,
    memory_control: MemoryControl,
    cache_control: CacheControl,
    peripherals: Box<dyn Peripherals>,
    fastmem_mode: FastmemMode,
    lut: Option<FastmemLut>,
    arena: Option<MmapArena>,
    /// Number of live blocks decoded from each RAM page
    code_pages: Box<[u16]>,
    code_writes: Vec<CodeWrite>,
}

impl Bus {
    pub fn new(peripherals: Box<dyn Peripherals>) -> Self {
        Bus {
            ram: RamBacking::Heap(vec![0; RAM_SIZE as usize].into_boxed_slice()),
            bios: vec![0; BIOS_SIZE as usize].into_boxed_slice(),
            scratchpad: vec![0; SCRATCHPAD_SIZE as usize].into_boxed_slice(),
            memory_control: MemoryControl::new(),
            cache_control: CacheControl::default(),
            peripherals,
            fastmem_mode: FastmemMode::Disabled,
            lut: None,
            arena: None,
            code_pages: vec![0; RAM_PAGE_COUNT].into_boxed_slice(),
            code_writes: Vec::new(),
        }
    }

    /// Install a BIOS image. Shorter images are zero padded.
    pub fn load_bios(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > BIOS_SIZE as usize {
            return Err(crate::error::PsxError::ConfigError(format!(
                "BIOS image is {} bytes, at most {} allowed",
                data.len(),
                BIOS_SIZE
            )));
        }
        self.bios.fill(0);
        self.bios[..data.len()].copy_from_slice(data);
        if self.fastmem_mode == FastmemMode::Mmap {
            // the arena holds its own copy of the BIOS
            self.set_fastmem_mode(FastmemMode::Mmap);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fastmem
    // ------------------------------------------------------------------

    pub fn fastmem_mode(&self) -> FastmemMode {
        self.fastmem_mode
    }

    /// Switch fastmem strategy and return the one actually in effect. An
    /// MMap request that can't be satisfied falls back to the LUT.
    /// Code page marks are dropped, callers flush their blocks.
    pub fn set_fastmem_mode(&mut self, mode: FastmemMode) -> FastmemMode {
        self.lut = None;
        self.arena = None;
        self.clear_code_pages();

        let effective = match mode {
            FastmemMode::Disabled => FastmemMode::Disabled,
            FastmemMode::Lut => FastmemMode::Lut,
            FastmemMode::Mmap => match self.create_arena() {
                Ok(arena) => {
                    self.arena = Some(arena);
                    FastmemMode::Mmap
                }
                Err(e) => {
                    warn!("MMap fastmem unavailable ({}), falling back to LUT", e);
                    FastmemMode::Lut
                }
            },
        };

        if effective != FastmemMode::Disabled {
            let ram = self.ram.as_mut_slice().as_mut_ptr();
            self.lut = Some(FastmemLut::new(ram, self.bios.as_ptr()));
        }

        info!("Fastmem mode: {:?}", effective);
        self.fastmem_mode = effective;
        effective
    }

    fn create_arena(&mut self) -> Result<MmapArena> {
        if let RamBacking::Heap(ref heap) = self.ram {
            let mut shared = SharedMemory::new("r3000a-ram", RAM_SIZE as usize)?;
            shared.as_mut_slice().copy_from_slice(heap);
            self.ram = RamBacking::Shared(shared);
        }
        match self.ram {
            RamBacking::Shared(ref shared) => MmapArena::new(shared, &self.bios),
            RamBacking::Heap(_) => unreachable!(),
        }
    }

    /// Host base of the guest space for direct accesses (MMap only)
    pub fn fastmem_base(&self) -> Option<*mut u8> {
        self.arena.as_ref().map(|arena| arena.base())
    }

    /// Host address range a recovered fault must lie in (MMap only)
    pub fn fastmem_range(&self) -> Option<(usize, usize)> {
        self.arena.as_ref().map(|arena| arena.range())
    }

    /// Read and write page tables (LUT and MMap)
    pub fn lut_tables(&self) -> Option<(*const usize, *const usize)> {
        self.lut
            .as_ref()
            .map(|lut| (lut.read_table(), lut.write_table()))
    }

    // ------------------------------------------------------------------
    // Code page tracking
    // ------------------------------------------------------------------

    /// A block was decoded from `[start, start + len)`. Only RAM ranges are
    /// tracked.
    pub fn add_code_range(&mut self, start: u32, len: u32) {
        for page in Self::ram_pages(start, len) {
            self.code_pages[page] += 1;
            if self.code_pages[page] == 1 {
                self.set_page_writable(page, false);
            }
        }
    }

    pub fn remove_code_range(&mut self, start: u32, len: u32) {
        for page in Self::ram_pages(start, len) {
            if self.code_pages[page] == 0 {
                continue;
            }
            self.code_pages[page] -= 1;
            if self.code_pages[page] == 0 {
                self.set_page_writable(page, true);
            }
        }
    }

    pub fn clear_code_pages(&mut self) {
        for page in 0..RAM_PAGE_COUNT {
            if self.code_pages[page] != 0 {
                self.code_pages[page] = 0;
                self.set_page_writable(page, true);
            }
        }
        self.code_writes.clear();
    }

    /// Pages of RAM covered by a virtual range, empty outside RAM
    fn ram_pages(start: u32, len: u32) -> impl Iterator<Item = usize> {
        let physical = to_physical_address(start);
        let in_ram = len != 0 && physical < RAM_WINDOW_SIZE;
        let first = ram_page(physical);
        let last = ram_page(physical.wrapping_add(len.saturating_sub(1)));
        let count = if in_ram {
            (last + RAM_PAGE_COUNT - first) % RAM_PAGE_COUNT + 1
        } else {
            0
        };
        (0..count).map(move |i| (first + i) % RAM_PAGE_COUNT)
    }

    fn set_page_writable(&mut self, page: usize, writable: bool) {
        if let Some(lut) = self.lut.as_mut() {
            lut.set_ram_page_writable(page, writable);
        }
        if let Some(arena) = self.arena.as_ref() {
            if let Err(e) = arena.set_ram_page_writable(page, writable) {
                error!("Failed to change protection of RAM page {}: {}", page, e);
            }
        }
    }

    /// True if a store to `addr` would modify tracked code
    #[inline(always)]
    pub fn is_code_address(&self, addr: u32) -> bool {
        let physical = to_physical_address(addr);
        physical < RAM_WINDOW_SIZE && self.code_pages[ram_page(physical)] != 0
    }

    pub fn has_code_writes(&self) -> bool {
        !self.code_writes.is_empty()
    }

    /// Drain the writes to code pages since the last call
    pub fn take_code_writes(&mut self) -> Vec<CodeWrite> {
        std::mem::take(&mut self.code_writes)
    }

    // ------------------------------------------------------------------
    // Accesses
    // ------------------------------------------------------------------

    /// Data read. `addr` is aligned down to `width`.
    pub fn read(&mut self, addr: u32, width: AccessWidth) -> std::result::Result<u32, BusError> {
        let addr = addr & !(width.bytes() - 1);

        if let Some(ptr) = self.lut.as_ref().and_then(|lut| lut.read_ptr(addr)) {
            // SAFETY: LUT entries point into RAM or BIOS buffers owned by
            // this bus, and the access stays inside one page
            return Ok(unsafe { read_host(ptr, width) });
        }

        self.read_dispatch(addr, width)
    }

    /// Data write. `addr` is aligned down to `width`.
    pub fn write(
        &mut self,
        addr: u32,
        width: AccessWidth,
        value: u32,
    ) -> std::result::Result<(), BusError> {
        let addr = addr & !(width.bytes() - 1);

        if let Some(ptr) = self.lut.as_ref().and_then(|lut| lut.write_ptr(addr)) {
            // SAFETY: as in `read`, write entries only exist for RAM pages
            // without code
            unsafe { write_host(ptr, width, value) };
            return Ok(());
        }

        self.write_dispatch(addr, width, value)
    }

    pub fn load<T: Addressable>(&mut self, addr: u32) -> std::result::Result<T, BusError> {
        self.read(addr, T::width()).map(T::from_u32)
    }

    pub fn store<T: Addressable>(
        &mut self,
        addr: u32,
        value: T,
    ) -> std::result::Result<(), BusError> {
        self.write(addr, T::width(), value.to_u32())
    }

    /// Instruction fetch. Only RAM and BIOS hold code.
    pub fn fetch_word(&self, pc: u32) -> std::result::Result<u32, BusError> {
        let physical = to_physical_address(pc);
        if physical < RAM_WINDOW_SIZE {
            let offset = (physical & RAM_MASK & !3) as usize;
            Ok(LittleEndian::read_u32(&self.ram.as_slice()[offset..]))
        } else if physical.wrapping_sub(BIOS_PHYSICAL_ADDR) < BIOS_SIZE && !is_kseg2(pc) {
            let offset = ((physical - BIOS_PHYSICAL_ADDR) & !3) as usize;
            Ok(LittleEndian::read_u32(&self.bios[offset..]))
        } else {
            Err(BusError { address: pc })
        }
    }

    /// Side effect free word read for the debugger: RAM, BIOS and
    /// scratchpad only
    pub fn peek_word(&self, addr: u32) -> Option<u32> {
        let physical = to_physical_address(addr & !3);
        if physical.wrapping_sub(SCRATCHPAD_ADDR) < SCRATCHPAD_SIZE && !is_kseg1(addr) {
            let offset = (physical - SCRATCHPAD_ADDR) as usize;
            return Some(LittleEndian::read_u32(&self.scratchpad[offset..]));
        }
        self.fetch_word(addr).ok()
    }

    /// Side effect free word write for the debugger and loaders. Writes to
    /// code pages are recorded like any other.
    pub fn poke_word(&mut self, addr: u32, value: u32) -> std::result::Result<(), BusError> {
        let physical = to_physical_address(addr & !3);
        // reachable whatever the cache control enable bits say, like `peek_word`
        if physical.wrapping_sub(SCRATCHPAD_ADDR) < SCRATCHPAD_SIZE && !is_kseg1(addr) {
            let offset = (physical - SCRATCHPAD_ADDR) as usize;
            LittleEndian::write_u32(&mut self.scratchpad[offset..], value);
            return Ok(());
        }
        if physical < RAM_WINDOW_SIZE {
            self.write_dispatch(addr & !3, AccessWidth::Word, value)
        } else {
            Err(BusError { address: addr })
        }
    }

    /// Copy `data` into RAM at `addr`
    pub fn write_ram_bytes(&mut self, addr: u32, data: &[u8]) {
        let base = to_physical_address(addr) & RAM_MASK;
        for (i, &byte) in data.iter().enumerate() {
            let offset = (base + i as u32) & RAM_MASK;
            self.ram.as_mut_slice()[offset as usize] = byte;
        }
        if Self::ram_pages(addr, data.len() as u32).any(|page| self.code_pages[page] != 0) {
            self.code_writes.push(CodeWrite {
                address: base,
                len: data.len() as u32,
            });
        }
    }

    fn read_dispatch(&mut self, addr: u32, width: AccessWidth) -> std::result::Result<u32, BusError> {
        let physical = to_physical_address(addr);

        if is_kseg2(addr) {
            return if addr == CACHE_CONTROL_ADDR {
                Ok(self.cache_control.bits())
            } else {
                Err(BusError { address: addr })
            };
        }

        if physical < RAM_WINDOW_SIZE {
            let offset = (physical & RAM_MASK) as usize;
            return Ok(read_slice(&self.ram.as_slice()[offset..], width));
        }

        if physical.wrapping_sub(SCRATCHPAD_ADDR) < SCRATCHPAD_SIZE {
            if is_kseg1(addr) || !self.cache_control.scratchpad_enabled() {
                return Err(BusError { address: addr });
            }
            let offset = (physical - SCRATCHPAD_ADDR) as usize;
            return Ok(read_slice(&self.scratchpad[offset..], width));
        }

        if physical.wrapping_sub(MEMCTRL_BASE) < MEMCTRL_SIZE {
            let offset = physical - MEMCTRL_BASE;
            let word = self.memory_control.read(offset & !3);
            return Ok(register_lane(word, offset, width));
        }

        if physical & !3 == RAM_SIZE_REG {
            return Ok(register_lane(self.memory_control.ram_size(), physical, width));
        }

        if physical.wrapping_sub(BIOS_PHYSICAL_ADDR) < BIOS_SIZE {
            let offset = (physical - BIOS_PHYSICAL_ADDR) as usize;
            return Ok(read_slice(&self.bios[offset..], width));
        }

        if is_peripheral(physical) {
            return self.peripherals.read(physical, width);
        }

        Err(BusError { address: addr })
    }

    fn write_dispatch(
        &mut self,
        addr: u32,
        width: AccessWidth,
        value: u32,
    ) -> std::result::Result<(), BusError> {
        let physical = to_physical_address(addr);

        if is_kseg2(addr) {
            if addr == CACHE_CONTROL_ADDR {
                self.cache_control = CacheControl::from_bits_retain(value);
                debug!("Cache control = {:#010x}", value);
                return Ok(());
            }
            return Err(BusError { address: addr });
        }

        if physical < RAM_WINDOW_SIZE {
            let offset = physical & RAM_MASK;
            write_slice(&mut self.ram.as_mut_slice()[offset as usize..], width, value);
            if self.code_pages[ram_page(physical)] != 0 {
                self.code_writes.push(CodeWrite {
                    address: offset,
                    len: width.bytes(),
                });
            }
            return Ok(());
        }

        if physical.wrapping_sub(SCRATCHPAD_ADDR) < SCRATCHPAD_SIZE {
            if is_kseg1(addr) || !self.cache_control.scratchpad_enabled() {
                return Err(BusError { address: addr });
            }
            let offset = (physical - SCRATCHPAD_ADDR) as usize;
            write_slice(&mut self.scratchpad[offset..], width, value);
            return Ok(());
        }

        if physical.wrapping_sub(MEMCTRL_BASE) < MEMCTRL_SIZE {
            let offset = physical - MEMCTRL_BASE;
            let word = merge_lane(self.memory_control.read(offset & !3), offset, width, value);
            self.memory_control.write(offset & !3, word);
            return Ok(());
        }

        if physical & !3 == RAM_SIZE_REG {
            let word = merge_lane(self.memory_control.ram_size(), physical, width, value);
            self.memory_control.set_ram_size(word);
            return Ok(());
        }

        if physical.wrapping_sub(BIOS_PHYSICAL_ADDR) < BIOS_SIZE {
            trace!("Ignored BIOS write {:#010x} = {:#x}", addr, value);
            return Ok(());
        }

        if is_peripheral(physical) {
            return self.peripherals.write(physical, width, value);
        }

        Err(BusError { address: addr })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn ram(&self) -> &[u8] {
        self.ram.as_slice()
    }

    pub fn scratchpad(&self) -> &[u8] {
        &self.scratchpad
    }

    pub fn bios(&self) -> &[u8] {
        &self.bios
    }

    /// Replace RAM and scratchpad contents (save state load)
    pub fn restore_memory(&mut self, ram: &[u8], scratchpad: &[u8]) {
        let len = ram.len().min(RAM_SIZE as usize);
        self.ram.as_mut_slice()[..len].copy_from_slice(&ram[..len]);
        let len = scratchpad.len().min(SCRATCHPAD_SIZE as usize);
        self.scratchpad[..len].copy_from_slice(&scratchpad[..len]);
    }

    pub fn memory_control(&self) -> &MemoryControl {
        &self.memory_control
    }

    pub fn set_memory_control(&mut self, memory_control: MemoryControl) {
        self.memory_control = memory_control;
    }

    pub fn cache_control(&self) -> CacheControl {
        self.cache_control
    }

    pub fn set_cache_control(&mut self, control: CacheControl) {
        self.cache_control = control;
    }

    /// Cycles for one uncached instruction word fetch at `pc`
    pub fn fill_ticks(&self, pc: u32) -> super::CycleCount {
        self.memory_control.fetch_ticks(to_physical_address(pc))
    }

    pub fn interrupt_pending(&self) -> bool {
        self.peripherals.interrupt_pending()
    }
}

fn is_peripheral(physical: u32) -> bool {
    physical.wrapping_sub(IO_BASE) < IO_SIZE
        || physical.wrapping_sub(EXP1_BASE) < EXP1_SIZE
        || physical.wrapping_sub(EXP2_BASE) < EXP2_SIZE
        || physical.wrapping_sub(EXP3_BASE) < EXP3_SIZE
}

fn read_slice(bytes: &[u8], width: AccessWidth) -> u32 {
    match width {
        AccessWidth::Byte => bytes[0] as u32,
        AccessWidth::HalfWord => LittleEndian::read_u16(bytes) as u32,
        AccessWidth::Word => LittleEndian::read_u32(bytes),
    }
}

fn write_slice(bytes: &mut [u8], width: AccessWidth, value: u32) {
    match width {
        AccessWidth::Byte => bytes[0] = value as u8,
        AccessWidth::HalfWord => LittleEndian::write_u16(bytes, value as u16),
        AccessWidth::Word => LittleEndian::write_u32(bytes, value),
    }
}

/// Narrow register read: the lane of `word` selected by the address
fn register_lane(word: u32, addr: u32, width: AccessWidth) -> u32 {
    (word >> ((addr & 3) * 8)) & width.value_mask()
}

fn merge_lane(word: u32, addr: u32, width: AccessWidth, value: u32) -> u32 {
    let shift = (addr & 3) * 8;
    let mask = width.value_mask() << shift;
    (word & !mask) | ((value << shift) & mask)
}

/// # Safety
/// `ptr` must be valid for a `width` sized read
#[inline(always)]
unsafe fn read_host(ptr: *const u8, width: AccessWidth) -> u32 {
    match width {
        AccessWidth::Byte => *ptr as u32,
        AccessWidth::HalfWord => u16::from_le((ptr as *const u16).read_unaligned()) as u32,
        AccessWidth::Word => u32::from_le((ptr as *const u32).read_unaligned()),
    }
}

/// # Safety
/// `ptr` must be valid for a `width` sized write
#[inline(always)]
unsafe fn write_host(ptr: *mut u8, width: AccessWidth, value: u32) {
    match width {
        AccessWidth::Byte => *ptr = value as u8,
        AccessWidth::HalfWord => (ptr as *mut u16).write_unaligned((value as u16).to_le()),
        AccessWidth::Word => (ptr as *mut u32).write_unaligned(value.to_le()),
    }
}
