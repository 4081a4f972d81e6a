//! Page table fastmem
//!
//! One host pointer per 4KB guest page, split into a read and a write table.
//! A zero entry sends the access down the dispatch path. RAM mirrors in
//! KUSEG, KSEG0 and KSEG1 and the BIOS (read only) are mapped; scratchpad
//! shares its page with I/O and stays on the dispatch path.

use crate::psx::memory_map::{
    BIOS_PHYSICAL_ADDR, BIOS_SIZE, GUEST_PAGE_COUNT, MIRRORED_SEGMENTS, PAGE_OFFSET_MASK,
    PAGE_SHIFT, PAGE_SIZE, RAM_MIRRORS, RAM_PAGE_COUNT, RAM_SIZE,
};

pub struct FastmemLut {
    read: Box<[usize]>,
    write: Box<[usize]>,
    ram_base: usize,
}

impl FastmemLut {
    /// Build tables pointing at `ram` (RAM_SIZE bytes) and `bios`
    /// (BIOS_SIZE bytes). Both buffers must outlive the table.
    pub fn new(ram: *mut u8, bios: *const u8) -> Self {
        let mut lut = FastmemLut {
            read: vec![0usize; GUEST_PAGE_COUNT].into_boxed_slice(),
            write: vec![0usize; GUEST_PAGE_COUNT].into_boxed_slice(),
            ram_base: ram as usize,
        };

        for page in 0..RAM_PAGE_COUNT {
            lut.map_ram_page(page, true);
        }

        for segment in MIRRORED_SEGMENTS {
            for page in 0..(BIOS_SIZE >> PAGE_SHIFT) {
                let vaddr = segment + BIOS_PHYSICAL_ADDR + (page << PAGE_SHIFT);
                lut.read[(vaddr >> PAGE_SHIFT) as usize] =
                    bios as usize + (page * PAGE_SIZE) as usize;
            }
        }

        lut
    }

    fn guest_pages_of_ram_page(page: usize) -> impl Iterator<Item = usize> {
        MIRRORED_SEGMENTS.into_iter().flat_map(move |segment| {
            (0..RAM_MIRRORS).map(move |mirror| {
                let vaddr = segment + mirror * RAM_SIZE + ((page as u32) << PAGE_SHIFT);
                (vaddr >> PAGE_SHIFT) as usize
            })
        })
    }

    fn map_ram_page(&mut self, page: usize, writable: bool) {
        let host = self.ram_base + (page << PAGE_SHIFT);
        for index in Self::guest_pages_of_ram_page(page) {
            self.read[index] = host;
            self.write[index] = if writable { host } else { 0 };
        }
    }

    /// Code pages lose their write entries so stores reach the dispatch
    /// path and get recorded
    pub fn set_ram_page_writable(&mut self, page: usize, writable: bool) {
        self.map_ram_page(page, writable);
    }

    #[inline(always)]
    pub fn read_ptr(&self, addr: u32) -> Option<*const u8> {
        let entry = self.read[(addr >> PAGE_SHIFT) as usize];
        if entry == 0 {
            None
        } else {
            Some((entry + (addr & PAGE_OFFSET_MASK) as usize) as *const u8)
        }
    }

    #[inline(always)]
    pub fn write_ptr(&self, addr: u32) -> Option<*mut u8> {
        let entry = self.write[(addr >> PAGE_SHIFT) as usize];
        if entry == 0 {
            None
        } else {
            Some((entry + (addr & PAGE_OFFSET_MASK) as usize) as *mut u8)
        }
    }

    /// Base of the read table, indexed by `addr >> PAGE_SHIFT`
    pub fn read_table(&self) -> *const usize {
        self.read.as_ptr()
    }

    pub fn write_table(&self) -> *const usize {
        self.write.as_ptr()
    }
}
