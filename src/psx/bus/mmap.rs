//! Host virtual memory fastmem
//!
//! The whole 32 bit guest space is reserved as one inaccessible host region.
//! RAM lives in a memfd which is mapped at every mirror of every segment and
//! the BIOS is mapped read only, so recompiled code can access
//! `base + guest_address` directly. Everything else stays inaccessible and
//! faults into `fault_handler`.
//!
//! Only available on x86_64 Linux; elsewhere creating either object fails
//! and the bus falls back to the page table.

pub use platform::{MmapArena, SharedMemory};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod platform {
    use std::ffi::CString;
    use std::io;
    use std::ptr;
    use std::slice;

    use libc::{c_int, c_void};

    use crate::error::{PsxError, Result};
    use crate::psx::bus::fault_handler::FaultHandlerGuard;
    use crate::psx::memory_map::{
        BIOS_PHYSICAL_ADDR, BIOS_SIZE, MIRRORED_SEGMENTS, PAGE_SHIFT, PAGE_SIZE, RAM_MIRRORS,
        RAM_SIZE,
    };

    /// Size of the reserved guest space
    const ARENA_SIZE: usize = 1 << 32;

    fn os_error(what: &str) -> PsxError {
        PsxError::FastmemUnavailable(format!("{}: {}", what, io::Error::last_os_error()))
    }

    /// Anonymous shared memory with one read/write view
    pub struct SharedMemory {
        fd: c_int,
        ptr: *mut u8,
        size: usize,
    }

    // SAFETY: the mapping is owned by this value and only reached through it
    unsafe impl Send for SharedMemory {}

    impl SharedMemory {
        pub fn new(name: &str, size: usize) -> Result<Self> {
            let cname = CString::new(name)
                .map_err(|e| PsxError::FastmemUnavailable(e.to_string()))?;

            // SAFETY: plain syscalls, every result is checked
            unsafe {
                let fd = libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC);
                if fd < 0 {
                    return Err(os_error("memfd_create"));
                }
                if libc::ftruncate(fd, size as libc::off_t) != 0 {
                    let err = os_error("ftruncate");
                    libc::close(fd);
                    return Err(err);
                }
                let ptr = libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    let err = os_error("mmap");
                    libc::close(fd);
                    return Err(err);
                }
                Ok(SharedMemory {
                    fd,
                    ptr: ptr as *mut u8,
                    size,
                })
            }
        }

        pub fn as_ptr(&self) -> *mut u8 {
            self.ptr
        }

        pub fn as_slice(&self) -> &[u8] {
            // SAFETY: `ptr` maps `size` readable bytes for our lifetime
            unsafe { slice::from_raw_parts(self.ptr, self.size) }
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            // SAFETY: as above, and we hold the only view handed out
            unsafe { slice::from_raw_parts_mut(self.ptr, self.size) }
        }

        fn map_at(&self, target: *mut u8, protection: c_int) -> Result<()> {
            // SAFETY: `target` lies inside a reservation we own
            let mapped = unsafe {
                libc::mmap(
                    target as *mut c_void,
                    self.size,
                    protection,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    self.fd,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                Err(os_error("mmap(MAP_FIXED)"))
            } else {
                Ok(())
            }
        }
    }

    impl Drop for SharedMemory {
        fn drop(&mut self) {
            // SAFETY: releasing the mapping and descriptor created in `new`
            unsafe {
                libc::munmap(self.ptr as *mut c_void, self.size);
                libc::close(self.fd);
            }
        }
    }

    /// The reserved guest address space
    pub struct MmapArena {
        base: *mut u8,
        bios: SharedMemory,
        _guard: FaultHandlerGuard,
    }

    // SAFETY: see SharedMemory
    unsafe impl Send for MmapArena {}

    impl MmapArena {
        pub fn new(ram: &SharedMemory, bios: &[u8]) -> Result<Self> {
            let guard = FaultHandlerGuard::acquire()?;

            let mut bios_copy = SharedMemory::new("r3000a-bios", BIOS_SIZE as usize)?;
            let len = bios.len().min(BIOS_SIZE as usize);
            bios_copy.as_mut_slice()[..len].copy_from_slice(&bios[..len]);

            // SAFETY: reserving address space only
            let base = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    ARENA_SIZE,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(os_error("reserving the guest address space"));
            }

            let arena = MmapArena {
                base: base as *mut u8,
                bios: bios_copy,
                _guard: guard,
            };

            for segment in MIRRORED_SEGMENTS {
                for mirror in 0..RAM_MIRRORS {
                    ram.map_at(arena.host(segment + mirror * RAM_SIZE), libc::PROT_READ | libc::PROT_WRITE)?;
                }
                arena
                    .bios
                    .map_at(arena.host(segment + BIOS_PHYSICAL_ADDR), libc::PROT_READ)?;
            }

            info!("Fastmem arena reserved at {:p}", arena.base);
            Ok(arena)
        }

        #[inline(always)]
        fn host(&self, guest: u32) -> *mut u8 {
            // SAFETY: every 32 bit offset is inside the reservation
            unsafe { self.base.add(guest as usize) }
        }

        pub fn base(&self) -> *mut u8 {
            self.base
        }

        /// Host address range covered by the arena
        pub fn range(&self) -> (usize, usize) {
            (self.base as usize, self.base as usize + ARENA_SIZE)
        }

        /// Toggle write access to one RAM page on every mirror
        pub fn set_ram_page_writable(&self, page: usize, writable: bool) -> Result<()> {
            let protection = if writable {
                libc::PROT_READ | libc::PROT_WRITE
            } else {
                libc::PROT_READ
            };
            for segment in MIRRORED_SEGMENTS {
                for mirror in 0..RAM_MIRRORS {
                    let guest = segment + mirror * RAM_SIZE + ((page as u32) << PAGE_SHIFT);
                    // SAFETY: the page is one of our RAM mappings
                    let result = unsafe {
                        libc::mprotect(self.host(guest) as *mut c_void, PAGE_SIZE as usize, protection)
                    };
                    if result != 0 {
                        return Err(os_error("mprotect"));
                    }
                }
            }
            Ok(())
        }
    }

    impl Drop for MmapArena {
        fn drop(&mut self) {
            // SAFETY: unmapping the reservation made in `new`
            unsafe {
                libc::munmap(self.base as *mut c_void, ARENA_SIZE);
            }
            debug!("Fastmem arena released");
        }
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod platform {
    use crate::error::{PsxError, Result};

    enum Never {}

    fn unavailable<T>() -> Result<T> {
        Err(PsxError::FastmemUnavailable(
            "host memory mapping not supported on this platform".to_string(),
        ))
    }

    pub struct SharedMemory {
        never: Never,
    }

    impl SharedMemory {
        pub fn new(_name: &str, _size: usize) -> Result<Self> {
            unavailable()
        }

        pub fn as_ptr(&self) -> *mut u8 {
            match self.never {}
        }

        pub fn as_slice(&self) -> &[u8] {
            match self.never {}
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            match self.never {}
        }
    }

    pub struct MmapArena {
        never: Never,
    }

    impl MmapArena {
        pub fn new(_ram: &SharedMemory, _bios: &[u8]) -> Result<Self> {
            unavailable()
        }

        pub fn base(&self) -> *mut u8 {
            match self.never {}
        }

        pub fn range(&self) -> (usize, usize) {
            match self.never {}
        }

        pub fn set_ram_page_writable(&self, _page: usize, _writable: bool) -> Result<()> {
            match self.never {}
        }
    }
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::psx::memory_map::{BIOS_SIZE, RAM_SIZE};

    #[test]
    fn test_ram_mirrors_alias_the_memfd() {
        let mut ram = SharedMemory::new("test-ram", RAM_SIZE as usize).unwrap();
        let bios = vec![0xabu8; BIOS_SIZE as usize];
        let arena = MmapArena::new(&ram, &bios).unwrap();

        ram.as_mut_slice()[0x1234] = 0x5a;
        // SAFETY: reading mapped RAM and BIOS mirrors inside the arena
        unsafe {
            assert_eq!(*arena.base().add(0x8000_1234), 0x5a);
            assert_eq!(*arena.base().add(0xa060_1234), 0x5a);
            assert_eq!(*arena.base().add(0xbfc0_0000), 0xab);
            *arena.base().add(0x0020_1234) = 0x77;
        }
        assert_eq!(ram.as_slice()[0x1234], 0x77);
    }
}
