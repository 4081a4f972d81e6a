//! Process wide SIGSEGV/SIGBUS handler for the fastmem arena
//!
//! Recompiled code touches the MMap arena with plain host loads and stores.
//! When one of them lands on a protected page (I/O, unmapped space, a RAM
//! page holding compiled code) the handler rewinds the host stack to the
//! guarded call that entered the recompiled code and makes it return 1.
//! Faults outside the arena of the current thread go to whatever handler was
//! installed before us.
//!
//! The handler is installed when the first arena is created and removed when
//! the last one is dropped.

use std::cell::Cell;
use std::ptr;

use crate::error::Result;

/// Saved host state of a guarded call. The offsets are used from inline
/// assembly and must not change.
#[repr(C)]
#[derive(Debug, Default)]
pub struct HostContext {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub resume_rip: u64,
    pub arena_start: usize,
    pub arena_end: usize,
    /// Host address of the last recovered fault
    pub fault_address: usize,
}

thread_local! {
    static CURRENT: Cell<*mut HostContext> = const { Cell::new(ptr::null_mut()) };
}

/// Make `ctx` the recovery target of this thread until the returned value
/// is dropped
pub fn enter(ctx: &mut HostContext) -> ContextScope {
    let previous = CURRENT.with(|c| c.replace(ctx as *mut HostContext));
    ContextScope { previous }
}

pub struct ContextScope {
    previous: *mut HostContext,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

/// Keeps the handler installed while alive
#[derive(Debug)]
pub struct FaultHandlerGuard {
    _private: (),
}

impl FaultHandlerGuard {
    pub fn acquire() -> Result<Self> {
        platform::acquire()?;
        Ok(FaultHandlerGuard { _private: () })
    }

    /// Number of live guards in the process
    pub fn installed_count() -> usize {
        platform::installed_count()
    }
}

impl Drop for FaultHandlerGuard {
    fn drop(&mut self) {
        platform::release();
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod platform {
    use std::mem;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lazy_static::lazy_static;
    use libc::{c_int, c_void, siginfo_t};
    use parking_lot::Mutex;

    use super::{HostContext, CURRENT};
    use crate::error::{PsxError, Result};

    const SIGNALS: [c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

    struct Registry {
        refcount: usize,
        previous: [Option<libc::sigaction>; 2],
    }

    // SAFETY: sigaction is plain data
    unsafe impl Send for Registry {}

    lazy_static! {
        static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
            refcount: 0,
            previous: [None, None],
        });
    }

    // Read from the signal handler, which can't take the registry lock
    static PREVIOUS_ACTION: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];
    static PREVIOUS_FLAGS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

    fn slot(signal: c_int) -> usize {
        if signal == libc::SIGSEGV {
            0
        } else {
            1
        }
    }

    pub fn acquire() -> Result<()> {
        let mut registry = REGISTRY.lock();
        if registry.refcount == 0 {
            for (i, &signal) in SIGNALS.iter().enumerate() {
                // SAFETY: installing a handler with a zeroed, then filled in
                // sigaction struct
                let previous = unsafe {
                    let mut action: libc::sigaction = mem::zeroed();
                    action.sa_sigaction = handle_fault as usize;
                    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
                    libc::sigemptyset(&mut action.sa_mask);

                    let mut previous: libc::sigaction = mem::zeroed();
                    if libc::sigaction(signal, &action, &mut previous) != 0 {
                        return Err(PsxError::FastmemUnavailable(format!(
                            "sigaction({}) failed: {}",
                            signal,
                            std::io::Error::last_os_error()
                        )));
                    }
                    previous
                };
                PREVIOUS_ACTION[i].store(previous.sa_sigaction, Ordering::SeqCst);
                PREVIOUS_FLAGS[i].store(previous.sa_flags as usize, Ordering::SeqCst);
                registry.previous[i] = Some(previous);
            }
            debug!("Fastmem fault handler installed");
        }
        registry.refcount += 1;
        Ok(())
    }

    pub fn release() {
        let mut registry = REGISTRY.lock();
        if registry.refcount == 0 {
            return;
        }
        registry.refcount -= 1;
        if registry.refcount == 0 {
            for (i, &signal) in SIGNALS.iter().enumerate() {
                if let Some(previous) = registry.previous[i].take() {
                    // SAFETY: restoring the action saved by `acquire`
                    unsafe {
                        libc::sigaction(signal, &previous, std::ptr::null_mut());
                    }
                }
            }
            debug!("Fastmem fault handler removed");
        }
    }

    pub fn installed_count() -> usize {
        REGISTRY.lock().refcount
    }

    extern "C" fn handle_fault(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
        let ctx = CURRENT.with(|c| c.get());

        // SAFETY: the kernel hands us valid siginfo and ucontext pointers.
        // `ctx` is set only for the duration of a guarded call on this
        // thread.
        unsafe {
            let address = (*info).si_addr() as usize;
            if !ctx.is_null() && address >= (*ctx).arena_start && address < (*ctx).arena_end {
                let uc = &mut *(context as *mut libc::ucontext_t);
                let gregs = &mut uc.uc_mcontext.gregs;
                gregs[libc::REG_RBX as usize] = (*ctx).rbx as i64;
                gregs[libc::REG_RBP as usize] = (*ctx).rbp as i64;
                gregs[libc::REG_R12 as usize] = (*ctx).r12 as i64;
                gregs[libc::REG_R13 as usize] = (*ctx).r13 as i64;
                gregs[libc::REG_R14 as usize] = (*ctx).r14 as i64;
                gregs[libc::REG_R15 as usize] = (*ctx).r15 as i64;
                gregs[libc::REG_RSP as usize] = (*ctx).rsp as i64;
                gregs[libc::REG_RIP as usize] = (*ctx).resume_rip as i64;
                gregs[libc::REG_RAX as usize] = 1;
                (*ctx).fault_address = address;
                return;
            }

            chain(signal, info, context);
        }
    }

    unsafe fn chain(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
        let i = slot(signal);
        let action = PREVIOUS_ACTION[i].load(Ordering::SeqCst);
        let flags = PREVIOUS_FLAGS[i].load(Ordering::SeqCst) as c_int;

        if action == libc::SIG_DFL || action == libc::SIG_IGN {
            // Returning re-executes the access and the default action runs
            libc::signal(signal, libc::SIG_DFL);
            return;
        }

        if flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                mem::transmute(action);
            handler(signal, info, context);
        } else {
            let handler: extern "C" fn(c_int) = mem::transmute(action);
            handler(signal);
        }
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod platform {
    use crate::error::{PsxError, Result};

    pub fn acquire() -> Result<()> {
        Err(PsxError::FastmemUnavailable(
            "no fault recovery on this host".to_string(),
        ))
    }

    pub fn release() {}

    pub fn installed_count() -> usize {
        0
    }
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn test_guards_are_reference_counted() {
        // other tests may hold arenas concurrently
        let a = FaultHandlerGuard::acquire().unwrap();
        let b = FaultHandlerGuard::acquire().unwrap();
        assert!(FaultHandlerGuard::installed_count() >= 2);
        drop(a);
        assert!(FaultHandlerGuard::installed_count() >= 1);
        drop(b);
    }

    #[test]
    fn test_context_scope_restores_previous() {
        let mut outer = HostContext::default();
        let mut inner = HostContext::default();
        let _a = enter(&mut outer);
        {
            let _b = enter(&mut inner);
            assert_eq!(CURRENT.with(|c| c.get()), &mut inner as *mut HostContext);
        }
        assert_eq!(CURRENT.with(|c| c.get()), &mut outer as *mut HostContext);
    }
}
