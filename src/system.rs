//! Page-level substrate: reservation, commit, discard and stack probing.
//!
//! The collector reserves address space far in excess of what it ever
//! commits, so every mapping is `MAP_NORESERVE`. Commit is an `mprotect`
//! sweep over the bump frontier, discard is `MADV_DONTNEED`, and the
//! stack bottom comes from the pthread stack bounds of the calling
//! thread.

use std::mem;
use std::ptr::NonNull;

use crate::layout::PAGE_SIZE;

#[cfg(unix)]
mod unix {
    use super::*;
    use core::ffi::c_void;

    const RESERVE_FLAGS: i32 =
        libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;

    pub fn reserve_fixed(addr: usize, len: usize) -> Option<NonNull<u8>> {
        // SAFETY: anonymous mapping, no file descriptor involved.
        let p = unsafe {
            libc::mmap(
                addr as *mut c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                RESERVE_FLAGS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED || p as usize != addr {
            return None;
        }
        NonNull::new(p as *mut u8)
    }

    pub fn reserve(len: usize) -> Option<NonNull<u8>> {
        // SAFETY: anonymous mapping, no file descriptor involved.
        let p = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                RESERVE_FLAGS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(p as *mut u8)
    }

    pub fn release(ptr: *mut u8, len: usize) {
        // SAFETY: ptr must come from reserve or reserve_fixed.
        let _ = unsafe { libc::munmap(ptr as *mut c_void, len) };
    }

    pub fn commit(ptr: *mut u8, len: usize) -> bool {
        let addr = ptr as usize;
        let page = addr / PAGE_SIZE * PAGE_SIZE;
        // SAFETY: the range lies inside an existing reservation.
        let rc = unsafe {
            libc::mprotect(
                page as *mut c_void,
                len + (addr - page),
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        rc == 0
    }

    pub fn discard(ptr: *mut u8, len: usize) {
        // SAFETY: the range lies inside an existing reservation; the
        // next read of a dropped page observes zeros.
        let _ = unsafe {
            libc::madvise(ptr as *mut c_void, len, libc::MADV_DONTNEED)
        };
    }

    #[cfg(target_os = "linux")]
    pub fn zero(ptr: *mut u8, len: usize) {
        discard(ptr, len + PAGE_SIZE);
    }

    #[cfg(not(target_os = "linux"))]
    pub fn zero(ptr: *mut u8, len: usize) {
        // SAFETY: same contract as discard; DONTNEED does not guarantee
        // zero refill everywhere, so overwrite in place instead.
        unsafe { core::ptr::write_bytes(ptr, 0, len + PAGE_SIZE) };
    }

    /// Highest address of the calling thread's stack segment.
    ///
    /// Exact for any thread, main or spawned; any failure along the way
    /// propagates as `None`.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub fn stack_bottom() -> Option<usize> {
        // SAFETY: queries the calling thread only.
        let origin = unsafe {
            let thread = libc::pthread_self();
            let addr = libc::pthread_get_stackaddr_np(thread) as usize;
            let size = libc::pthread_get_stacksize_np(thread);
            if addr == 0 || size == 0 {
                return None;
            }
            // Some libcs report the low end plus size, some the origin
            // itself; the origin is the end above the current probe.
            let probe = stack_top() as usize;
            if addr > probe { addr } else { addr + size }
        };
        Some(origin - mem::size_of::<usize>())
    }

    /// Highest address of the calling thread's stack segment.
    ///
    /// Exact for any thread, main or spawned; any failure along the way
    /// propagates as `None`.
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    pub fn stack_bottom() -> Option<usize> {
        let mut low = core::ptr::null_mut::<c_void>();
        let mut size = 0usize;
        // SAFETY: attr is initialised by pthread_getattr_np and
        // destroyed on every path.
        unsafe {
            let mut attr: libc::pthread_attr_t = mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return None;
            }
            let rc = libc::pthread_attr_getstack(&attr, &mut low, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 || low.is_null() || size == 0 {
                return None;
            }
        }
        Some(low as usize + size - mem::size_of::<usize>())
    }
}

#[cfg(unix)]
pub(crate) use unix::{commit, discard, release, reserve, reserve_fixed, stack_bottom, zero};

/// Address of a local in a frame that is never inlined.
///
/// By the time this runs, anything the caller kept in caller-saved
/// registers has been spilled below the returned address, so a scan of
/// `[stack_top(), stack_bottom)` sees it.
#[inline(never)]
pub(crate) fn stack_top() -> *mut u8 {
    let mut slot = core::ptr::null_mut::<u8>();
    let addr = &mut slot as *mut *mut u8 as *mut u8;
    std::hint::black_box(addr)
}
