//! Registered root ranges, scanned conservatively at collection time.
//!
//! A root is memory outside the collector's heap that may hold heap
//! pointers. Static roots pin a fixed `(ptr, size)` range inside the
//! node itself; dynamic roots indirect through mutator-owned slots that
//! may change between collections. Nodes come from the host allocator,
//! are prepended to a singly linked list and are never removed.

use std::mem;
use std::ptr;

pub(crate) struct Root {
    /// Fixed range start, used by static roots.
    pub ptr: *mut u8,
    /// Fixed range size, used by static roots.
    pub size: usize,
    /// Where to read the range start at scan time.
    pub ptrptr: *const *mut u8,
    /// Where to read the element count at scan time.
    pub sizeptr: *const usize,
    /// Bytes per element behind `sizeptr`.
    pub elemsize: usize,
    pub next: *mut Root,
}

impl Root {
    /// A root whose range never moves. The indirection points back into
    /// the node so the scan path is the same as for dynamic roots.
    pub fn boxed_static(ptr: *mut u8, size: usize) -> Box<Root> {
        let mut root = Box::new(Root {
            ptr,
            size,
            ptrptr: ptr::null(),
            sizeptr: ptr::null(),
            elemsize: 1,
            next: ptr::null_mut(),
        });
        root.ptrptr = &root.ptr;
        root.sizeptr = &root.size;
        root
    }

    /// A root whose range the mutator may retarget or resize in place.
    pub fn boxed_dynamic(
        ptrptr: *const *mut u8,
        sizeptr: *const usize,
        elemsize: usize,
    ) -> Box<Root> {
        Box::new(Root {
            ptr: ptr::null_mut(),
            size: 0,
            ptrptr,
            sizeptr,
            elemsize,
            next: ptr::null_mut(),
        })
    }

    /// Current scan interval as word addresses, trailing partial word
    /// dropped.
    ///
    /// # Safety
    /// `ptrptr` and `sizeptr` must be readable.
    #[inline]
    pub unsafe fn interval(&self) -> (usize, usize) {
        // SAFETY: registration contract keeps the slots alive.
        let start = unsafe { self.ptrptr.read() } as usize;
        if start == 0 {
            return (0, 0);
        }
        // SAFETY: registration contract keeps the slots alive.
        let bytes = unsafe { self.sizeptr.read() } * self.elemsize;
        let word = mem::size_of::<usize>();
        (start, start + bytes / word * word)
    }
}
