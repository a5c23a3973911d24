//! Stop-the-world conservative mark-and-sweep core.
//!
//! One process-global [`Gc`] owns the region table, the root list and
//! the mark stack reservation. A collection runs in three phases:
//!
//! 1) Mark-init: reserve or reset the per-region mark bitmaps for every
//!    region with a live prefix.
//! 2) Mark: scan the machine stack and every registered root word by
//!    word. Words that pass the window test and the region bounds test
//!    set a mark bit; newly marked chunks are pushed as scan intervals
//!    on a descending mark stack. A depth throttle swaps the current
//!    interval with an older pending one so pointer-dense objects keep
//!    the stack bounded.
//! 3) Sweep: per region, walk chunks downward from the bump frontier,
//!    reset the frontier past the highest marked chunk, hand long runs
//!    of dead pages back to the OS on return sweeps, and leave the mark
//!    bitmap for the allocator to rebuild freelists lazily.
//!
//! Single-threaded contract: exactly one mutator thread uses the
//! collector, and collection happens only inside [`alloc`] or an
//! explicit [`collect`] call.

use std::cell::UnsafeCell;
use std::mem;
use std::process;
use std::ptr;

use log::debug;

use crate::error::{Error, ErrorHook};
use crate::layout::{
    BASE, FREELIST_REFILL, GROWTH_FACTOR, HEAP_BYTES, MARK_STACK_BYTES, MAX_PUSH_PER_FRAME,
    BIG_IDX_OFFSET, MAX_ROOT_SIZE, MIN_TRIGGER, NUM_REGIONS, PAGE_SIZE, PROTECT_GRAIN,
    REGION_SIZE, RETURN_PERIOD, addr_is_ptr, object_index_with, region_index, size_to_index,
};
use crate::region::{self, Region};
use crate::roots::Root;
use crate::system;

/// A `(start, end)` scan interval on the descending mark stack. The
/// frame at the very top of the reservation is the `(0, 0)` sentinel.
#[repr(C)]
#[derive(Clone, Copy)]
struct MarkFrame {
    start: usize,
    end: usize,
}

pub(crate) struct Gc {
    inited: bool,
    enabled: bool,
    /// Highest scanned stack address, fixed per mutator thread at init.
    stackbottom: usize,
    /// Base of the mark stack reservation.
    markstack: usize,
    roots: *mut Root,
    error_hook: Option<ErrorHook>,
    last_error: Option<Error>,
    /// Live prefix bytes across all regions at the last mark-init.
    total_bytes: isize,
    /// Bytes handed out since the last automatic collection.
    alloc_bytes: isize,
    /// Automatic collection fires when `alloc_bytes` reaches this.
    trigger_bytes: isize,
    /// Marked-live bytes counted by the last mark phase.
    used_bytes: isize,
    sweep_count: usize,
    regions: [Region; NUM_REGIONS],
}

impl Gc {
    const fn empty() -> Gc {
        Gc {
            inited: false,
            enabled: true,
            stackbottom: 0,
            markstack: 0,
            roots: ptr::null_mut(),
            error_hook: None,
            last_error: None,
            total_bytes: 0,
            alloc_bytes: 0,
            trigger_bytes: MIN_TRIGGER,
            used_bytes: 0,
            sweep_count: 0,
            regions: [Region::EMPTY; NUM_REGIONS],
        }
    }

    /// Record an error, run the user hook, abort on fatal kinds.
    fn fail(&mut self, err: Error) -> Error {
        self.last_error = Some(err);
        debug!("error [fatal={}] {err}", err.is_fatal());
        if let Some(hook) = self.error_hook {
            hook();
        }
        if err.is_fatal() {
            eprintln!("falx: fatal error ({err})");
            process::abort();
        }
        err
    }

    fn add_root(&mut self, root: Box<Root>) {
        let raw = Box::into_raw(root);
        // SAFETY: raw was just created from a Box.
        unsafe { (*raw).next = self.roots };
        self.roots = raw;
    }

    /// Bump the allocation counter and collect when it crosses the
    /// trigger. The trigger is then resized to the work a mark phase
    /// would do: twice the stack, the root ranges and twice the live
    /// bytes, divided by the growth factor.
    #[inline]
    fn maybe_collect(&mut self, size: usize) {
        self.alloc_bytes += size as isize;
        if self.alloc_bytes >= self.trigger_bytes {
            if !self.enabled {
                return;
            }
            self.collect();
            let stack_bytes = self
                .stackbottom
                .saturating_sub(system::stack_top() as usize);
            let mut scan_bytes = 2 * stack_bytes as isize;
            let mut root = self.roots;
            while !root.is_null() {
                // SAFETY: root nodes are never freed.
                let r = unsafe { &*root };
                // SAFETY: registration contract keeps the slots alive.
                scan_bytes += (unsafe { r.sizeptr.read() } * r.elemsize) as isize;
                root = r.next;
            }
            scan_bytes += 2 * self.used_bytes;
            self.trigger_bytes =
                ((scan_bytes as f64 / GROWTH_FACTOR) as isize).max(MIN_TRIGGER);
            self.alloc_bytes = size as isize;
        }
    }

    fn alloc_index(&mut self, idx: usize) -> *mut u8 {
        let size = self.regions[idx].size;
        self.maybe_collect(size);

        // (1) Freelist pop.
        // SAFETY: freelist chunks are committed and hold valid links.
        if let Some(chunk) = unsafe { self.regions[idx].freelist_pop() } {
            return chunk as *mut u8;
        }

        // (2) Lazy refill from the range the last sweep left behind.
        {
            let region = &mut self.regions[idx];
            if region.markstartptr < region.markendptr {
                let mut chunk = region.markstartptr;
                let mut chunk_idx =
                    object_index_with(region.inv_size, chunk) - region.startidx;
                let bits = region.markptr;
                let mut found = 0;
                while found < FREELIST_REFILL && chunk < region.markendptr {
                    // SAFETY: the bitmap covers the swept prefix.
                    if !unsafe { region::is_marked_index(bits, chunk_idx) } {
                        // SAFETY: the chunk lies below freeptr, hence
                        // committed.
                        unsafe { region.freelist_push(chunk) };
                        found += 1;
                    }
                    chunk += size;
                    chunk_idx += 1;
                }
                region.markstartptr = chunk;
                // SAFETY: as above.
                if let Some(chunk) = unsafe { region.freelist_pop() } {
                    return chunk as *mut u8;
                }
            }
        }

        // (3) Bump from untouched space.
        let chunk = self.regions[idx].freeptr;
        self.regions[idx].freeptr = chunk + size;
        if chunk >= self.regions[idx].endptr {
            self.fail(Error::OutOfRegionSpace);
            return ptr::null_mut();
        }

        // Extend the commit frontier when the chunk crosses it.
        if chunk + size >= self.regions[idx].protectptr {
            let protectptr = self.regions[idx].protectptr;
            let grain = (PROTECT_GRAIN * PAGE_SIZE).max(size);
            if !system::commit(protectptr as *mut u8, grain) {
                debug!("protect failed at {protectptr:#x}");
                self.fail(Error::CommitFailed);
                return ptr::null_mut();
            }
            self.regions[idx].protectptr = protectptr + grain;
        }

        chunk as *mut u8
    }

    unsafe fn realloc(&mut self, old: *mut u8, size: usize) -> *mut u8 {
        let Some(new_idx) = size_to_index(size) else {
            self.fail(Error::HugeSizeOverflow);
            return ptr::null_mut();
        };
        let old_idx = region_index(old as usize);
        if new_idx == old_idx {
            return old;
        }
        let new = self.alloc_index(new_idx);
        if new.is_null() {
            return ptr::null_mut();
        }
        let old_size = self.regions[old_idx].size;
        // SAFETY: both chunks are committed; the copy stays inside the
        // smaller of the two.
        unsafe { ptr::copy_nonoverlapping(old, new, size.min(old_size)) };
        // SAFETY: caller passed ownership of the old chunk.
        unsafe { self.free_nonnull(old) };
        new
    }

    unsafe fn free_nonnull(&mut self, chunk: *mut u8) {
        let idx = region_index(chunk as usize);
        let size = self.regions[idx].size;
        // SAFETY: caller guarantees chunk came from this collector.
        unsafe { self.regions[idx].freelist_push(chunk as usize) };
        self.alloc_bytes -= size as isize;
    }

    #[inline(never)]
    fn collect(&mut self) {
        if !self.inited {
            return;
        }

        debug!("collect [stage=init_marks]");
        self.mark_init();

        debug!("collect [stage=mark] live_prefix={}", self.total_bytes);
        let top = system::stack_top() as usize;
        debug_assert!(top < self.stackbottom, "stack must grow downward");
        let mut stack_root = Root {
            ptr: top as *mut u8,
            size: self.stackbottom - top,
            ptrptr: ptr::null(),
            sizeptr: ptr::null(),
            elemsize: 1,
            next: self.roots,
        };
        stack_root.ptrptr = &stack_root.ptr;
        stack_root.sizeptr = &stack_root.size;
        self.mark(&stack_root);

        debug!("collect [stage=sweep] used={}", self.used_bytes);
        self.sweep();
    }

    /// Reserve or reset the mark bitmap of every region with a live
    /// prefix. Fresh reservations read as zero; reused bitmaps only
    /// clear the prefix that the last cycle could have dirtied.
    fn mark_init(&mut self) {
        self.total_bytes = 0;
        for i in 0..NUM_REGIONS {
            let live = self.regions[i].freeptr - self.regions[i].startptr;
            if live == 0 {
                continue;
            }
            self.total_bytes += live as isize;
            let chunks = live / self.regions[i].size;
            if self.regions[i].markptr.is_null() {
                let marksize = REGION_SIZE / (self.regions[i].size * 8) + PAGE_SIZE;
                let Some(bits) = system::reserve(marksize) else {
                    self.fail(Error::MarkMemoryFailed);
                    return;
                };
                self.regions[i].markptr = bits.as_ptr().cast();
            } else {
                let marksize = chunks.div_ceil(8);
                system::zero(self.regions[i].markptr.cast(), marksize);
            }
        }
    }

    /// Conservative transitive mark over the stack root and the
    /// registered root list.
    fn mark(&mut self, mut roots: *const Root) {
        let top = (self.markstack + MARK_STACK_BYTES) as *mut MarkFrame;
        // SAFETY: the reservation is writable; this touches its last
        // frame slot only.
        let mut stack = unsafe { top.sub(1) };
        unsafe { stack.write(MarkFrame { start: 0, end: 0 }) };

        self.used_bytes = 0;

        loop {
            // SAFETY: stack stays inside the reservation; pushes commit
            // pages on demand.
            let frame = unsafe { stack.read() };
            let (mut word, mut end);
            if frame.start == 0 {
                // Stack drained. Pull the next root interval, keeping
                // the sentinel in place.
                // SAFETY: root nodes are never freed.
                let Some(root) = (unsafe { roots.as_ref() }) else {
                    return;
                };
                // SAFETY: registration contract keeps the slots alive.
                let (start, stop) = unsafe { root.interval() };
                roots = root.next;
                word = start;
                end = stop;
            } else {
                // SAFETY: stack is below the sentinel here.
                stack = unsafe { stack.add(1) };
                word = frame.start;
                end = frame.end;
            }

            let mut pushed: u32 = 0;
            while word < end {
                // SAFETY: the interval is either a committed chunk, a
                // live stack range or a registered root range.
                let value = unsafe { (word as *const usize).read() };
                word += mem::size_of::<usize>();

                if !addr_is_ptr(value) {
                    // Integer noise; one unsigned compare rejects it.
                    continue;
                }
                let idx = region_index(value);
                let r = &self.regions[idx];
                if value >= r.freeptr || value < r.startptr {
                    // Reserved but never allocated; not a chunk.
                    continue;
                }
                let (size, startptr, startidx, inv_size, bits) =
                    (r.size, r.startptr, r.startidx, r.inv_size, r.markptr);

                let chunk_idx = object_index_with(inv_size, value) - startidx;
                // SAFETY: mark_init sized the bitmap for the region.
                if !unsafe { region::mark_index(bits, chunk_idx) } {
                    continue;
                }

                self.used_bytes += size as isize;
                let base = startptr + chunk_idx as usize * size;

                // SAFETY: the reservation bounds worklist growth; each
                // chunk is pushed at most once.
                stack = unsafe { stack.sub(1) };
                unsafe { stack.write(MarkFrame { start: base, end: base + size }) };

                if pushed > MAX_PUSH_PER_FRAME {
                    // Depth throttle: park the rest of this interval
                    // where an old pending frame sits and dive into
                    // that frame instead.
                    // SAFETY: `pushed` frames were pushed above `stack`
                    // within this interval.
                    let swap = unsafe { stack.add(pushed as usize) };
                    let parked = unsafe { swap.read() };
                    unsafe { swap.write(MarkFrame { start: word, end }) };
                    word = parked.start;
                    end = parked.end;
                    pushed = 0;
                }
                pushed += 1;
            }
        }
    }

    /// Reset every touched region's frontier past its highest marked
    /// chunk and hand long dead runs back to the OS on return sweeps.
    fn sweep(&mut self) {
        self.sweep_count += 1;
        let mut returning = self.sweep_count % RETURN_PERIOD == 0;

        for i in 0..NUM_REGIONS {
            if i == BIG_IDX_OFFSET {
                // Big and huge chunks always get page-return attention.
                returning = true;
            }
            let region = &mut self.regions[i];
            if region.freeptr == region.startptr {
                continue;
            }
            let size = region.size;
            let bits = region.markptr;
            let last = region.freeptr - size;
            let mut idx =
                (object_index_with(region.inv_size, last) - region.startidx) as i64;
            let target = idx / 2;
            let mut run_bytes: i64 = 0;
            let mut first = true;

            loop {
                // SAFETY: idx is only tested against the bitmap while
                // inside the live prefix.
                if idx < target
                    || unsafe { region::is_marked_index(bits, idx as u64) }
                {
                    if run_bytes >= 3 * PAGE_SIZE as i64 {
                        // Page-align the interior of the dead run and
                        // drop its physical backing.
                        let mut offset = size * (idx + 1) as usize;
                        let partial = offset % PAGE_SIZE;
                        let pad = if partial == 0 { 0 } else { PAGE_SIZE - partial };
                        offset += pad;
                        let mut bytes = run_bytes as usize - pad;
                        bytes -= bytes % PAGE_SIZE;
                        system::discard((region.startptr + offset) as *mut u8, bytes);
                    }
                    run_bytes = 0;
                    if first {
                        region.freeptr = region.startptr + size * (idx + 1) as usize;
                        if !returning {
                            break;
                        }
                        first = false;
                    }
                    if idx < target {
                        break;
                    }
                } else {
                    run_bytes += size as i64;
                }
                idx -= 1;
            }

            region.markstartptr = region.startptr;
            region.markendptr = region.freeptr;
            region.freelist = 0;
        }
    }
}

struct GcCell(UnsafeCell<Gc>);

// SAFETY: the collector is single-threaded by contract (crate docs);
// all access funnels through the one mutator thread.
unsafe impl Sync for GcCell {}

static GC: GcCell = GcCell(UnsafeCell::new(Gc::empty()));

/// The process-global collector. Callers uphold the single-threaded
/// contract and never let two borrows overlap.
#[inline(always)]
pub(crate) fn gc() -> &'static mut Gc {
    // SAFETY: single mutator thread, no reentrant borrow is live.
    unsafe { &mut *GC.0.get() }
}

// ── Public surface ────────────────────────────────────────────────────

/// Initialise the collector.
///
/// Captures the calling thread's stack bottom, reserves the heap window
/// at [`BASE`] and the mark stack. Must run before any other call.
/// Idempotent with respect to reservations; a repeated call re-anchors
/// the stack bottom to the calling thread.
pub fn init() -> Result<(), Error> {
    let gc = gc();
    if mem::size_of::<*mut u8>() != mem::size_of::<u64>()
        || mem::size_of::<f64>() != mem::size_of::<u64>()
    {
        return Err(gc.fail(Error::UnsupportedPlatform));
    }
    let Some(bottom) = system::stack_bottom() else {
        return Err(gc.fail(Error::StackProbeFailed));
    };
    gc.stackbottom = bottom;
    if gc.inited {
        return Ok(());
    }

    debug!("initializing [window={:#x}..{:#x}]", BASE, BASE + HEAP_BYTES);
    if system::reserve_fixed(BASE, HEAP_BYTES).is_none() {
        return Err(gc.fail(Error::ReserveFailed));
    }
    for i in 0..NUM_REGIONS {
        gc.regions[i] = Region::new(i);
    }
    match system::reserve(MARK_STACK_BYTES) {
        Some(stack) => gc.markstack = stack.as_ptr() as usize,
        None => {
            system::release(BASE as *mut u8, HEAP_BYTES);
            return Err(gc.fail(Error::ReserveFailed));
        }
    }
    gc.inited = true;
    Ok(())
}

/// Resume automatic collection.
pub fn enable() {
    gc().enabled = true;
}

/// Suppress automatic collection. Explicit [`collect`] still runs.
pub fn disable() {
    gc().enabled = false;
}

/// Force a full mark and sweep cycle.
#[inline(never)]
pub fn collect() {
    gc().collect();
}

/// Allocate `size` bytes, [`crate::ALIGNMENT`]-aligned, uninitialised.
///
/// Returns null when the size class is exhausted or a page commit
/// fails; the error is retrievable through [`last_error`]. A request
/// beyond the largest size class is fatal. For a constant `size` the
/// class selection folds away at the call site.
#[inline]
pub fn alloc(size: usize) -> *mut u8 {
    let gc = gc();
    match size_to_index(size) {
        Some(idx) => gc.alloc_index(idx),
        None => {
            gc.fail(Error::HugeSizeOverflow);
            ptr::null_mut()
        }
    }
}

/// Resize an allocation.
///
/// Null `ptr` behaves like [`alloc`]. When the new size maps to the old
/// size class the pointer is returned unchanged; otherwise the contents
/// move and the old chunk is explicitly freed. On failure the old
/// pointer stays valid and null is returned.
///
/// # Safety
/// `ptr` must be null or a chunk base obtained from this collector and
/// not yet freed.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size);
    }
    // SAFETY: forwarded caller contract.
    unsafe { gc().realloc(ptr, size) }
}

/// Explicitly free a chunk. Null is tolerated.
///
/// # Safety
/// `ptr` must be null or a chunk base obtained from this collector,
/// not freed since, and no longer referenced.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: forwarded caller contract.
    unsafe { free_nonnull(ptr) }
}

/// [`free`] without the null check.
///
/// # Safety
/// As [`free`], with `ptr` non-null.
pub unsafe fn free_nonnull(ptr: *mut u8) {
    // SAFETY: forwarded caller contract.
    unsafe { gc().free_nonnull(ptr) }
}

/// Register `[ptr, ptr + size)` as a fixed root range.
///
/// The range is scanned conservatively at every collection. Roots
/// cannot be removed; ranges above [`MAX_ROOT_SIZE`] are rejected.
pub fn register_root(ptr: *mut u8, size: usize) -> Result<(), Error> {
    let gc = gc();
    if size > MAX_ROOT_SIZE {
        return Err(gc.fail(Error::RootTooLarge));
    }
    gc.add_root(Root::boxed_static(ptr, size));
    Ok(())
}

/// Register a root range read through mutator-owned slots.
///
/// At each collection the scanned range is
/// `[*ptrptr, *ptrptr + *sizeptr * elem_size)`; the mutator may update
/// both slots at any time between collections.
///
/// # Safety
/// `ptrptr` and `sizeptr` must stay readable for the life of the
/// process, and the range they describe must stay readable whenever a
/// collection can run.
pub unsafe fn register_dynamic_root(
    ptrptr: *const *mut u8,
    sizeptr: *const usize,
    elem_size: usize,
) -> Result<(), Error> {
    gc().add_root(Root::boxed_dynamic(ptrptr, sizeptr, elem_size));
    Ok(())
}

/// Install or clear the hook that runs on every collector error.
pub fn set_error_handler(hook: Option<ErrorHook>) {
    gc().error_hook = hook;
}

/// The most recent collector error, if any.
pub fn last_error() -> Option<Error> {
    gc().last_error
}
