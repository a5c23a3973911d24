//! Conservative mark-and-sweep garbage collection for single-threaded
//! 64-bit Unix processes.
//!
//! The collector reserves one huge window of virtual address space at a
//! fixed base and carves it into 768 regions, one fixed size class per
//! region. That layout lets a raw bit pattern be resolved to its chunk
//! base, size and region with a handful of compares and one widening
//! multiply, which is what makes conservative scanning affordable:
//!
//! - Allocation is three-tiered per region: pop the freelist, lazily
//!   rebuild the freelist from the last sweep's mark bitmap, or bump
//!   the frontier into untouched space, committing pages on demand.
//! - Collection scans the machine stack and registered roots word by
//!   word, marks every plausible interior pointer in per-region
//!   bitmaps, and traverses reachable chunks through a bounded
//!   worklist in its own reservation.
//! - Sweeping resets each region's bump frontier past the highest
//!   marked chunk and periodically returns long dead page runs to the
//!   OS; freelists are rebuilt lazily by the allocator.
//!
//! Freelist links are stored bitwise complemented so a conservative
//! scan can never mistake them for live references.
//!
//! The collector is a process-global singleton with a single-threaded
//! contract: one mutator thread, stop-the-world collection inside
//! [`alloc`] or [`collect`], and every live heap pointer resident on
//! the scanned stack or in a registered root whenever collection can
//! run. Error hooks installed with [`set_error_handler`] must not call
//! back into the collector.

mod collector;
mod error;
mod layout;
mod region;
mod roots;
mod system;

pub use collector::{
    alloc, collect, disable, enable, free, free_nonnull, init, last_error, realloc,
    register_dynamic_root, register_root, set_error_handler,
};
pub use error::{Error, ErrorHook};
pub use layout::{
    ALIGNMENT, BASE, BIG_UNIT, HUGE_UNIT, MAX_ROOT_SIZE, NUM_REGIONS, REGION_SIZE,
    base_of, get_ext_tag, get_tag, index_size, is_ptr, set_ext_tag, set_tag, size_of,
    size_to_index, strip_tag,
};
