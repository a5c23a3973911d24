//! Compile-time heap geometry.
//!
//! The collector owns one fixed window of virtual address space,
//! `[BASE, BASE + REGION_SIZE * NUM_REGIONS)`, carved into `NUM_REGIONS`
//! regions of one size class each. Regions come in three bands of equal
//! count: small classes step by [`UNIT`], big classes by [`BIG_UNIT`] and
//! huge classes by [`HUGE_UNIT`]. Everything in this module is pure
//! arithmetic over that window. No table lookups beyond two const-built
//! arrays, no syscalls, and no division on any path the allocator or the
//! marker runs per word.

/// Base address of the reserved window. Every heap pointer lives above it.
pub const BASE: usize = 0x2_0000_0000;
/// Virtual address span owned by a single size-class region.
pub const REGION_SIZE: usize = 4 << 30;
/// Number of size-class regions.
pub const NUM_REGIONS: usize = 768;
/// Alignment of every returned pointer. Low tag bits fit below it.
pub const ALIGNMENT: usize = 16;
/// Page granularity assumed for commit and discard operations.
pub const PAGE_SIZE: usize = 4096;

/// Size step of the small band.
pub const UNIT: usize = ALIGNMENT;
/// Size step of the big band, also the largest small chunk.
pub const BIG_UNIT: usize = (NUM_REGIONS / 3) * UNIT;
/// Size step of the huge band, also the largest big chunk.
pub const HUGE_UNIT: usize = (NUM_REGIONS / 3) * BIG_UNIT;
/// First region index of the big band.
pub const BIG_IDX_OFFSET: usize = NUM_REGIONS / 3;
/// First region index of the huge band.
pub const HUGE_IDX_OFFSET: usize = 2 * NUM_REGIONS / 3;

/// Heap growth factor feeding the collection trigger.
pub const GROWTH_FACTOR: f64 = 1.75;
/// Floor for the collection trigger, in bytes.
pub const MIN_TRIGGER: isize = 100_000;
/// Chunks recovered from the mark bitmap per lazy freelist refill.
pub const FREELIST_REFILL: usize = 256;
/// Pages committed per bump-frontier extension.
pub const PROTECT_GRAIN: usize = 16;
/// Virtual address span reserved for the mark stack.
pub const MARK_STACK_BYTES: usize = 1 << 30;
/// Every n-th sweep returns free pages to the operating system.
pub const RETURN_PERIOD: usize = 8;
/// Largest accepted static root, in bytes.
pub const MAX_ROOT_SIZE: usize = 1 << 30;
/// Children pushed within one mark interval before the scanner dives.
pub const MAX_PUSH_PER_FRAME: u32 = 1024;

/// Total bytes of the reserved window.
pub const HEAP_BYTES: usize = REGION_SIZE * NUM_REGIONS;

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(NUM_REGIONS % 3 == 0);
const _: () = assert!(BASE % REGION_SIZE == 0);
const _: () = assert!(REGION_SIZE % PAGE_SIZE == 0);
const _: () = assert!(MARK_STACK_BYTES % PAGE_SIZE == 0);

/// Band step for a region index.
///
/// The comparisons are strict, so the first index of each upper band
/// (256 and 512) still reports the lower band's step. Those two indices
/// are holes: [`size_to_index`] never produces them.
#[inline(always)]
pub(crate) const fn index_unit(idx: usize) -> usize {
    if idx > BIG_IDX_OFFSET {
        if idx > HUGE_IDX_OFFSET { HUGE_UNIT } else { BIG_UNIT }
    } else {
        UNIT
    }
}

#[inline(always)]
const fn unit_offset(unit: usize) -> usize {
    if unit == UNIT {
        0
    } else if unit == BIG_UNIT {
        BIG_IDX_OFFSET
    } else {
        HUGE_IDX_OFFSET
    }
}

/// Chunk size of region `idx`.
#[inline(always)]
pub const fn index_size(idx: usize) -> usize {
    let unit = index_unit(idx);
    (idx - unit_offset(unit)) * unit + unit
}

/// Reciprocal that divides by `index_size(idx)` through a multiply-high.
#[inline(always)]
pub(crate) const fn index_inv_size(idx: usize) -> u64 {
    u64::MAX / index_size(idx) as u64 + 1
}

const fn build_sizes() -> [usize; NUM_REGIONS] {
    let mut table = [0usize; NUM_REGIONS];
    let mut i = 0;
    while i < NUM_REGIONS {
        table[i] = index_size(i);
        i += 1;
    }
    table
}

const fn build_inv_sizes() -> [u64; NUM_REGIONS] {
    let mut table = [0u64; NUM_REGIONS];
    let mut i = 0;
    while i < NUM_REGIONS {
        table[i] = index_inv_size(i);
        i += 1;
    }
    table
}

/// Per-region chunk sizes, fixed at compile time.
pub(crate) static SIZES: [usize; NUM_REGIONS] = build_sizes();
/// Per-region reciprocals, fixed at compile time.
pub(crate) static INV_SIZES: [u64; NUM_REGIONS] = build_inv_sizes();

/// Region index for a request of `size` bytes.
///
/// `None` when the request exceeds the largest huge class. A zero size
/// wraps and lands in `None` as well. With a constant `size` the whole
/// computation folds to a constant index at the call site.
#[inline(always)]
pub const fn size_to_index(size: usize) -> Option<usize> {
    let s = size.wrapping_sub(1);
    if s < BIG_UNIT {
        Some(s / UNIT)
    } else if s < HUGE_UNIT {
        Some(BIG_IDX_OFFSET + s / BIG_UNIT)
    } else {
        let idx = HUGE_IDX_OFFSET + s / HUGE_UNIT;
        if idx >= NUM_REGIONS { None } else { Some(idx) }
    }
}

/// Window membership as one unsigned comparison. The subtraction wraps
/// for addresses below `BASE`, which pushes them past `HEAP_BYTES`.
#[inline(always)]
pub(crate) const fn addr_is_ptr(addr: usize) -> bool {
    addr.wrapping_sub(BASE) < HEAP_BYTES
}

/// Region index owning `addr`. Meaningful only when `addr_is_ptr`.
#[inline(always)]
pub(crate) const fn region_index(addr: usize) -> usize {
    addr / REGION_SIZE - BASE / REGION_SIZE
}

/// Absolute chunk index of `addr` in its region's size class: the high
/// half of the widening 64x64 product with the precomputed reciprocal.
#[inline(always)]
pub(crate) const fn object_index_with(inv_size: u64, addr: usize) -> u64 {
    ((inv_size as u128 * addr as u128) >> 64) as u64
}

#[inline(always)]
pub(crate) fn object_index(addr: usize) -> u64 {
    object_index_with(INV_SIZES[region_index(addr)], addr)
}

#[inline(always)]
pub(crate) fn base_addr(addr: usize) -> usize {
    object_index(addr) as usize * SIZES[region_index(addr)]
}

/// Complement a freelist link so the conservative scan cannot follow it.
/// The complement of any in-window address lies far outside the window.
#[inline(always)]
pub(crate) const fn hide(addr: usize) -> usize {
    !addr
}

#[inline(always)]
pub(crate) const fn unhide(addr: usize) -> usize {
    !addr
}

// ── Public queries ────────────────────────────────────────────────────

/// Does `ptr` point anywhere inside the reserved heap window?
///
/// Interior pointers and tagged pointers satisfy this; the test does not
/// require chunk alignment.
#[inline(always)]
pub fn is_ptr(ptr: *const u8) -> bool {
    addr_is_ptr(ptr as usize)
}

/// Chunk size backing `ptr`.
///
/// `ptr` must satisfy [`is_ptr`].
#[inline(always)]
pub fn size_of(ptr: *const u8) -> usize {
    debug_assert!(is_ptr(ptr));
    SIZES[region_index(ptr as usize)]
}

/// Start of the chunk containing `ptr`, for any interior pointer.
///
/// `ptr` must satisfy [`is_ptr`].
#[inline(always)]
pub fn base_of(ptr: *const u8) -> *mut u8 {
    debug_assert!(is_ptr(ptr));
    base_addr(ptr as usize) as *mut u8
}

/// Stash `tag` in the alignment bits of a chunk base pointer.
#[inline(always)]
pub fn set_tag(ptr: *mut u8, tag: usize) -> *mut u8 {
    debug_assert!(tag < ALIGNMENT);
    ptr.wrapping_add(tag)
}

/// Tag previously stored with [`set_tag`].
#[inline(always)]
pub fn get_tag(ptr: *const u8) -> usize {
    ptr as usize & (ALIGNMENT - 1)
}

/// Remove the [`set_tag`] bits, recovering the chunk base.
#[inline(always)]
pub fn strip_tag(ptr: *mut u8) -> *mut u8 {
    ptr.wrapping_sub(get_tag(ptr))
}

/// Stash an arbitrary in-object offset in the pointer itself.
///
/// Unlike [`set_tag`] the offset may span the whole chunk; recovery goes
/// through the reciprocal in [`base_of`] rather than a bit mask.
#[inline(always)]
pub fn set_ext_tag(ptr: *mut u8, tag: usize) -> *mut u8 {
    debug_assert!(tag < size_of(ptr));
    ptr.wrapping_add(tag)
}

/// Offset previously stored with [`set_ext_tag`].
#[inline(always)]
pub fn get_ext_tag(ptr: *const u8) -> usize {
    ptr as usize - base_addr(ptr as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_boundaries_match_band_steps() {
        let cases = [
            (1, 16),
            (16, 16),
            (17, 32),
            (32, 32),
            (BIG_UNIT, BIG_UNIT),
            (BIG_UNIT + 1, 2 * BIG_UNIT),
            (HUGE_UNIT, HUGE_UNIT),
            (HUGE_UNIT + 1, 2 * HUGE_UNIT),
        ];
        for (size, want) in cases {
            let idx = size_to_index(size).expect("size in range");
            assert_eq!(index_size(idx), want, "requested {size} bytes");
        }
    }

    #[test]
    fn every_request_fits_its_class() {
        for size in 1..=4 * BIG_UNIT {
            let idx = size_to_index(size).unwrap();
            assert!(index_size(idx) >= size, "size {size} got class {idx}");
            assert!(idx < NUM_REGIONS);
        }
        for size in (HUGE_UNIT..=8 * HUGE_UNIT).step_by(HUGE_UNIT / 3) {
            let idx = size_to_index(size).unwrap();
            assert!(index_size(idx) >= size, "size {size} got class {idx}");
        }
    }

    #[test]
    fn band_boundary_regions_are_holes() {
        // The strict band comparisons leave indices 256 and 512
        // unreachable from size_to_index.
        assert_eq!(size_to_index(BIG_UNIT).unwrap(), BIG_IDX_OFFSET - 1);
        assert_eq!(size_to_index(BIG_UNIT + 1).unwrap(), BIG_IDX_OFFSET + 1);
        assert_eq!(size_to_index(HUGE_UNIT).unwrap(), HUGE_IDX_OFFSET - 1);
        assert_eq!(
            size_to_index(HUGE_UNIT + 1).unwrap(),
            HUGE_IDX_OFFSET + 1
        );
        for size in 1..=2 * BIG_UNIT {
            let idx = size_to_index(size).unwrap();
            assert_ne!(idx, BIG_IDX_OFFSET, "size {size} fell in the hole");
        }
        // The hole still reports the quirky lower-band size.
        assert_eq!(index_size(BIG_IDX_OFFSET), BIG_IDX_OFFSET * UNIT + UNIT);
    }

    #[test]
    fn largest_class_is_the_last_region() {
        assert_eq!(size_to_index(256 * HUGE_UNIT).unwrap(), NUM_REGIONS - 1);
        assert_eq!(size_to_index(256 * HUGE_UNIT + 1), None);
        assert_eq!(size_to_index(0), None);
    }

    #[test]
    fn window_membership_is_exact() {
        assert!(!addr_is_ptr(0));
        assert!(!addr_is_ptr(BASE - 1));
        assert!(addr_is_ptr(BASE));
        assert!(addr_is_ptr(BASE + HEAP_BYTES - 1));
        assert!(!addr_is_ptr(BASE + HEAP_BYTES));
        assert!(!addr_is_ptr(usize::MAX));
    }

    fn region_startptr(idx: usize) -> usize {
        let size = index_size(idx);
        let mut start = BASE + idx * REGION_SIZE;
        let offset = start % size;
        if offset != 0 {
            start += size - offset;
        }
        start
    }

    #[test]
    fn reciprocal_division_is_exact_across_bands() {
        for idx in [0usize, 1, 7, 128, 255, 257, 400, 511, 513, 700, 767] {
            let size = index_size(idx);
            let inv = index_inv_size(idx);
            let start = region_startptr(idx);
            for k in [0usize, 1, 2, 63, 991, 65_535] {
                let chunk = start + k * size;
                if chunk + size > BASE + idx * REGION_SIZE + REGION_SIZE {
                    break;
                }
                for off in [0, 1, size / 2, size - 1] {
                    let p = chunk + off;
                    assert_eq!(
                        object_index_with(inv, p),
                        (chunk / size) as u64,
                        "region {idx} chunk {k} offset {off}"
                    );
                    assert_eq!(base_addr(p), chunk);
                }
            }
        }
    }

    #[test]
    fn base_of_size_of_agree_with_the_class_tables() {
        let idx = 5;
        let size = index_size(idx);
        let chunk = region_startptr(idx) + 17 * size;
        let p = chunk as *const u8;
        assert_eq!(size_of(p), size);
        assert_eq!(base_of(p) as usize, chunk);
        assert_eq!(base_of((chunk + size - 1) as *const u8) as usize, chunk);
    }

    #[test]
    fn tag_round_trip() {
        let base = (region_startptr(3) + 10 * index_size(3)) as *mut u8;
        for tag in 0..ALIGNMENT {
            let tagged = set_tag(base, tag);
            assert_eq!(get_tag(tagged), tag);
            assert_eq!(strip_tag(tagged), base);
        }
    }

    #[test]
    fn ext_tag_recovers_arbitrary_interior_offsets() {
        let idx = 60;
        let size = index_size(idx);
        let base = (region_startptr(idx) + 4 * size) as *mut u8;
        for off in [0, 1, 17, size / 2, size - 1] {
            let tagged = set_ext_tag(base, off);
            assert_eq!(get_ext_tag(tagged), off);
            assert_eq!(base_of(tagged) as usize, base as usize);
        }
    }

    #[test]
    fn hidden_links_never_look_like_heap_pointers() {
        for addr in [
            BASE,
            BASE + ALIGNMENT,
            BASE + REGION_SIZE,
            BASE + HEAP_BYTES - ALIGNMENT,
        ] {
            assert!(addr_is_ptr(addr));
            assert!(!addr_is_ptr(hide(addr)), "hidden {addr:#x} still in window");
            assert_eq!(unhide(hide(addr)), addr);
        }
        assert_eq!(hide(0), usize::MAX);
        assert_eq!(unhide(usize::MAX), 0);
    }
}
