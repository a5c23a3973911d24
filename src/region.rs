//! Per-size-class region records, freelists and mark bitmaps.

use std::ptr;

use crate::layout::{
    BASE, REGION_SIZE, hide, index_inv_size, index_size, object_index_with, unhide,
};

/// One size class of the reserved window.
///
/// The three allocation tiers read these fields in order: the freelist,
/// then the lazily swept `[markstartptr, markendptr)` range, then bump
/// space at `freeptr`, committed up to `protectptr`.
///
/// Invariant between mutator calls:
/// `startptr <= markstartptr <= markendptr <= freeptr <= protectptr`.
#[derive(Clone, Copy)]
pub(crate) struct Region {
    /// Chunk size in bytes.
    pub size: usize,
    /// Reciprocal for the multiply-high chunk index.
    pub inv_size: u64,
    /// Head of the hidden-link freelist, 0 when empty.
    pub freelist: usize,
    /// First chunk address, aligned up to `size`.
    pub startptr: usize,
    /// One past the region's address slice.
    pub endptr: usize,
    /// Bump frontier, one past the last chunk ever allocated.
    pub freeptr: usize,
    /// Commit frontier, one past the last page made accessible.
    pub protectptr: usize,
    /// Next chunk the lazy freelist refill will inspect.
    pub markstartptr: usize,
    /// One past the range the last sweep left for refilling.
    pub markendptr: usize,
    /// Mark bitmap, null until the first collection touches the region.
    pub markptr: *mut u64,
    /// Absolute chunk index of `startptr`, subtracted to get 0-based
    /// indices into the bitmap.
    pub startidx: u64,
}

impl Region {
    pub const EMPTY: Region = Region {
        size: 0,
        inv_size: 0,
        freelist: 0,
        startptr: 0,
        endptr: 0,
        freeptr: 0,
        protectptr: 0,
        markstartptr: 0,
        markendptr: 0,
        markptr: ptr::null_mut(),
        startidx: 0,
    };

    pub fn new(idx: usize) -> Region {
        let size = index_size(idx);
        let inv_size = index_inv_size(idx);
        let mut startptr = BASE + idx * REGION_SIZE;
        let offset = startptr % size;
        if offset != 0 {
            startptr += size - offset;
        }
        Region {
            size,
            inv_size,
            freelist: 0,
            startptr,
            endptr: startptr + REGION_SIZE,
            freeptr: startptr,
            protectptr: startptr,
            markstartptr: startptr,
            markendptr: startptr,
            markptr: ptr::null_mut(),
            startidx: object_index_with(inv_size, startptr),
        }
    }

    /// Push a chunk, hiding the link from the conservative scan.
    ///
    /// # Safety
    /// The chunk's first word must be writable.
    #[inline]
    pub unsafe fn freelist_push(&mut self, chunk: usize) {
        // SAFETY: caller guarantees the chunk is committed.
        unsafe { (chunk as *mut usize).write(hide(self.freelist)) };
        self.freelist = chunk;
    }

    /// Pop the head chunk, unhiding its link.
    ///
    /// # Safety
    /// Every chunk on the list must still hold the link written by
    /// [`Region::freelist_push`].
    #[inline]
    pub unsafe fn freelist_pop(&mut self) -> Option<usize> {
        if self.freelist == 0 {
            return None;
        }
        let chunk = self.freelist;
        // SAFETY: the head was pushed by freelist_push.
        self.freelist = unhide(unsafe { (chunk as *const usize).read() });
        Some(chunk)
    }
}

/// Set the mark bit for chunk `idx`. Returns false when it was already
/// set.
///
/// # Safety
/// `bits` must cover at least `idx + 1` bits.
#[inline(always)]
pub(crate) unsafe fn mark_index(bits: *mut u64, idx: u64) -> bool {
    // SAFETY: caller guarantees the bitmap covers idx.
    let word = unsafe { bits.add((idx / 64) as usize) };
    let mask = 1u64 << (idx % 64);
    // SAFETY: word is inside the bitmap.
    let unit = unsafe { word.read() };
    if unit & mask != 0 {
        return false;
    }
    // SAFETY: word is inside the bitmap.
    unsafe { word.write(unit | mask) };
    true
}

/// Test the mark bit for chunk `idx`.
///
/// # Safety
/// `bits` must cover at least `idx + 1` bits.
#[inline(always)]
pub(crate) unsafe fn is_marked_index(bits: *const u64, idx: u64) -> bool {
    // SAFETY: caller guarantees the bitmap covers idx.
    let unit = unsafe { bits.add((idx / 64) as usize).read() };
    unit & (1u64 << (idx % 64)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::addr_is_ptr;

    #[test]
    fn freelist_is_lifo_and_links_round_trip() {
        let mut backing = [0u64; 64];
        let base = backing.as_mut_ptr() as usize;
        let chunks = [base, base + 64, base + 128];

        let mut region = Region::new(3);
        for &chunk in &chunks {
            unsafe { region.freelist_push(chunk) };
        }
        assert_eq!(unsafe { region.freelist_pop() }, Some(chunks[2]));
        assert_eq!(unsafe { region.freelist_pop() }, Some(chunks[1]));
        assert_eq!(unsafe { region.freelist_pop() }, Some(chunks[0]));
        assert_eq!(unsafe { region.freelist_pop() }, None);
    }

    #[test]
    fn stored_links_are_complemented() {
        let mut backing = [0u64; 16];
        let base = backing.as_mut_ptr() as usize;

        let mut region = Region::new(0);
        unsafe { region.freelist_push(base) };
        unsafe { region.freelist_push(base + 64) };

        // The second chunk's first word holds the hidden link to the
        // first; interpreted as a pointer it must fall outside the
        // heap window.
        let stored = unsafe { ((base + 64) as *const usize).read() };
        assert_eq!(stored, hide(base));
        assert!(!addr_is_ptr(stored));
    }

    #[test]
    fn mark_bits_set_once_and_cross_word_boundaries() {
        let mut words = [0u64; 4];
        let bits = words.as_mut_ptr();
        for idx in [0u64, 1, 63, 64, 127, 200] {
            assert!(unsafe { mark_index(bits, idx) }, "first set of {idx}");
            assert!(!unsafe { mark_index(bits, idx) }, "second set of {idx}");
            assert!(unsafe { is_marked_index(bits, idx) });
        }
        assert!(!unsafe { is_marked_index(bits, 2) });
        assert!(!unsafe { is_marked_index(bits, 65) });
    }

    #[test]
    fn region_geometry_is_aligned_and_ordered() {
        for idx in [0usize, 1, 255, 257, 511, 513, 767] {
            let region = Region::new(idx);
            assert_eq!(region.startptr % region.size, 0, "region {idx}");
            assert!(region.startptr >= BASE + idx * REGION_SIZE);
            assert!(region.startptr - (BASE + idx * REGION_SIZE) < region.size);
            assert_eq!(region.freeptr, region.startptr);
            assert_eq!(region.protectptr, region.startptr);
            assert_eq!(region.markstartptr, region.markendptr);
            assert_eq!(
                region.startidx,
                (region.startptr / region.size) as u64,
                "region {idx} startidx"
            );
        }
    }

    #[test]
    fn layout_module_agrees_with_region_records() {
        let region = Region::new(42);
        assert_eq!(region.size, index_size(42));
        let p = region.startptr + 3 * region.size + 5;
        assert_eq!(
            object_index_with(region.inv_size, p) - region.startidx,
            3
        );
    }
}
