//! Linked-list kernel heap.
//!
//! A doubly-linked chain of segment headers inside a contiguous virtual
//! range. Allocation is first-fit with 16-byte granularity; free segments
//! are split on allocation and coalesced with both neighbours on free.
//! When the list runs dry, a growth callback maps fresh frames at the
//! current end of the range and the new span is folded into the tail.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr;

use muon_core::kerr;
use muon_core::sync::SpinLock;

/// Allocation granularity; payloads are rounded up to a multiple of this.
const GRANULE: usize = 16;

/// A segment header. Lives immediately before its payload; `length` counts
/// payload bytes only.
#[repr(C)]
struct SegmentHeader {
    length: usize,
    next: *mut SegmentHeader,
    prev: *mut SegmentHeader,
    free: bool,
}

/// Header size, padded so payloads stay 16-byte aligned.
const HEADER_SIZE: usize = size_of::<SegmentHeader>();

struct HeapInner {
    /// Start of the managed virtual range.
    start: usize,
    /// One past the end of the managed range; growth extends this.
    end: usize,
    /// Tail segment, for growth coalescing.
    last: *mut SegmentHeader,
    /// Maps `page_count * PAGE_SIZE` fresh bytes at the current end.
    /// Returns the mapped base (== the old end) or `None` on exhaustion.
    grow_fn: Option<fn(usize) -> Option<*mut u8>>,
}

// SAFETY: The raw pointers are only dereferenced under the SpinLock.
unsafe impl Send for HeapInner {}

impl HeapInner {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// The kernel heap allocator.
pub struct KernelHeap {
    inner: SpinLock<HeapInner>,
}

impl KernelHeap {
    /// Creates an uninitialized heap; [`init`](Self::init) must run first.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                start: 0,
                end: 0,
                last: ptr::null_mut(),
                grow_fn: None,
            }),
        }
    }

    /// Installs the initial free segment over `[base, base + size)`.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable, 16-byte aligned, and unused.
    /// Must be called exactly once, before any allocation.
    pub unsafe fn init(&self, base: *mut u8, size: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.start == 0, "heap already initialized");
        debug_assert!(size > HEADER_SIZE + GRANULE, "heap too small");

        inner.start = base as usize;
        inner.end = base as usize + size;

        let first = base as *mut SegmentHeader;
        // SAFETY: The range is mapped and owned per the caller contract.
        unsafe {
            (*first).length = size - HEADER_SIZE;
            (*first).next = ptr::null_mut();
            (*first).prev = ptr::null_mut();
            (*first).free = true;
        }
        inner.last = first;
    }

    /// Registers the growth callback used on exhaustion.
    pub fn set_grow_fn(&self, f: fn(usize) -> Option<*mut u8>) {
        self.inner.lock().grow_fn = Some(f);
    }

    /// Allocates `size` bytes (16-byte aligned). Returns null on size 0 or
    /// exhaustion after a failed growth attempt.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let size = round_up(size, GRANULE);

        let mut inner = self.inner.lock();
        if inner.start == 0 {
            return ptr::null_mut();
        }

        loop {
            if let Some(payload) = Self::first_fit(&inner, size) {
                return payload;
            }
            if !Self::expand(&mut inner, size) {
                return ptr::null_mut();
            }
        }
    }

    /// First-fit scan; splits oversized segments. Returns the payload
    /// pointer or `None`.
    fn first_fit(inner: &HeapInner, size: usize) -> Option<*mut u8> {
        let mut current = inner.start as *mut SegmentHeader;
        while !current.is_null() {
            // SAFETY: Headers are only reachable through the list built by
            // init/expand/split, all within the mapped range.
            unsafe {
                if (*current).free && (*current).length >= size {
                    if (*current).length > size + HEADER_SIZE + GRANULE {
                        split_segment(current, size);
                    }
                    (*current).free = false;
                    return Some((current as *mut u8).add(HEADER_SIZE));
                }
                current = (*current).next;
            }
        }
        None
    }

    /// Grows the heap by at least `needed` payload bytes. Returns `false`
    /// when no growth callback is installed or it fails.
    fn expand(inner: &mut HeapInner, needed: usize) -> bool {
        let Some(grow) = inner.grow_fn else {
            return false;
        };
        let bytes = round_up(needed + HEADER_SIZE, 4096);
        let Some(base) = grow(bytes) else {
            kerr!("heap: growth of {bytes} bytes failed");
            return false;
        };
        debug_assert_eq!(base as usize, inner.end, "heap growth must be contiguous");

        let segment = base as *mut SegmentHeader;
        // SAFETY: The callback mapped `bytes` fresh bytes at `base`.
        unsafe {
            (*segment).length = bytes - HEADER_SIZE;
            (*segment).next = ptr::null_mut();
            (*segment).prev = inner.last;
            (*segment).free = true;
            if !inner.last.is_null() {
                (*inner.last).next = segment;
            }
        }
        inner.end += bytes;
        let previous_tail = inner.last;
        inner.last = segment;

        // Fold the new span into a free tail neighbour.
        // SAFETY: Both headers are live list members.
        unsafe {
            if !previous_tail.is_null() && (*previous_tail).free {
                combine_forward(previous_tail, &mut inner.last);
            }
        }
        true
    }

    /// Frees a payload pointer returned by [`allocate`](Self::allocate).
    ///
    /// Double frees and pointers outside the heap are logged and ignored.
    pub fn free(&self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        let mut inner = self.inner.lock();
        let addr = payload as usize;
        if !inner.contains(addr) || addr < inner.start + HEADER_SIZE {
            kerr!("heap: free of {addr:#x} outside the heap range");
            return;
        }

        let header = (addr - HEADER_SIZE) as *mut SegmentHeader;
        // SAFETY: The payload came from allocate, so a header precedes it.
        unsafe {
            if (*header).free {
                kerr!("heap: double free detected at {addr:#x}");
                return;
            }
            (*header).free = true;
            combine_forward(header, &mut inner.last);
            combine_backward(header, &mut inner.last);
        }
    }

    /// Returns the lengths of the current free segments, in address order.
    /// Test and diagnostics hook.
    pub fn free_segments(&self) -> FreeSegments<'_> {
        FreeSegments {
            _heap: self,
            current: {
                let inner = self.inner.lock();
                inner.start as *mut SegmentHeader
            },
        }
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over `(payload_addr, length)` of free segments.
pub struct FreeSegments<'a> {
    _heap: &'a KernelHeap,
    current: *mut SegmentHeader,
}

impl Iterator for FreeSegments<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        while !self.current.is_null() {
            // SAFETY: List members stay valid for the heap's lifetime.
            unsafe {
                let header = self.current;
                self.current = (*header).next;
                if (*header).free {
                    return Some((header as usize + HEADER_SIZE, (*header).length));
                }
            }
        }
        None
    }
}

/// Splits `header` so its payload is exactly `length`, inserting the
/// remainder after it as a segment with the same free bit.
///
/// # Safety
///
/// `header` must be a live list member with `length + HEADER_SIZE + GRANULE`
/// spare payload bytes.
unsafe fn split_segment(header: *mut SegmentHeader, length: usize) {
    // SAFETY: Caller contract; the remainder lies inside the old payload.
    unsafe {
        let remainder =
            ((header as usize) + HEADER_SIZE + length) as *mut SegmentHeader;
        (*remainder).length = (*header).length - length - HEADER_SIZE;
        (*remainder).free = (*header).free;
        (*remainder).prev = header;
        (*remainder).next = (*header).next;
        if !(*header).next.is_null() {
            (*(*header).next).prev = remainder;
        }
        (*header).next = remainder;
        (*header).length = length;
    }
}

/// Merges `header` with its next neighbour when both are free.
///
/// # Safety
///
/// `header` must be a live list member; `last` must be the heap tail slot.
unsafe fn combine_forward(header: *mut SegmentHeader, last: &mut *mut SegmentHeader) {
    // SAFETY: Caller contract; neighbours are list members.
    unsafe {
        let next = (*header).next;
        if next.is_null() || !(*next).free {
            return;
        }
        if next == *last {
            *last = header;
        }
        if !(*next).next.is_null() {
            (*(*next).next).prev = header;
        }
        (*header).length += (*next).length + HEADER_SIZE;
        (*header).next = (*next).next;
    }
}

/// Merges `header` into its previous neighbour when both are free.
///
/// # Safety
///
/// Same contract as [`combine_forward`].
unsafe fn combine_backward(header: *mut SegmentHeader, last: &mut *mut SegmentHeader) {
    // SAFETY: Caller contract.
    unsafe {
        let prev = (*header).prev;
        if !prev.is_null() && (*prev).free {
            combine_forward(prev, last);
        }
    }
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// SAFETY: allocate/free implement a conformant allocator for alignments up
// to 16; larger alignments are honoured by over-allocating and stashing the
// original payload pointer one word before the aligned address.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= GRANULE {
            return self.allocate(layout.size());
        }

        // Rare path (page-aligned Box and friends): over-allocate and keep
        // the original pointer just below the aligned payload.
        let total = layout.size() + layout.align() + size_of::<usize>();
        let raw = self.allocate(total);
        if raw.is_null() {
            return raw;
        }
        let aligned = round_up(raw as usize + size_of::<usize>(), layout.align());
        // SAFETY: `aligned - 8` lies within the over-allocated block.
        unsafe {
            *((aligned - size_of::<usize>()) as *mut usize) = raw as usize;
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() <= GRANULE {
            self.free(ptr);
            return;
        }
        // SAFETY: `alloc` stored the original pointer below the payload.
        let raw = unsafe { *((ptr as usize - size_of::<usize>()) as *const usize) };
        self.free(raw as *mut u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_test_heap<F: FnOnce(&KernelHeap)>(size: usize, f: F) {
        let layout = Layout::from_size_align(size, GRANULE).unwrap();
        // SAFETY: Standard allocation for the backing region.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let heap = KernelHeap::new();
        // SAFETY: The buffer is mapped, aligned, and exclusively ours.
        unsafe { heap.init(buf, size) };
        f(&heap);
        // SAFETY: Matching layout.
        unsafe { std::alloc::dealloc(buf, layout) };
    }

    #[test]
    fn header_is_two_granules() {
        assert_eq!(HEADER_SIZE, 32);
    }

    #[test]
    fn alloc_zero_returns_null() {
        with_test_heap(4096, |heap| {
            assert!(heap.allocate(0).is_null());
        });
    }

    #[test]
    fn size_rounds_to_sixteen() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(1);
            let b = heap.allocate(1);
            assert_eq!(b as usize - a as usize, GRANULE + HEADER_SIZE);
            heap.free(a);
            heap.free(b);
        });
    }

    #[test]
    fn first_fit_reuses_freed_block() {
        // a = alloc(24); b = alloc(1000); free(a); c = alloc(24) => c == a.
        with_test_heap(8192, |heap| {
            let a = heap.allocate(24);
            let b = heap.allocate(1000);
            assert!(!a.is_null() && !b.is_null());
            heap.free(a);
            let c = heap.allocate(24);
            assert_eq!(c, a);
            heap.free(b);
            heap.free(c);
        });
    }

    #[test]
    fn free_restores_footprint() {
        with_test_heap(8192, |heap| {
            let before: Vec<_> = heap.free_segments().collect();
            let p = heap.allocate(128);
            heap.free(p);
            let after: Vec<_> = heap.free_segments().collect();
            assert_eq!(before, after);
        });
    }

    #[test]
    fn double_free_is_ignored() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(64);
            let b = heap.allocate(64);
            heap.free(a);
            heap.free(a); // logged, ignored
            // The list is still consistent: both blocks reusable.
            heap.free(b);
            let big = heap.allocate(2048);
            assert!(!big.is_null());
            heap.free(big);
        });
    }

    #[test]
    fn foreign_pointer_is_ignored() {
        with_test_heap(4096, |heap| {
            let mut outside = 0u64;
            heap.free(&mut outside as *mut u64 as *mut u8);
            // Heap still works.
            let p = heap.allocate(32);
            assert!(!p.is_null());
            heap.free(p);
        });
    }

    #[test]
    fn adjacent_frees_coalesce() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(64);
            let b = heap.allocate(64);
            let c = heap.allocate(64);
            heap.free(b);
            heap.free(a); // backward merge with b's span
            heap.free(c); // forward merge into the tail
            // Everything back in one segment.
            assert_eq!(heap.free_segments().count(), 1);
        });
    }

    #[test]
    fn coalesce_keeps_neighbour_links() {
        with_test_heap(8192, |heap| {
            let ptrs: Vec<_> = (0..8).map(|_| heap.allocate(48)).collect();
            // Free every other block, then the rest, in reverse.
            for p in ptrs.iter().step_by(2) {
                heap.free(*p);
            }
            for p in ptrs.iter().skip(1).step_by(2).rev() {
                heap.free(*p);
            }
            assert_eq!(heap.free_segments().count(), 1);
            // The single free segment spans the whole heap again.
            let (_, len) = heap.free_segments().next().unwrap();
            assert_eq!(len, 8192 - HEADER_SIZE);
        });
    }

    #[test]
    fn exhaustion_without_growth_returns_null() {
        with_test_heap(256, |heap| {
            let a = heap.allocate(128);
            assert!(!a.is_null());
            assert!(heap.allocate(512).is_null());
            heap.free(a);
        });
    }

    #[test]
    fn global_alloc_honours_large_alignment() {
        with_test_heap(16384, |heap| {
            let layout = Layout::from_size_align(256, 4096).unwrap();
            // SAFETY: Exercising the GlobalAlloc impl directly.
            unsafe {
                let p = heap.alloc(layout);
                assert!(!p.is_null());
                assert_eq!(p as usize % 4096, 0);
                p.write_bytes(0x5A, 256);
                heap.dealloc(p, layout);
            }
            // The heap is whole again.
            assert_eq!(heap.free_segments().count(), 1);
        });
    }
}
