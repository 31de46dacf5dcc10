//! Reference-counted physical frame table.
//!
//! Every 4 KiB frame of RAM has a 16-bit reference count indexed by frame
//! number. A count of 0 means free; fork raises counts on shared pages and
//! the copy-on-write path lowers them again. A rotating cursor amortizes the
//! linear free-frame scan, and is rewound on release to favor reuse of
//! recently freed frames.

use muon_core::addr::PhysAddr;
use muon_core::paging::{PhysFrame, PAGE_SIZE};
use muon_core::sync::SpinLock;
use muon_core::{kerr, kwarn};

/// Anything that can hand out, share, and release physical frames.
///
/// The page-table manager is written against this trait so that the kernel
/// can pass the global [`FrameTable`] while tests pass a host-backed source.
///
/// # Safety
///
/// Implementations must return frames that are unused, page-aligned, and
/// accessible through the HHDM offset the caller pairs this source with.
pub unsafe trait FrameSource {
    /// Allocates a free frame, setting its reference count to 1.
    fn request_frame(&self) -> Option<PhysFrame>;

    /// Increments the reference count of an allocated frame.
    fn ref_frame(&self, frame: PhysFrame);

    /// Decrements the reference count, freeing the frame at 0.
    /// Returns the new count.
    fn unref_frame(&self, frame: PhysFrame) -> u16;

    /// Returns the current reference count of a frame.
    fn refcount(&self, frame: PhysFrame) -> u16;
}

struct FrameTableInner {
    /// One refcount per frame, indexed by frame number. Lives in the largest
    /// usable region, addressed through the HHDM.
    refcounts: *mut u16,
    /// Number of frames covered by the table.
    frame_count: usize,
    /// Rotating scan cursor for the next allocation.
    cursor: usize,
    /// Bytes currently free.
    free_bytes: u64,
    /// Bytes handed out (or locked) since init.
    used_bytes: u64,
}

// SAFETY: The raw pointer is only dereferenced under the SpinLock.
unsafe impl Send for FrameTableInner {}

impl FrameTableInner {
    fn index_of(&self, frame: PhysFrame) -> Option<usize> {
        let index = frame.number();
        (index < self.frame_count).then_some(index)
    }

    /// # Safety
    ///
    /// `index` must be below `frame_count`.
    unsafe fn count_at(&self, index: usize) -> *mut u16 {
        debug_assert!(index < self.frame_count);
        // SAFETY: Bounds guaranteed by the caller.
        unsafe { self.refcounts.add(index) }
    }
}

/// The physical frame table.
///
/// Interior mutability via [`SpinLock`]; all methods take `&self`.
pub struct FrameTable {
    inner: SpinLock<FrameTableInner>,
}

impl FrameTable {
    /// Creates a frame table over a raw refcount array.
    ///
    /// Every count is initialized to 1 (reserved); call
    /// [`release_region`](Self::release_region) for each usable region and
    /// then [`lock_frames`](Self::lock_frames) on the frames backing the
    /// array itself.
    ///
    /// # Safety
    ///
    /// `refcounts` must point to `frame_count` writable `u16`s that outlive
    /// the table and are not aliased elsewhere.
    pub unsafe fn new(refcounts: *mut u16, frame_count: usize) -> Self {
        for i in 0..frame_count {
            // SAFETY: In bounds by the loop; exclusive access per contract.
            unsafe { refcounts.add(i).write(1) };
        }
        Self {
            inner: SpinLock::new(FrameTableInner {
                refcounts,
                frame_count,
                cursor: 0,
                free_bytes: 0,
                used_bytes: 0,
            }),
        }
    }

    /// Marks every whole frame inside `[base, base + len)` as free.
    ///
    /// Called once per usable memory-map region during bring-up.
    ///
    /// # Safety
    ///
    /// The region must be genuinely unused RAM.
    pub unsafe fn release_region(&self, base: PhysAddr, len: u64) {
        let mut inner = self.inner.lock();
        let first = (base.align_up(PAGE_SIZE as u64).as_u64() / PAGE_SIZE as u64) as usize;
        let count = (len / PAGE_SIZE as u64) as usize;
        for index in first..(first + count).min(inner.frame_count) {
            // SAFETY: Bounded by frame_count above.
            unsafe {
                if *inner.count_at(index) != 0 {
                    *inner.count_at(index) = 0;
                    inner.free_bytes += PAGE_SIZE as u64;
                }
            }
        }
    }

    /// Allocates a single free frame with refcount 1.
    ///
    /// Scans from the rotating cursor, wrapping once. Returns `None` when no
    /// frame is free.
    pub fn request_page(&self) -> Option<PhysFrame> {
        let mut inner = self.inner.lock();
        let start = inner.cursor;
        let total = inner.frame_count;

        for offset in 0..total {
            let index = (start + offset) % total;
            // SAFETY: `index < frame_count` by the modulo.
            unsafe {
                if *inner.count_at(index) != 0 {
                    continue;
                }
                *inner.count_at(index) = 1;
            }
            inner.free_bytes -= PAGE_SIZE as u64;
            inner.used_bytes += PAGE_SIZE as u64;
            inner.cursor = index + 1;
            let phys = PhysAddr::new(index as u64 * PAGE_SIZE as u64);
            return Some(PhysFrame::containing_address(phys));
        }

        None
    }

    /// Increments the reference count of `frame`.
    ///
    /// Referencing a free frame is a bookkeeping bug: logged and skipped.
    /// A saturated count stays at `u16::MAX`.
    pub fn ref_page(&self, frame: PhysFrame) {
        let inner = self.inner.lock();
        let Some(index) = inner.index_of(frame) else {
            kerr!("pmm: ref_page: frame {frame:?} outside the tracked range");
            return;
        };
        // SAFETY: `index` validated against frame_count.
        unsafe {
            let count = inner.count_at(index);
            match *count {
                0 => kerr!("pmm: ref_page: frame {frame:?} has refcount 0"),
                u16::MAX => kwarn!("pmm: ref_page: frame {frame:?} refcount saturated"),
                _ => *count += 1,
            }
        }
    }

    /// Decrements the reference count of `frame`, freeing it at 0.
    ///
    /// Returns the new count. Underflow (unref of a free frame) and frames
    /// outside the tracked range are logged and skipped, returning sentinel
    /// values of 0 and `u16::MAX` respectively.
    pub fn unref_page(&self, frame: PhysFrame) -> u16 {
        let mut inner = self.inner.lock();
        let Some(index) = inner.index_of(frame) else {
            kerr!("pmm: unref_page: frame {frame:?} outside the tracked range");
            return u16::MAX;
        };
        // SAFETY: `index` validated against frame_count.
        let new_count = unsafe {
            let count = inner.count_at(index);
            if *count == 0 {
                kerr!("pmm: unref_page: frame {frame:?} already free");
                return 0;
            }
            *count -= 1;
            *count
        };

        if new_count == 0 {
            inner.free_bytes += PAGE_SIZE as u64;
            inner.used_bytes -= PAGE_SIZE as u64;
            // Rewind the cursor so the next request reuses this frame.
            if inner.cursor > index {
                inner.cursor = index;
            }
        }

        new_count
    }

    /// Returns the reference count of `frame` (`u16::MAX` if untracked).
    pub fn refcount_of(&self, frame: PhysFrame) -> u16 {
        let inner = self.inner.lock();
        match inner.index_of(frame) {
            // SAFETY: `index` validated against frame_count.
            Some(index) => unsafe { *inner.count_at(index) },
            None => u16::MAX,
        }
    }

    /// Reserves a free frame (refcount 0 → 1) without going through the
    /// allocation scan. No-op on frames already in use.
    ///
    /// Bootstrap only: used to pin the frames backing the refcount array.
    pub fn lock_frame(&self, frame: PhysFrame) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.index_of(frame) else {
            return;
        };
        // SAFETY: `index` validated against frame_count.
        unsafe {
            if *inner.count_at(index) == 0 {
                *inner.count_at(index) = 1;
                inner.free_bytes -= PAGE_SIZE as u64;
                inner.used_bytes += PAGE_SIZE as u64;
            }
        }
    }

    /// [`lock_frame`](Self::lock_frame) over `count` consecutive frames.
    pub fn lock_frames(&self, base: PhysFrame, count: usize) {
        for i in 0..count {
            self.lock_frame(base + i as u64);
        }
    }

    /// Bytes of RAM currently free.
    pub fn free_ram(&self) -> u64 {
        self.inner.lock().free_bytes
    }

    /// Bytes of RAM allocated or locked since init.
    pub fn used_ram(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    /// Number of frames covered by the table.
    pub fn frame_count(&self) -> usize {
        self.inner.lock().frame_count
    }
}

// SAFETY: Frames come from regions explicitly released as usable RAM, with
// counts tracked under the lock.
unsafe impl FrameSource for FrameTable {
    fn request_frame(&self) -> Option<PhysFrame> {
        self.request_page()
    }

    fn ref_frame(&self, frame: PhysFrame) {
        self.ref_page(frame);
    }

    fn unref_frame(&self, frame: PhysFrame) -> u16 {
        self.unref_page(frame)
    }

    fn refcount(&self, frame: PhysFrame) -> u16 {
        self.refcount_of(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAMES: usize = 64;

    fn table_with_backing() -> (FrameTable, Vec<u16>) {
        let mut backing = vec![0u16; FRAMES];
        // SAFETY: The backing Vec outlives the table in every test.
        let table = unsafe { FrameTable::new(backing.as_mut_ptr(), FRAMES) };
        // SAFETY: Test frames are synthetic.
        unsafe { table.release_region(PhysAddr::zero(), (FRAMES * PAGE_SIZE) as u64) };
        (table, backing)
    }

    fn frame(index: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new((index * PAGE_SIZE) as u64))
    }

    #[test]
    fn starts_fully_free() {
        let (table, _backing) = table_with_backing();
        assert_eq!(table.free_ram(), (FRAMES * PAGE_SIZE) as u64);
        assert_eq!(table.used_ram(), 0);
    }

    #[test]
    fn request_sets_refcount_one() {
        let (table, _backing) = table_with_backing();
        let f = table.request_page().unwrap();
        assert_eq!(table.refcount_of(f), 1);
        assert_eq!(table.free_ram(), ((FRAMES - 1) * PAGE_SIZE) as u64);
        assert_eq!(table.used_ram(), PAGE_SIZE as u64);
    }

    #[test]
    fn unref_frees_at_zero() {
        let (table, _backing) = table_with_backing();
        let f = table.request_page().unwrap();
        assert_eq!(table.unref_page(f), 0);
        assert_eq!(table.refcount_of(f), 0);
        assert_eq!(table.free_ram(), (FRAMES * PAGE_SIZE) as u64);
    }

    #[test]
    fn shared_frame_survives_one_unref() {
        let (table, _backing) = table_with_backing();
        let f = table.request_page().unwrap();
        table.ref_page(f);
        assert_eq!(table.refcount_of(f), 2);
        assert_eq!(table.unref_page(f), 1);
        assert_eq!(table.refcount_of(f), 1);
        // Still allocated.
        assert_eq!(table.used_ram(), PAGE_SIZE as u64);
    }

    #[test]
    fn cursor_rewinds_to_freed_frame() {
        let (table, _backing) = table_with_backing();
        let a = table.request_page().unwrap();
        let _b = table.request_page().unwrap();
        table.unref_page(a);
        // The freed frame is the next one handed out.
        assert_eq!(table.request_page().unwrap(), a);
    }

    #[test]
    fn exhaustion_returns_none() {
        let (table, _backing) = table_with_backing();
        for _ in 0..FRAMES {
            assert!(table.request_page().is_some());
        }
        assert!(table.request_page().is_none());
        assert_eq!(table.free_ram(), 0);
    }

    #[test]
    fn ref_of_free_frame_is_ignored() {
        let (table, _backing) = table_with_backing();
        let f = frame(3);
        table.ref_page(f);
        assert_eq!(table.refcount_of(f), 0);
    }

    #[test]
    fn unref_of_free_frame_is_ignored() {
        let (table, _backing) = table_with_backing();
        let f = frame(3);
        assert_eq!(table.unref_page(f), 0);
        assert_eq!(table.free_ram(), (FRAMES * PAGE_SIZE) as u64);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let (table, _backing) = table_with_backing();
        let far = frame(FRAMES + 10);
        table.ref_page(far);
        assert_eq!(table.unref_page(far), u16::MAX);
        assert_eq!(table.refcount_of(far), u16::MAX);
    }

    #[test]
    fn lock_frames_reserves_range() {
        let (table, _backing) = table_with_backing();
        table.lock_frames(frame(0), 4);
        assert_eq!(table.free_ram(), ((FRAMES - 4) * PAGE_SIZE) as u64);
        // Locking twice is idempotent.
        table.lock_frames(frame(0), 4);
        assert_eq!(table.free_ram(), ((FRAMES - 4) * PAGE_SIZE) as u64);
        // The locked frames are skipped by allocation.
        let f = table.request_page().unwrap();
        assert!(f.number() >= 4);
    }

    #[test]
    fn free_ram_matches_refcount_census() {
        // Free RAM must equal (frames with refcount 0) * frame size.
        let (table, backing) = table_with_backing();
        let a = table.request_page().unwrap();
        let b = table.request_page().unwrap();
        table.ref_page(a);
        table.ref_page(a);
        table.unref_page(b);
        let zero_count = backing.iter().filter(|&&c| c == 0).count();
        assert_eq!(table.free_ram(), (zero_count * PAGE_SIZE) as u64);
    }

    #[test]
    fn saturated_refcount_stays_saturated() {
        let (table, mut backing) = table_with_backing();
        let f = table.request_page().unwrap();
        // Force the count to the max directly, then ref once more.
        backing[f.number()] = u16::MAX;
        table.ref_page(f);
        assert_eq!(table.refcount_of(f), u16::MAX);
    }
}
