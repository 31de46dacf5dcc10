//! Four-level page-table walking and building via the HHDM.
//!
//! All physical addresses are dereferenced through `hhdm_offset + phys`, so
//! the mapper works identically on the kernel's real direct map and on host
//! buffers in tests (where the "offset" is 0 and "physical" addresses are
//! host pointers).

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::paging::{PageTable, PageTableEntry, PageTableFlags, PAGE_SIZE};

use crate::pmm::FrameSource;

/// Errors from mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame source ran dry while allocating an intermediate table.
    OutOfFrames,
}

/// Walks and builds page tables rooted at a caller-provided PML4.
///
/// Stateless apart from the HHDM offset; the root is passed per call so one
/// mapper serves the kernel master table and every user space.
pub struct PageTableMapper {
    hhdm_offset: u64,
}

impl PageTableMapper {
    /// Creates a mapper for tables reachable at `hhdm_offset + phys`.
    pub const fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    /// Returns the HHDM offset this mapper was built with.
    pub const fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    /// Converts a physical address to its HHDM pointer.
    pub fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        (self.hhdm_offset.wrapping_add(phys.as_u64())) as *mut u8
    }

    /// Returns a mutable reference to the [`PageTable`] at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must point to a valid, page-aligned table accessible through
    /// the HHDM, with no other live references to it.
    pub(crate) unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: Caller contract.
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Ensures `table[index]` points to a next-level table, allocating and
    /// zeroing one if absent. Returns the next-level table's physical
    /// address.
    ///
    /// Existing entries have any missing `intermediate_flags` OR'd in, so a
    /// user mapping below a kernel-created subtree gains the USER bit on the
    /// shared levels.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate_flags: PageTableFlags,
        frames: &dyn FrameSource,
    ) -> Result<PhysAddr, MapError> {
        // SAFETY: Caller guarantees `table_phys` is a valid table.
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            let combined = entry.flags() | intermediate_flags;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            Ok(entry.address())
        } else {
            let frame = frames.request_frame().ok_or(MapError::OutOfFrames)?;
            let phys = frame.start_address();
            // SAFETY: Freshly allocated and HHDM-reachable; zeroing prevents
            // stale bytes from reading as present entries.
            unsafe {
                core::ptr::write_bytes(self.phys_to_virt(phys), 0, PAGE_SIZE);
            }
            table.entries[index] = PageTableEntry::new(phys, intermediate_flags);
            Ok(phys)
        }
    }

    /// Maps the 4 KiB page at `virt` to `phys` in the tree rooted at
    /// `pml4_phys`, allocating intermediate tables on demand.
    ///
    /// Intermediate entries are created `PRESENT | WRITABLE`, plus `USER`
    /// when the leaf flags carry it. Does not flush the TLB.
    ///
    /// # Safety
    ///
    /// - `pml4_phys` must point to a valid PML4.
    /// - The caller is responsible for conflicts with existing mappings and
    ///   for flushing the TLB where the root is live.
    pub unsafe fn map_4k(
        &self,
        pml4_phys: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        frames: &dyn FrameSource,
    ) -> Result<(), MapError> {
        let intermediate = Self::intermediate_flags_for(flags);
        // SAFETY: Propagated caller contract at each level.
        unsafe {
            let pdpt = self.ensure_table(pml4_phys, virt.pml4_index(), intermediate, frames)?;
            let pd = self.ensure_table(pdpt, virt.pdpt_index(), intermediate, frames)?;
            let pt = self.ensure_table(pd, virt.pd_index(), intermediate, frames)?;

            let table = self.table_at(pt);
            table.entries[virt.pt_index()] = PageTableEntry::new(phys, flags);
        }
        Ok(())
    }

    /// Walks all four levels, returning the mapped physical address of
    /// `virt` (leaf base + page offset), or `None` on any non-present entry.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must point to a valid PML4.
    pub unsafe fn translate(&self, pml4_phys: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Caller contract; `pte_of` performs the same walk.
        let entry = unsafe { self.pte_of(pml4_phys, virt)? };
        if !entry.is_present() {
            return None;
        }
        Some(entry.address() + virt.page_offset())
    }

    /// Returns a mutable handle to the leaf entry for `virt`, or `None` if
    /// any level is non-present. This is the copy-on-write fault path's way
    /// in.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must point to a valid PML4; the returned reference
    /// aliases the live table and must be dropped before the next walk.
    pub unsafe fn pte_of(
        &self,
        pml4_phys: PhysAddr,
        virt: VirtAddr,
    ) -> Option<&mut PageTableEntry> {
        // SAFETY: Each level's address comes from a present entry of the
        // previous level, per the caller's root validity contract.
        unsafe {
            let pml4 = self.table_at(pml4_phys);
            let pml4e = pml4.entries[virt.pml4_index()];
            if !pml4e.is_present() {
                return None;
            }

            let pdpt = self.table_at(pml4e.address());
            let pdpte = pdpt.entries[virt.pdpt_index()];
            if !pdpte.is_present() {
                return None;
            }

            let pd = self.table_at(pdpte.address());
            let pde = pd.entries[virt.pd_index()];
            if !pde.is_present() {
                return None;
            }

            let pt = self.table_at(pde.address());
            Some(&mut pt.entries[virt.pt_index()])
        }
    }

    /// Intermediate flags derived from leaf flags: always
    /// `PRESENT | WRITABLE`, plus `USER` when the leaf is user-accessible so
    /// ring 3 can traverse the walk.
    fn intermediate_flags_for(leaf_flags: PageTableFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if leaf_flags.contains(PageTableFlags::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Host-side frame source: hands out page-aligned heap allocations whose
    //! addresses double as "physical" addresses under an HHDM offset of 0.

    use super::*;
    use muon_core::paging::PhysFrame;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::cell::RefCell;
    use std::collections::HashMap;

    pub struct HostFrames {
        counts: RefCell<HashMap<u64, u16>>,
    }

    impl HostFrames {
        pub fn new() -> Self {
            Self {
                counts: RefCell::new(HashMap::new()),
            }
        }

        pub fn layout() -> Layout {
            Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
        }

        pub fn live_frames(&self) -> usize {
            self.counts.borrow().len()
        }
    }

    impl Drop for HostFrames {
        fn drop(&mut self) {
            for (&addr, _) in self.counts.borrow().iter() {
                // SAFETY: Every tracked address came from alloc_zeroed below.
                unsafe { dealloc(addr as *mut u8, Self::layout()) };
            }
        }
    }

    // SAFETY: Frames are freshly allocated page-aligned buffers; with an
    // HHDM offset of 0 their addresses are directly dereferenceable.
    unsafe impl FrameSource for HostFrames {
        fn request_frame(&self) -> Option<PhysFrame> {
            // SAFETY: Valid layout, checked for null below.
            let ptr = unsafe { alloc_zeroed(Self::layout()) };
            if ptr.is_null() {
                return None;
            }
            self.counts.borrow_mut().insert(ptr as u64, 1);
            Some(PhysFrame::containing_address(PhysAddr::new(ptr as u64)))
        }

        fn ref_frame(&self, frame: PhysFrame) {
            let mut counts = self.counts.borrow_mut();
            if let Some(count) = counts.get_mut(&frame.start_address().as_u64()) {
                *count += 1;
            }
        }

        fn unref_frame(&self, frame: PhysFrame) -> u16 {
            let addr = frame.start_address().as_u64();
            let mut counts = self.counts.borrow_mut();
            let Some(count) = counts.get_mut(&addr) else {
                return u16::MAX;
            };
            *count -= 1;
            if *count == 0 {
                counts.remove(&addr);
                // SAFETY: The address came from alloc_zeroed and is no
                // longer referenced.
                unsafe { dealloc(addr as *mut u8, Self::layout()) };
                return 0;
            }
            *count
        }

        fn refcount(&self, frame: PhysFrame) -> u16 {
            *self
                .counts
                .borrow()
                .get(&frame.start_address().as_u64())
                .unwrap_or(&0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::HostFrames;
    use super::*;

    fn user_rw() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER
    }

    #[test]
    fn map_then_translate() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let root = frames.request_frame().unwrap().start_address();
        let target = frames.request_frame().unwrap().start_address();

        let virt = VirtAddr::new(0x40_0000_1000);
        // SAFETY: Host-backed tables.
        unsafe {
            mapper.map_4k(root, virt, target, user_rw(), &frames).unwrap();
            assert_eq!(mapper.translate(root, virt), Some(target));
            assert_eq!(
                mapper.translate(root, virt + 0x123),
                Some(target + 0x123)
            );
        }
    }

    #[test]
    fn unmapped_translates_to_none() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let root = frames.request_frame().unwrap().start_address();
        // SAFETY: Host-backed tables.
        unsafe {
            assert_eq!(mapper.translate(root, VirtAddr::new(0xdead_b000)), None);
            assert!(mapper.pte_of(root, VirtAddr::new(0xdead_b000)).is_none());
        }
    }

    #[test]
    fn intermediate_tables_created_once() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let root = frames.request_frame().unwrap().start_address();
        let a = frames.request_frame().unwrap().start_address();
        let b = frames.request_frame().unwrap().start_address();

        let before = frames.live_frames();
        // SAFETY: Host-backed tables.
        unsafe {
            mapper
                .map_4k(root, VirtAddr::new(0x1000), a, user_rw(), &frames)
                .unwrap();
            let after_first = frames.live_frames();
            // PDPT + PD + PT allocated for the first mapping.
            assert_eq!(after_first - before, 3);

            mapper
                .map_4k(root, VirtAddr::new(0x2000), b, user_rw(), &frames)
                .unwrap();
            // Same subtree reused for the neighbouring page.
            assert_eq!(frames.live_frames(), after_first);
        }
    }

    #[test]
    fn leaf_flags_preserved_and_intermediates_user() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let root = frames.request_frame().unwrap().start_address();
        let target = frames.request_frame().unwrap().start_address();
        let virt = VirtAddr::new(0x7000_0000);

        let leaf = PageTableFlags::PRESENT | PageTableFlags::USER; // read-only
        // SAFETY: Host-backed tables.
        unsafe {
            mapper.map_4k(root, virt, target, leaf, &frames).unwrap();
            let pte = mapper.pte_of(root, virt).unwrap();
            assert_eq!(pte.flags(), leaf);

            // The PML4 entry on the path must be user-traversable.
            let pml4 = mapper.table_at(root);
            let pml4e = pml4.entries[virt.pml4_index()];
            assert!(pml4e.flags().contains(PageTableFlags::USER));
            assert!(pml4e.flags().contains(PageTableFlags::WRITABLE));
        }
    }

    #[test]
    fn pte_of_allows_flag_rewrite() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let root = frames.request_frame().unwrap().start_address();
        let target = frames.request_frame().unwrap().start_address();
        let virt = VirtAddr::new(0x9000);

        // SAFETY: Host-backed tables.
        unsafe {
            mapper.map_4k(root, virt, target, user_rw(), &frames).unwrap();
            let pte = mapper.pte_of(root, virt).unwrap();
            *pte = pte.with_flags(
                PageTableFlags::PRESENT | PageTableFlags::USER | PageTableFlags::COW,
            );

            let reread = mapper.pte_of(root, virt).unwrap();
            assert!(reread.flags().contains(PageTableFlags::COW));
            assert!(!reread.flags().contains(PageTableFlags::WRITABLE));
            assert_eq!(reread.address(), target);
        }
    }
}
