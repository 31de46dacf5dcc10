//! User address-space lifecycle: creation, copy-on-write cloning for fork,
//! the copy-on-write fault resolution, and destruction.
//!
//! Every user root shares the kernel's upper 256 PML4 entries by value and
//! owns its lower-half subtree exclusively. Leaf frames may be shared
//! between spaces, tracked by the frame reference counts.

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::paging::{PageTableEntry, PageTableFlags, PhysFrame, PAGE_SIZE};

use crate::mapper::PageTableMapper;
use crate::pmm::FrameSource;

/// Number of PML4 entries covering the lower (user) half.
const LOWER_HALF_ENTRIES: usize = 256;

/// A user address space, identified by the physical frame of its PML4.
///
/// Plain data: callers own the lifecycle explicitly through
/// [`AddressSpace::destroy`], keeping this crate free of global state.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysFrame,
}

impl AddressSpace {
    /// Wraps an existing root frame.
    pub const fn from_root(root: PhysFrame) -> Self {
        Self { root }
    }

    /// Physical address of the PML4, suitable for CR3.
    pub const fn root_phys(&self) -> PhysAddr {
        self.root.start_address()
    }

    /// Allocates a fresh user root whose upper 256 entries are copied from
    /// the kernel master table and whose lower half is empty.
    ///
    /// # Safety
    ///
    /// `kernel_root` must be the master PML4, valid and HHDM-reachable via
    /// `mapper`.
    pub unsafe fn new_user(
        mapper: &PageTableMapper,
        frames: &dyn FrameSource,
        kernel_root: PhysAddr,
    ) -> Option<Self> {
        let root = frames.request_frame()?;
        // SAFETY: Freshly allocated frame, reachable through the HHDM.
        unsafe {
            core::ptr::write_bytes(mapper.phys_to_virt(root.start_address()), 0, PAGE_SIZE);
            let new_pml4 = mapper.table_at(root.start_address());
            let master = mapper.table_at(kernel_root);
            for i in LOWER_HALF_ENTRIES..512 {
                new_pml4.entries[i] = master.entries[i];
            }
        }
        Some(Self { root })
    }

    /// Clones this space for fork.
    ///
    /// Deep-copies the intermediate tables of the lower half. Every present,
    /// writable leaf is write-protected and marked COW *in both trees* and
    /// its frame's reference count is raised; read-only leaves are shared
    /// as-is. Upper-half entries are copied by value.
    ///
    /// Returns `None` on frame exhaustion; a partially built clone is torn
    /// down before returning. The caller must flush the TLB for this (the
    /// source) space afterwards, since its leaves lost their write bits.
    ///
    /// # Safety
    ///
    /// The space must be valid and not concurrently mutated (single CPU,
    /// caller holds off the scheduler).
    pub unsafe fn clone_cow(
        &self,
        mapper: &PageTableMapper,
        frames: &dyn FrameSource,
    ) -> Option<Self> {
        let new_root = frames.request_frame()?;
        // SAFETY: Fresh frame, HHDM-reachable.
        unsafe {
            core::ptr::write_bytes(mapper.phys_to_virt(new_root.start_address()), 0, PAGE_SIZE);
        }

        // SAFETY: Both roots are valid tables per the caller contract.
        let ok = unsafe {
            let src_pml4 = mapper.table_at(self.root_phys());
            let dst_pml4 = mapper.table_at(new_root.start_address());

            for i in LOWER_HALF_ENTRIES..512 {
                dst_pml4.entries[i] = src_pml4.entries[i];
            }

            let mut ok = true;
            for i in 0..LOWER_HALF_ENTRIES {
                let src_entry = src_pml4.entries[i];
                if !src_entry.is_present() {
                    continue;
                }
                match deep_copy_table(mapper, frames, src_entry.address(), 3) {
                    Some(copy_phys) => {
                        dst_pml4.entries[i] =
                            PageTableEntry::new(copy_phys, src_entry.flags());
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            ok
        };

        let clone = Self { root: new_root };
        if !ok {
            // SAFETY: The partial clone only references frames this function
            // allocated or ref'd; destroying it rebalances both.
            unsafe { clone.destroy(mapper, frames) };
            return None;
        }
        Some(clone)
    }

    /// Tears down a user root: unreferences every lower-half leaf frame
    /// (freeing it when the last reference drops) and frees the
    /// intermediate tables and the root itself. Upper-half entries are the
    /// kernel's and are left alone.
    ///
    /// # Safety
    ///
    /// The root must not be loaded in CR3 and must not be used again.
    pub unsafe fn destroy(self, mapper: &PageTableMapper, frames: &dyn FrameSource) {
        // SAFETY: The root is valid until this call, per the contract.
        unsafe {
            let pml4 = mapper.table_at(self.root_phys());
            for i in 0..LOWER_HALF_ENTRIES {
                let entry = pml4.entries[i];
                if entry.is_present() {
                    destroy_table(mapper, frames, entry.address(), 3);
                }
            }
        }
        frames.unref_frame(self.root);
    }
}

/// Recursively deep-copies an intermediate table for [`AddressSpace::clone_cow`].
///
/// `level` counts down: 3 = PDPT, 2 = PD, 1 = PT (whose entries are leaves).
/// At the leaf level, writable entries in the *source* are downgraded to
/// COW, the entry is copied by value, and the target frame is referenced.
///
/// # Safety
///
/// `src_phys` must be a valid table of the given level, HHDM-reachable.
unsafe fn deep_copy_table(
    mapper: &PageTableMapper,
    frames: &dyn FrameSource,
    src_phys: PhysAddr,
    level: u8,
) -> Option<PhysAddr> {
    let dst_frame = frames.request_frame()?;
    let dst_phys = dst_frame.start_address();
    // SAFETY: Fresh frame, HHDM-reachable.
    unsafe {
        core::ptr::write_bytes(mapper.phys_to_virt(dst_phys), 0, PAGE_SIZE);
    }

    // SAFETY: Caller contract for src, fresh allocation for dst.
    unsafe {
        let src = mapper.table_at(src_phys);
        let dst = mapper.table_at(dst_phys);

        for i in 0..512 {
            let entry = src.entries[i];
            if !entry.is_present() {
                continue;
            }

            if level == 1 {
                if entry.flags().contains(PageTableFlags::WRITABLE) {
                    let downgraded = entry.flags()
                        .difference(PageTableFlags::WRITABLE)
                        .union(PageTableFlags::COW);
                    src.entries[i] = entry.with_flags(downgraded);
                }
                dst.entries[i] = src.entries[i];
                frames.ref_frame(PhysFrame::containing_address(entry.address()));
            } else {
                let child = deep_copy_table(mapper, frames, entry.address(), level - 1);
                let Some(child_phys) = child else {
                    // Unwind the partial copy: everything linked into dst so
                    // far is complete and rebalances through a destroy walk.
                    destroy_table(mapper, frames, dst_phys, level);
                    return None;
                };
                dst.entries[i] = PageTableEntry::new(child_phys, entry.flags());
            }
        }
    }

    Some(dst_phys)
}

/// Recursively frees an intermediate table and unreferences its leaves.
///
/// # Safety
///
/// `table_phys` must be a valid table of the given level, owned by the space
/// being destroyed.
unsafe fn destroy_table(
    mapper: &PageTableMapper,
    frames: &dyn FrameSource,
    table_phys: PhysAddr,
    level: u8,
) {
    // SAFETY: Caller contract.
    unsafe {
        let table = mapper.table_at(table_phys);
        for i in 0..512 {
            let entry = table.entries[i];
            if !entry.is_present() {
                continue;
            }
            if level > 1 {
                destroy_table(mapper, frames, entry.address(), level - 1);
            } else {
                frames.unref_frame(PhysFrame::containing_address(entry.address()));
            }
        }
    }
    frames.unref_frame(PhysFrame::containing_address(table_phys));
}

/// Outcome of [`resolve_cow_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowOutcome {
    /// The entry was made writable (or re-pointed at a private copy); the
    /// caller must invalidate the TLB for the faulting address.
    Handled,
    /// The entry is not a COW mapping; the fault has another cause.
    NotCow,
    /// A private copy was needed but no frame was available.
    OutOfFrames,
}

/// Resolves a write fault against a copy-on-write leaf in the tree rooted at
/// `root`.
///
/// If the leaf's frame has a reference count of exactly 1, the entry is made
/// writable in place (the last sharer owns it). Otherwise a fresh frame is
/// allocated, the page contents are copied, the shared frame is
/// unreferenced, and the entry is rewritten to the private copy.
///
/// # Safety
///
/// `root` must be the currently faulting address space's valid PML4.
pub unsafe fn resolve_cow_fault(
    mapper: &PageTableMapper,
    frames: &dyn FrameSource,
    root: PhysAddr,
    fault_addr: VirtAddr,
) -> CowOutcome {
    // SAFETY: Caller contract.
    let Some(pte) = (unsafe { mapper.pte_of(root, fault_addr) }) else {
        return CowOutcome::NotCow;
    };

    if !pte.is_present() || !pte.flags().contains(PageTableFlags::COW) {
        return CowOutcome::NotCow;
    }

    let shared = PhysFrame::containing_address(pte.address());
    let writable = pte
        .flags()
        .difference(PageTableFlags::COW)
        .union(PageTableFlags::WRITABLE);

    if frames.refcount(shared) == 1 {
        // Sole owner: flip the bits, no copy.
        *pte = pte.with_flags(writable);
        return CowOutcome::Handled;
    }

    let Some(private) = frames.request_frame() else {
        return CowOutcome::OutOfFrames;
    };

    // SAFETY: Both frames are HHDM-reachable; the source page is mapped and
    // the destination was just allocated.
    unsafe {
        core::ptr::copy_nonoverlapping(
            mapper.phys_to_virt(shared.start_address()),
            mapper.phys_to_virt(private.start_address()),
            PAGE_SIZE,
        );
    }

    frames.unref_frame(shared);
    *pte = PageTableEntry::new(private.start_address(), writable);
    CowOutcome::Handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::test_support::HostFrames;

    fn user_rw() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER
    }

    /// Builds a "kernel master" root with one fake upper-half entry so the
    /// shared-upper-half copy is observable.
    fn master_root(mapper: &PageTableMapper, frames: &HostFrames) -> PhysAddr {
        let root = frames.request_frame().unwrap().start_address();
        // SAFETY: Host-backed table.
        unsafe {
            let table = mapper.table_at(root);
            table.entries[256] = PageTableEntry::new(
                PhysAddr::new(0x1234_5000),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
        }
        root
    }

    /// Writes a byte into a mapped user page through the fake HHDM.
    unsafe fn poke(mapper: &PageTableMapper, root: PhysAddr, virt: VirtAddr, value: u8) {
        // SAFETY: Test pages are host buffers.
        unsafe {
            let phys = mapper.translate(root, virt).unwrap();
            *mapper.phys_to_virt(phys) = value;
        }
    }

    unsafe fn peek(mapper: &PageTableMapper, root: PhysAddr, virt: VirtAddr) -> u8 {
        // SAFETY: Test pages are host buffers.
        unsafe {
            let phys = mapper.translate(root, virt).unwrap();
            *mapper.phys_to_virt(phys)
        }
    }

    #[test]
    fn new_user_shares_upper_half() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let master = master_root(&mapper, &frames);

        // SAFETY: Host-backed tables throughout.
        unsafe {
            let space = AddressSpace::new_user(&mapper, &frames, master).unwrap();
            let pml4 = mapper.table_at(space.root_phys());
            assert!(pml4.entries[256].is_present());
            assert_eq!(pml4.entries[256].address().as_u64(), 0x1234_5000);
            for i in 0..256 {
                assert!(!pml4.entries[i].is_present());
            }
            space.destroy(&mapper, &frames);
        }
    }

    #[test]
    fn clone_write_protects_both_trees() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let master = master_root(&mapper, &frames);
        let virt = VirtAddr::new(0x40_0000);

        // SAFETY: Host-backed tables throughout.
        unsafe {
            let parent = AddressSpace::new_user(&mapper, &frames, master).unwrap();
            let page = frames.request_frame().unwrap().start_address();
            mapper
                .map_4k(parent.root_phys(), virt, page, user_rw(), &frames)
                .unwrap();

            let child = parent.clone_cow(&mapper, &frames).unwrap();

            for root in [parent.root_phys(), child.root_phys()] {
                let pte = mapper.pte_of(root, virt).unwrap();
                assert!(pte.flags().contains(PageTableFlags::COW));
                assert!(!pte.flags().contains(PageTableFlags::WRITABLE));
                assert_eq!(pte.address(), page);
            }

            // Shared leaf: two references.
            assert_eq!(
                frames.refcount(PhysFrame::containing_address(page)),
                2
            );

            child.destroy(&mapper, &frames);
            parent.destroy(&mapper, &frames);
        }
    }

    #[test]
    fn cow_fault_with_two_sharers_copies() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let master = master_root(&mapper, &frames);
        let virt = VirtAddr::new(0x40_0000);

        // SAFETY: Host-backed tables throughout.
        unsafe {
            let parent = AddressSpace::new_user(&mapper, &frames, master).unwrap();
            let page = frames.request_frame().unwrap().start_address();
            mapper
                .map_4k(parent.root_phys(), virt, page, user_rw(), &frames)
                .unwrap();
            poke(&mapper, parent.root_phys(), virt, 0xAA);

            let child = parent.clone_cow(&mapper, &frames).unwrap();

            // Child writes: gets a private copy, parent keeps the original.
            let outcome =
                resolve_cow_fault(&mapper, &frames, child.root_phys(), virt);
            assert_eq!(outcome, CowOutcome::Handled);
            poke(&mapper, child.root_phys(), virt, 0xBB);

            assert_eq!(peek(&mapper, parent.root_phys(), virt), 0xAA);
            assert_eq!(peek(&mapper, child.root_phys(), virt), 0xBB);

            // Parent's leaf is now the sole reference: fault flips in place.
            let outcome =
                resolve_cow_fault(&mapper, &frames, parent.root_phys(), virt);
            assert_eq!(outcome, CowOutcome::Handled);
            let parent_pte = mapper.pte_of(parent.root_phys(), virt).unwrap();
            assert_eq!(parent_pte.address(), page);
            assert!(parent_pte.flags().contains(PageTableFlags::WRITABLE));
            assert!(!parent_pte.flags().contains(PageTableFlags::COW));

            // Each space now owns its page exclusively.
            for root in [parent.root_phys(), child.root_phys()] {
                let pte = mapper.pte_of(root, virt).unwrap();
                assert_eq!(
                    frames.refcount(PhysFrame::containing_address(pte.address())),
                    1
                );
            }

            child.destroy(&mapper, &frames);
            parent.destroy(&mapper, &frames);
        }
    }

    #[test]
    fn cow_refcount_tracks_sharers() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let master = master_root(&mapper, &frames);
        let virt = VirtAddr::new(0x8_0000);

        // SAFETY: Host-backed tables throughout.
        unsafe {
            let gen0 = AddressSpace::new_user(&mapper, &frames, master).unwrap();
            let page = frames.request_frame().unwrap().start_address();
            mapper
                .map_4k(gen0.root_phys(), virt, page, user_rw(), &frames)
                .unwrap();

            let gen1 = gen0.clone_cow(&mapper, &frames).unwrap();
            let gen2 = gen0.clone_cow(&mapper, &frames).unwrap();
            let shared = PhysFrame::containing_address(page);
            assert_eq!(frames.refcount(shared), 3);

            // One copy-on-write drops the shared count by one; the copy is
            // exclusively owned.
            resolve_cow_fault(&mapper, &frames, gen1.root_phys(), virt);
            assert_eq!(frames.refcount(shared), 2);
            let copied = mapper.pte_of(gen1.root_phys(), virt).unwrap().address();
            assert_eq!(
                frames.refcount(PhysFrame::containing_address(copied)),
                1
            );

            gen2.destroy(&mapper, &frames);
            gen1.destroy(&mapper, &frames);
            gen0.destroy(&mapper, &frames);
        }
    }

    #[test]
    fn non_cow_fault_reports_not_cow() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let master = master_root(&mapper, &frames);

        // SAFETY: Host-backed tables throughout.
        unsafe {
            let space = AddressSpace::new_user(&mapper, &frames, master).unwrap();
            // Unmapped address.
            assert_eq!(
                resolve_cow_fault(&mapper, &frames, space.root_phys(), VirtAddr::zero()),
                CowOutcome::NotCow
            );

            // Mapped but plainly read-only (no COW marker).
            let virt = VirtAddr::new(0x5000);
            let page = frames.request_frame().unwrap().start_address();
            mapper
                .map_4k(
                    space.root_phys(),
                    virt,
                    page,
                    PageTableFlags::PRESENT | PageTableFlags::USER,
                    &frames,
                )
                .unwrap();
            assert_eq!(
                resolve_cow_fault(&mapper, &frames, space.root_phys(), virt),
                CowOutcome::NotCow
            );
            space.destroy(&mapper, &frames);
        }
    }

    #[test]
    fn destroy_releases_every_frame() {
        let frames = HostFrames::new();
        let mapper = PageTableMapper::new(0);
        let master = master_root(&mapper, &frames);
        let baseline = frames.live_frames();

        // SAFETY: Host-backed tables throughout.
        unsafe {
            let space = AddressSpace::new_user(&mapper, &frames, master).unwrap();
            for i in 0..4u64 {
                let page = frames.request_frame().unwrap().start_address();
                mapper
                    .map_4k(
                        space.root_phys(),
                        VirtAddr::new(0x10_0000 + i * 0x1000),
                        page,
                        user_rw(),
                        &frames,
                    )
                    .unwrap();
            }
            let clone = space.clone_cow(&mapper, &frames).unwrap();
            clone.destroy(&mapper, &frames);
            space.destroy(&mapper, &frames);
        }
        assert_eq!(frames.live_frames(), baseline);
    }
}
