//! Kernel master page table.
//!
//! Builds the kernel's own four-level tree from the boot memory map
//! (identity plus HHDM mappings of every region, the kernel image at its
//! link address) and installs it in CR3. User roots copy the upper half of
//! this table; the master itself is never destroyed.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::arch::x86_64::control::Cr3;
use muon_core::paging::{PageTableFlags, PAGE_SIZE};
use muon_core::{kdebug, kinfo};
use muon_mm::PageTableMapper;

use crate::boot::BootInfo;
use crate::mm::{hhdm, pmm};

static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Physical address of the kernel master PML4.
pub fn kernel_root() -> PhysAddr {
    PhysAddr::new_truncate(KERNEL_ROOT.load(Ordering::Acquire))
}

/// A mapper over the live HHDM.
pub fn mapper() -> PageTableMapper {
    PageTableMapper::new(hhdm::offset())
}

/// Builds the master table and loads it into CR3.
///
/// # Panics
///
/// Panics on frame exhaustion during construction: the kernel cannot run
/// without its address space.
pub fn init(boot_info: &impl BootInfo) {
    let frames = pmm::frames();
    let mapper = mapper();

    let root = frames
        .request_page()
        .expect("vmm: no frame for the master PML4");
    // SAFETY: Fresh frame, HHDM-reachable.
    unsafe {
        core::ptr::write_bytes(mapper.phys_to_virt(root.start_address()), 0, PAGE_SIZE);
    }
    let root_phys = root.start_address();

    let kernel_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let mut pages_mapped = 0u64;

    // Identity + HHDM map of every memory-map region, page by page.
    for region in boot_info.memory_map() {
        let base = region.start.align_down(PAGE_SIZE as u64).as_u64();
        let top = (region.start.as_u64() + region.size + PAGE_SIZE as u64 - 1)
            & !(PAGE_SIZE as u64 - 1);
        let mut addr = base;
        while addr < top {
            let phys = PhysAddr::new_truncate(addr);
            // SAFETY: The root is ours; conflicts within one region map the
            // same frame to the same place.
            unsafe {
                mapper
                    .map_4k(root_phys, VirtAddr::new_truncate(addr), phys, kernel_flags, frames)
                    .expect("vmm: out of frames mapping physical memory");
                mapper
                    .map_4k(
                        root_phys,
                        hhdm::phys_to_virt(phys),
                        phys,
                        kernel_flags,
                        frames,
                    )
                    .expect("vmm: out of frames mapping the HHDM");
            }
            pages_mapped += 2;
            addr += PAGE_SIZE as u64;
        }
    }

    // The kernel image at its link address.
    let kaddr = boot_info.kernel_address();
    let ksize = boot_info.kernel_size();
    let kpages = ksize.div_ceil(PAGE_SIZE as u64);
    for page in 0..kpages {
        let offset = page * PAGE_SIZE as u64;
        // SAFETY: Same contract as above.
        unsafe {
            mapper
                .map_4k(
                    root_phys,
                    VirtAddr::new_truncate(kaddr.virtual_base.as_u64() + offset),
                    kaddr.physical_base + offset,
                    kernel_flags,
                    frames,
                )
                .expect("vmm: out of frames mapping the kernel image");
        }
    }

    kdebug!("vmm: mapped {pages_mapped} region pages + {kpages} kernel pages");

    KERNEL_ROOT.store(root_phys.as_u64(), Ordering::Release);

    // SAFETY: The new tree maps everything the kernel is touching: the
    // image at its link address, the stack and boot structures through
    // identity/HHDM.
    unsafe { Cr3::write(root_phys) };
    kinfo!("vmm: master table installed, CR3 = {root_phys}");
}
