//! Global frame table bring-up.
//!
//! The refcount array lives in the largest usable region of the memory map,
//! addressed through the HHDM; the frames it occupies are locked before the
//! allocator is published. After init the table is reachable as a shared
//! static: it synchronizes internally, so no outer lock is needed (the page
//! fault path must be able to reach it without lock nesting).

use core::ptr::addr_of;
use core::sync::atomic::{AtomicBool, Ordering};

use muon_core::addr::PhysAddr;
use muon_core::kinfo;
use muon_core::paging::{PhysFrame, PAGE_SIZE};
use muon_mm::FrameTable;

use crate::boot::{BootInfo, MemoryRegionKind};
use crate::mm::hhdm;

static mut TABLE: Option<FrameTable> = None;
static READY: AtomicBool = AtomicBool::new(false);

/// Builds the frame table from the boot memory map.
///
/// # Panics
///
/// Panics when no usable region can hold the refcount array; the kernel
/// cannot run without an allocator.
pub fn init(boot_info: &impl BootInfo) {
    let mut highest = 0u64;
    let mut largest_base = PhysAddr::zero();
    let mut largest_len = 0u64;

    for region in boot_info.memory_map() {
        let end = region.start.as_u64() + region.size;
        highest = highest.max(end);
        if region.kind == MemoryRegionKind::Usable && region.size > largest_len {
            largest_base = region.start;
            largest_len = region.size;
        }
    }

    let frame_count = (highest / PAGE_SIZE as u64) as usize;
    let table_bytes = frame_count * core::mem::size_of::<u16>();
    let table_frames = table_bytes.div_ceil(PAGE_SIZE);
    assert!(
        largest_len as usize >= table_bytes,
        "no usable region can hold the frame refcount table"
    );

    let refcounts = hhdm::phys_to_virt(largest_base).as_mut_ptr::<u16>();
    // SAFETY: The region is usable RAM, HHDM-mapped, and exclusively ours
    // until the frames are locked below.
    let table = unsafe { FrameTable::new(refcounts, frame_count) };

    // SAFETY: The regions come straight from the boot memory map.
    unsafe {
        for region in boot_info.memory_map() {
            if region.kind == MemoryRegionKind::Usable {
                table.release_region(region.start, region.size);
            }
        }
    }

    // Bootstrap: pin the frames backing the refcount array itself.
    table.lock_frames(PhysFrame::containing_address(largest_base), table_frames);

    kinfo!(
        "pmm: tracking {} frames, {} KiB free, refcounts at {}",
        frame_count,
        table.free_ram() / 1024,
        largest_base,
    );

    // SAFETY: Single-threaded early boot; no reader exists before READY.
    unsafe {
        TABLE = Some(table);
    }
    READY.store(true, Ordering::Release);
}

/// The global frame table.
///
/// # Panics
///
/// Panics before [`init`].
pub fn frames() -> &'static FrameTable {
    assert!(READY.load(Ordering::Acquire), "PMM not initialized");
    // SAFETY: Written once before READY was published, never again.
    unsafe { (*addr_of!(TABLE)).as_ref().expect("PMM not initialized") }
}
