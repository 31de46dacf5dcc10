//! Kernel heap bring-up.
//!
//! Carves an upper-half virtual range, maps the initial pages with fresh
//! frames, and installs the growth callback that maps more at the current
//! end. The whole heap region sits under a single PML4 entry that is
//! populated here, before any user root copies the upper half; so heap
//! growth stays visible through the shared kernel half in every address
//! space.

use muon_core::addr::VirtAddr;
use muon_core::kinfo;
use muon_core::paging::{PageTableFlags, PAGE_SIZE};
use muon_mm::heap::KernelHeap;
use muon_mm::FrameSource;

use crate::mm::{pmm, vmm};

/// Base of the heap's virtual range.
pub const HEAP_BASE: u64 = 0xFFFF_9000_0000_0000;

/// Initial heap size in pages.
const INITIAL_PAGES: usize = 16;

/// End of the mapped heap range; growth continues here.
static HEAP_END: core::sync::atomic::AtomicU64 =
    core::sync::atomic::AtomicU64::new(HEAP_BASE);

#[cfg_attr(target_os = "none", global_allocator)]
static HEAP: KernelHeap = KernelHeap::new();

/// Maps `count` fresh frames at the current heap end. Returns the base of
/// the new span.
fn map_pages_at_end(count: usize) -> Option<*mut u8> {
    let frames = pmm::frames();
    let mapper = vmm::mapper();
    let root = vmm::kernel_root();
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;

    let base = HEAP_END.load(core::sync::atomic::Ordering::Acquire);
    for i in 0..count {
        let frame = frames.request_frame()?;
        let virt = VirtAddr::new_truncate(base + (i * PAGE_SIZE) as u64);
        // SAFETY: The master root is live and the range above HEAP_END is
        // unmapped by construction.
        unsafe {
            mapper
                .map_4k(root, virt, frame.start_address(), flags, frames)
                .ok()?;
        }
    }
    HEAP_END.store(
        base + (count * PAGE_SIZE) as u64,
        core::sync::atomic::Ordering::Release,
    );
    Some(base as *mut u8)
}

/// Growth callback handed to the allocator.
fn grow(min_bytes: usize) -> Option<*mut u8> {
    let pages = min_bytes.div_ceil(PAGE_SIZE);
    map_pages_at_end(pages)
}

/// Maps the initial pages and initializes the global allocator.
///
/// # Panics
///
/// Panics on frame exhaustion: boot cannot continue without a heap.
pub fn init() {
    let base = map_pages_at_end(INITIAL_PAGES).expect("heap: out of frames at init");
    // SAFETY: The range was just mapped, zero frames come from the PMM
    // zeroed by map_pages_at_end callers' contract (fresh frames).
    unsafe {
        HEAP.init(base, INITIAL_PAGES * PAGE_SIZE);
    }
    HEAP.set_grow_fn(grow);
    kinfo!(
        "heap: {} KiB at {:#x}",
        INITIAL_PAGES * PAGE_SIZE / 1024,
        HEAP_BASE
    );
}
