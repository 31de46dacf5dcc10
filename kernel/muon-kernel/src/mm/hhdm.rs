//! Higher-Half Direct Map offset.
//!
//! The bootloader maps all physical RAM at a fixed virtual offset, so
//! `virt = phys + offset` for any physical address the kernel touches.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::addr::{PhysAddr, VirtAddr};

static OFFSET: AtomicU64 = AtomicU64::new(0);

/// Records the HHDM offset. Called once during early boot.
pub fn init(offset: u64) {
    OFFSET.store(offset, Ordering::Release);
}

/// The recorded offset.
pub fn offset() -> u64 {
    OFFSET.load(Ordering::Acquire)
}

/// Translates a physical address to its direct-map virtual address.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(phys.as_u64() + offset())
}
