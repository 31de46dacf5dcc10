//! TLB management instructions.

use crate::addr::VirtAddr;
use crate::arch::x86_64::control::Cr3;

/// Invalidates the TLB entry for `addr` (INVLPG).
#[inline]
pub fn flush(addr: VirtAddr) {
    // SAFETY: INVLPG invalidates a single TLB entry and nothing else.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) addr.as_u64(),
            options(nostack, preserves_flags),
        );
    }
}

/// Flushes all non-global TLB entries by reloading CR3.
#[inline]
pub fn flush_all() {
    // SAFETY: Writing CR3 back with the same value only flushes the TLB.
    unsafe { Cr3::write(Cr3::read()) };
}
