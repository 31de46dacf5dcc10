//! Control registers (CR0, CR2, CR3, CR4).

use crate::addr::PhysAddr;

bitflags::bitflags! {
    /// CR0 register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u64 {
        /// Protected mode enable.
        const PROTECTED_MODE = 1 << 0;
        /// Write protect: ring 0 honors read-only pages.
        const WRITE_PROTECT  = 1 << 16;
        /// Paging enable.
        const PAGING         = 1 << 31;
    }
}

bitflags::bitflags! {
    /// CR4 register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        /// Physical Address Extension.
        const PAE = 1 << 5;
        /// Page Global Enable.
        const PGE = 1 << 7;
    }
}

/// CR0 register.
pub struct Cr0;

impl Cr0 {
    /// Reads the current CR0 value.
    #[inline]
    pub fn read() -> Cr0Flags {
        let val: u64;
        // SAFETY: Reading CR0 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        Cr0Flags::from_bits_truncate(val)
    }

    /// Reads the raw CR0 value (all bits).
    #[inline]
    pub fn read_raw() -> u64 {
        let val: u64;
        // SAFETY: Reading CR0 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        val
    }

    /// Writes a raw value to CR0. Callers read-modify-write: clearing
    /// bits outside the known flags changes the CPU operating mode.
    ///
    /// # Safety
    ///
    /// The value must come from [`read_raw`](Self::read_raw) with only
    /// intended bits changed.
    #[inline]
    pub unsafe fn write_raw(value: u64) {
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags));
        }
    }
}

/// CR2 register (page fault linear address).
pub struct Cr2;

impl Cr2 {
    /// Reads the faulting linear address from CR2.
    #[inline]
    pub fn read() -> u64 {
        let val: u64;
        // SAFETY: Reading CR2 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        val
    }
}

/// CR3 register (physical address of the paging root).
pub struct Cr3;

impl Cr3 {
    /// Reads the current paging root physical address from CR3.
    #[inline]
    pub fn read() -> PhysAddr {
        let val: u64;
        // SAFETY: Reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        PhysAddr::new_truncate(val)
    }

    /// Installs a new paging root.
    ///
    /// The `memory` clobber orders the load against surrounding accesses,
    /// and the write itself flushes all non-global TLB entries.
    ///
    /// # Safety
    ///
    /// `addr` must point to a valid PML4 whose upper half maps the
    /// currently executing kernel.
    #[inline]
    pub unsafe fn write(addr: PhysAddr) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) addr.as_u64(), options(nostack, preserves_flags));
        }
    }
}

/// CR4 register.
pub struct Cr4;

impl Cr4 {
    /// Reads the current CR4 value.
    #[inline]
    pub fn read() -> Cr4Flags {
        let val: u64;
        // SAFETY: Reading CR4 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        Cr4Flags::from_bits_truncate(val)
    }

    /// Reads the raw CR4 value (all bits).
    #[inline]
    pub fn read_raw() -> u64 {
        let val: u64;
        // SAFETY: Reading CR4 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        val
    }

    /// Writes a raw value to CR4. Callers read-modify-write.
    ///
    /// # Safety
    ///
    /// The value must come from [`read_raw`](Self::read_raw) with only
    /// intended bits changed.
    #[inline]
    pub unsafe fn write_raw(value: u64) {
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) value, options(nostack, preserves_flags));
        }
    }
}
