//! RFLAGS register access.

bitflags::bitflags! {
    /// RFLAGS register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u64 {
        /// Carry flag.
        const CARRY          = 1 << 0;
        /// Zero flag.
        const ZERO           = 1 << 6;
        /// Sign flag.
        const SIGN           = 1 << 7;
        /// Trap flag (single step).
        const TRAP           = 1 << 8;
        /// Interrupt enable flag.
        const INTERRUPT_FLAG = 1 << 9;
        /// Direction flag.
        const DIRECTION      = 1 << 10;
        /// Overflow flag.
        const OVERFLOW       = 1 << 11;
    }
}

/// Reads RFLAGS.
#[inline]
pub fn read() -> RFlags {
    RFlags::from_bits_truncate(read_raw())
}

/// Reads the raw RFLAGS value.
#[inline]
pub fn read_raw() -> u64 {
    let flags: u64;
    // SAFETY: pushfq/pop only moves the flags through the stack.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            out(reg) flags,
            options(nomem, preserves_flags),
        );
    }
    flags
}

/// Writes a raw RFLAGS value.
///
/// # Safety
///
/// The value should come from [`read_raw`]; arbitrary values can set the
/// trap flag or change the interrupt state unexpectedly.
#[inline]
pub unsafe fn write_raw(flags: u64) {
    unsafe {
        core::arch::asm!(
            "push {}",
            "popfq",
            in(reg) flags,
            options(nomem),
        );
    }
}
