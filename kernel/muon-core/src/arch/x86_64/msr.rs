//! Model-specific register access.

/// A model-specific register, identified by its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msr(u32);

/// Extended Feature Enable Register.
pub const IA32_EFER: Msr = Msr::new(0xC000_0080);
/// SYSCALL/SYSRET segment selectors.
pub const MSR_STAR: Msr = Msr::new(0xC000_0081);
/// SYSCALL entry point (long mode).
pub const MSR_LSTAR: Msr = Msr::new(0xC000_0082);
/// RFLAGS mask applied on SYSCALL entry.
pub const MSR_SFMASK: Msr = Msr::new(0xC000_0084);

bitflags::bitflags! {
    /// EFER register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EferFlags: u64 {
        /// System Call Enable (SYSCALL/SYSRET).
        const SYSTEM_CALL_ENABLE = 1 << 0;
        /// Long mode enable.
        const LONG_MODE_ENABLE   = 1 << 8;
        /// No-execute enable.
        const NO_EXECUTE_ENABLE  = 1 << 11;
    }
}

impl Msr {
    /// Creates a handle for the MSR at `addr`.
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Reads the MSR (RDMSR).
    ///
    /// # Safety
    ///
    /// The MSR must exist on the current CPU.
    #[inline]
    pub unsafe fn read(self) -> u64 {
        let (low, high): (u32, u32);
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") self.0,
                out("eax") low,
                out("edx") high,
                options(nomem, nostack, preserves_flags),
            );
        }
        ((high as u64) << 32) | (low as u64)
    }

    /// Writes the MSR (WRMSR).
    ///
    /// # Safety
    ///
    /// The MSR must exist and the value must be valid for it; several MSRs
    /// change fundamental CPU behavior.
    #[inline]
    pub unsafe fn write(self, value: u64) {
        let low = value as u32;
        let high = (value >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") self.0,
                in("eax") low,
                in("edx") high,
                options(nomem, nostack, preserves_flags),
            );
        }
    }
}
