//! CPU feature bits the kernel's page tables rely on.

use muon_core::arch::x86_64::control::{Cr0, Cr0Flags};
use muon_core::arch::x86_64::msr::{EferFlags, IA32_EFER};
use muon_core::kdebug;

/// Enables EFER.NXE (the kernel maps its heap no-execute) and CR0.WP
/// (ring 0 honors read-only pages).
///
/// # Safety
///
/// Must run before the kernel's own page tables are installed and only
/// once, during single-threaded boot.
pub unsafe fn enable_features() {
    // SAFETY: Setting NXE and WP only tightens enforcement; all other
    // CR0/EFER bits are carried over unchanged.
    unsafe {
        let efer = IA32_EFER.read();
        IA32_EFER.write(efer | EferFlags::NO_EXECUTE_ENABLE.bits());

        let cr0 = Cr0::read_raw();
        Cr0::write_raw(cr0 | Cr0Flags::WRITE_PROTECT.bits());
    }
    kdebug!("cpu: EFER.NXE and CR0.WP set");
}
