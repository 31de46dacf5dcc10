//! Panic handling and the fatal-fault dump.

use core::panic::PanicInfo;

use muon_core::arch::x86_64::control::{Cr0, Cr2, Cr3, Cr4};
use muon_core::arch::x86_64::idt::InterruptStackFrame;
use muon_core::arch::x86_64::interrupts;
use muon_core::arch::x86_64::rflags::RFlags;
use muon_core::{kfatal, kprintln};

/// Fatal fault: dump everything a post-mortem needs, then halt.
///
/// Prints the interrupt frame, the control registers, the decoded RFLAGS,
/// and eight words above the faulting stack pointer.
pub fn fault_panic(name: &str, frame: &InterruptStackFrame, error_code: Option<u64>) -> ! {
    interrupts::disable();

    kfatal!("EXCEPTION: {name}");
    if let Some(code) = error_code {
        kprintln!("  error code: {code:#x}");
    }
    kprintln!("  rip:    {:#018x}", frame.instruction_pointer.as_u64());
    kprintln!("  cs:     {:#06x}", frame.code_segment);
    kprintln!("  rsp:    {:#018x}", frame.stack_pointer.as_u64());
    kprintln!("  ss:     {:#06x}", frame.stack_segment);

    kprintln!(
        "  cr0: {:#x}  cr2: {:#x}  cr3: {:#x}  cr4: {:#x}",
        Cr0::read_raw(),
        Cr2::read(),
        Cr3::read().as_u64(),
        Cr4::read_raw(),
    );

    let flags = RFlags::from_bits_truncate(frame.cpu_flags);
    kprintln!("  rflags: {:#x} [{flags:?}]", frame.cpu_flags);

    // Eight words above the faulting stack pointer, when it looks sane.
    let rsp = frame.stack_pointer.as_u64();
    if rsp % 8 == 0 && rsp != 0 {
        kprintln!("  stack:");
        for i in 0..8u64 {
            // SAFETY: Best-effort read of an aligned, nonzero stack slot;
            // a nested fault here double-faults onto the IST stack.
            let word = unsafe { *((rsp + i * 8) as *const u64) };
            kprintln!("    [rsp+{:#04x}] {:#018x}", i * 8, word);
        }
    }

    halt_forever();
}

fn halt_forever() -> ! {
    loop {
        interrupts::disable();
        interrupts::hlt();
    }
}

/// The kernel panic handler: print and halt.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    interrupts::disable();
    kfatal!("KERNEL PANIC: {}", info.message());
    if let Some(location) = info.location() {
        kprintln!("  at {}:{}", location.file(), location.line());
    }
    halt_forever()
}
