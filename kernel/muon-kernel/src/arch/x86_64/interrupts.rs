//! CPU exception and hardware interrupt handlers.
//!
//! The page fault handler triages in order: copy-on-write resolution, then
//! user-mode termination, then the fatal dump. Double faults and general
//! protection faults are always fatal. The timer handler acknowledges the
//! PIC, advances the tick counter, and runs the scheduler.

/// Handler names are self-documenting.
#[allow(missing_docs)]
pub mod handlers {
    use muon_core::addr::VirtAddr;
    use muon_core::arch::x86_64::control::Cr2;
    use muon_core::arch::x86_64::idt::InterruptStackFrame;
    use muon_core::paging::PageFaultErrorCode;
    use muon_core::{kerr, kinfo};
    use muon_mm::space::{resolve_cow_fault, CowOutcome};

    use crate::arch::x86_64::context::invalidate_page;
    use crate::drivers::pic::{self, KEYBOARD_VECTOR, TIMER_VECTOR};
    use crate::panic::fault_panic;
    use crate::{drivers, mm, proc, sched, time};

    pub extern "x86-interrupt" fn divide_error(frame: InterruptStackFrame) {
        fault_panic("DIVIDE ERROR", &frame, None);
    }

    pub extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
        fault_panic("INVALID OPCODE", &frame, None);
    }

    pub extern "x86-interrupt" fn device_not_available(frame: InterruptStackFrame) {
        fault_panic("DEVICE NOT AVAILABLE", &frame, None);
    }

    pub extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
        fault_panic("DOUBLE FAULT", &frame, Some(error_code));
    }

    pub extern "x86-interrupt" fn invalid_tss(frame: InterruptStackFrame, error_code: u64) {
        fault_panic("INVALID TSS", &frame, Some(error_code));
    }

    pub extern "x86-interrupt" fn segment_not_present(frame: InterruptStackFrame, error_code: u64) {
        fault_panic("SEGMENT NOT PRESENT", &frame, Some(error_code));
    }

    pub extern "x86-interrupt" fn stack_segment_fault(frame: InterruptStackFrame, error_code: u64) {
        fault_panic("STACK-SEGMENT FAULT", &frame, Some(error_code));
    }

    pub extern "x86-interrupt" fn general_protection(frame: InterruptStackFrame, error_code: u64) {
        fault_panic("GENERAL PROTECTION FAULT", &frame, Some(error_code));
    }

    pub extern "x86-interrupt" fn x87_floating_point(frame: InterruptStackFrame) {
        fault_panic("x87 FLOATING POINT", &frame, None);
    }

    pub extern "x86-interrupt" fn simd_floating_point(frame: InterruptStackFrame) {
        fault_panic("SIMD FLOATING POINT", &frame, None);
    }

    pub extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: u64) {
        let fault_addr = Cr2::read();
        let error = PageFaultErrorCode::from_bits_truncate(error_code);

        // A write to a present page may be a copy-on-write leaf.
        if error.contains(PageFaultErrorCode::PRESENT | PageFaultErrorCode::WRITE) {
            let root = muon_core::arch::x86_64::control::Cr3::read();
            let mapper = mm::vmm::mapper();
            let virt = VirtAddr::new_truncate(fault_addr);
            // SAFETY: CR3 holds the faulting space's live root.
            let outcome =
                unsafe { resolve_cow_fault(&mapper, mm::pmm::frames(), root, virt) };
            match outcome {
                CowOutcome::Handled => {
                    invalidate_page(virt);
                    return;
                }
                CowOutcome::OutOfFrames if error.contains(PageFaultErrorCode::USER) => {
                    kerr!("page fault: out of frames during copy-on-write");
                    kinfo!("terminating task {} (-11)", proc::current().pid);
                    proc::exit_current(-11);
                }
                CowOutcome::OutOfFrames => {
                    fault_panic("PAGE FAULT (COW, out of frames)", &frame, Some(error_code));
                }
                CowOutcome::NotCow => {}
            }
        }

        // Not ours to fix: a user fault kills the task, a kernel fault
        // kills the kernel.
        if error.contains(PageFaultErrorCode::USER) {
            kerr!(
                "task {}: segmentation fault at {:#x} (error {:#x})",
                proc::current().pid,
                fault_addr,
                error_code,
            );
            proc::exit_current(-11);
        }

        kerr!("page fault at {fault_addr:#x}, error {error:?}");
        fault_panic("PAGE FAULT", &frame, Some(error_code));
    }

    pub extern "x86-interrupt" fn timer_interrupt(_frame: InterruptStackFrame) {
        pic::end_of_interrupt(TIMER_VECTOR);
        time::on_tick();
        sched::tick();
    }

    pub extern "x86-interrupt" fn keyboard_interrupt(_frame: InterruptStackFrame) {
        drivers::keyboard::handle_interrupt();
        pic::end_of_interrupt(KEYBOARD_VECTOR);
    }
}
