//! IDT wiring.

use core::cell::UnsafeCell;

use muon_core::arch::x86_64::idt::InterruptDescriptorTable;
use muon_core::kdebug;

use super::gdt::DOUBLE_FAULT_IST_INDEX;
use super::interrupts::handlers;
use crate::drivers::pic::{KEYBOARD_VECTOR, PIC_1_OFFSET, TIMER_VECTOR};

/// Wrapper making the boot-built IDT static `Sync`.
///
/// # Safety
///
/// Written once in `init` before interrupts are enabled, read-only after.
struct BootCell(UnsafeCell<InterruptDescriptorTable>);

// SAFETY: See `BootCell` doc comment.
unsafe impl Sync for BootCell {}

static IDT: BootCell = BootCell(UnsafeCell::new(InterruptDescriptorTable::new()));

/// Populates the exception and IRQ gates and loads the table.
///
/// # Safety
///
/// Must run after GDT init (the gates capture the current CS) and before
/// interrupts are enabled.
pub unsafe fn init() {
    // SAFETY: Single-threaded boot; the static lives forever.
    let idt = unsafe { &mut *IDT.0.get() };

    idt.divide_error.set_handler_fn(handlers::divide_error);
    idt.invalid_opcode.set_handler_fn(handlers::invalid_opcode);
    idt.device_not_available
        .set_handler_fn(handlers::device_not_available);
    idt.double_fault
        .set_diverging_with_err_code(handlers::double_fault)
        .set_ist_index(DOUBLE_FAULT_IST_INDEX);
    idt.invalid_tss
        .set_handler_with_err_code(handlers::invalid_tss);
    idt.segment_not_present
        .set_handler_with_err_code(handlers::segment_not_present);
    idt.stack_segment_fault
        .set_handler_with_err_code(handlers::stack_segment_fault);
    idt.general_protection
        .set_handler_with_err_code(handlers::general_protection);
    idt.page_fault.set_handler_with_err_code(handlers::page_fault);
    idt.x87_floating_point
        .set_handler_fn(handlers::x87_floating_point);
    idt.simd_floating_point
        .set_handler_fn(handlers::simd_floating_point);

    idt.interrupts[(TIMER_VECTOR - PIC_1_OFFSET) as usize]
        .set_handler_fn(handlers::timer_interrupt);
    idt.interrupts[(KEYBOARD_VECTOR - PIC_1_OFFSET) as usize]
        .set_handler_fn(handlers::keyboard_interrupt);

    // SAFETY: The table is fully populated and static.
    unsafe { (*IDT.0.get()).load() };
    kdebug!("idt: loaded");
}
