//! GDT and TSS installation.
//!
//! Descriptor order is fixed by the SYSCALL/SYSRET selector arithmetic:
//! null, kernel code (0x08), kernel data (0x10), user data (0x18), user
//! code (0x20), TSS. The TSS's RSP0 tracks the running task's kernel stack
//! top; IST1 carries a dedicated stack for double faults.

use core::cell::UnsafeCell;

use muon_core::arch::x86_64::gdt::{
    load_tss, reload_segments, Descriptor, GlobalDescriptorTable, SegmentSelector,
    TaskStateSegment,
};
use muon_core::kdebug;

/// IST slot used by the double fault handler (1-based in the IDT entry).
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

/// Dedicated double-fault stack; a corrupt RSP must not take the handler
/// down with it.
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 4;

#[repr(C, align(16))]
struct DoubleFaultStack([u8; DOUBLE_FAULT_STACK_SIZE]);

static DOUBLE_FAULT_STACK: DoubleFaultStack = DoubleFaultStack([0; DOUBLE_FAULT_STACK_SIZE]);

/// Wrapper making the mutable TSS/GDT statics `Sync`.
///
/// # Safety
///
/// Mutated only during single-threaded boot (`init`) and from
/// `set_tss_rsp0`, which runs with interrupts disabled during context
/// switches. No concurrent access on a uniprocessor.
struct BootCell<T>(UnsafeCell<T>);

// SAFETY: See `BootCell` doc comment.
unsafe impl<T> Sync for BootCell<T> {}

static TSS: BootCell<TaskStateSegment> = BootCell(UnsafeCell::new(TaskStateSegment::new()));
static GDT: BootCell<GlobalDescriptorTable> = BootCell(UnsafeCell::new(GlobalDescriptorTable::new()));

/// Builds and loads the GDT, reloads the segment registers, and loads the
/// task register.
pub fn init() {
    // SAFETY: Single-threaded boot; the statics live forever.
    unsafe {
        let tss = &mut *TSS.0.get();
        tss.interrupt_stack_table[(DOUBLE_FAULT_IST_INDEX - 1) as usize] =
            DOUBLE_FAULT_STACK.0.as_ptr() as u64 + DOUBLE_FAULT_STACK_SIZE as u64;

        let gdt = &mut *GDT.0.get();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let _user_data = gdt.append(Descriptor::user_data_segment());
        let _user_code = gdt.append(Descriptor::user_code_segment());
        let tss_sel = gdt.append(Descriptor::tss_segment(&*(TSS.0.get() as *const _)));

        (*GDT.0.get()).load();
        reload_segments(kernel_code, kernel_data);
        load_tss(tss_sel);

        debug_assert_eq!(kernel_code, SegmentSelector::new(1, 0));
        debug_assert_eq!(kernel_data, SegmentSelector::new(2, 0));
    }
    kdebug!("gdt: loaded, TSS armed");
}

/// Points TSS.RSP0 at `stack_top`; the CPU loads it on the next
/// ring-3 → ring-0 transition.
///
/// # Safety
///
/// `stack_top` must be the top of a mapped kernel stack, and the caller
/// must hold off interrupts (the context switch does).
pub unsafe fn set_tss_rsp0(stack_top: u64) {
    // SAFETY: Uniprocessor, interrupts disabled per the caller contract.
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = stack_top;
    }
}
