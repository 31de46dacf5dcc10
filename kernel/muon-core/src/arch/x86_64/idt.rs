//! Interrupt Descriptor Table structures.

use core::mem::size_of;

use crate::addr::VirtAddr;
use crate::arch::x86_64::gdt::DescriptorTablePointer;

/// Handler for interrupts without an error code.
pub type HandlerFunc = extern "x86-interrupt" fn(InterruptStackFrame);

/// Handler for interrupts that push an error code.
pub type HandlerFuncWithErrCode = extern "x86-interrupt" fn(InterruptStackFrame, u64);

/// Diverging handler with an error code (double fault).
pub type DivergingHandlerFuncWithErrCode = extern "x86-interrupt" fn(InterruptStackFrame, u64) -> !;

/// The stack frame pushed by the CPU on interrupt entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptStackFrame {
    /// Instruction pointer at the time of the interrupt.
    pub instruction_pointer: VirtAddr,
    /// Code segment selector.
    pub code_segment: u64,
    /// RFLAGS at the time of the interrupt.
    pub cpu_flags: u64,
    /// Stack pointer at the time of the interrupt.
    pub stack_pointer: VirtAddr,
    /// Stack segment selector.
    pub stack_segment: u64,
}

/// Options bits of an IDT entry (bits 32..47 of the raw entry).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct EntryOptions(u16);

impl EntryOptions {
    /// Interrupt gate, not present, DPL=0, no IST.
    #[inline]
    const fn minimal() -> Self {
        Self(0x0E00)
    }

    /// Present interrupt gate, DPL=0, no IST.
    #[inline]
    fn new() -> Self {
        let mut opts = Self::minimal();
        opts.set_present(true);
        opts
    }

    /// Sets the IST index (0 = none, 1-7 = IST1-IST7).
    #[inline]
    pub fn set_ist_index(&mut self, index: u8) -> &mut Self {
        debug_assert!(index < 8);
        self.0 = (self.0 & !0x07) | (index as u16 & 0x07);
        self
    }

    /// Sets the descriptor privilege level.
    #[inline]
    pub fn set_dpl(&mut self, dpl: u8) -> &mut Self {
        debug_assert!(dpl < 4);
        self.0 = (self.0 & !0x6000) | ((dpl as u16 & 0x03) << 13);
        self
    }

    /// Sets the present bit.
    #[inline]
    pub fn set_present(&mut self, present: bool) -> &mut Self {
        if present {
            self.0 |= 1 << 15;
        } else {
            self.0 &= !(1 << 15);
        }
        self
    }
}

/// Reads the current CS selector.
#[inline]
fn current_cs() -> u16 {
    let cs: u16;
    // SAFETY: Reading CS has no side effects.
    unsafe {
        core::arch::asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
    }
    cs
}

/// A single 16-byte IDT entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IdtEntry {
    offset_low: u16,
    segment_selector: u16,
    options: EntryOptions,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    /// Creates a not-present entry.
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            segment_selector: 0,
            options: EntryOptions::minimal(),
            offset_mid: 0,
            offset_high: 0,
            _reserved: 0,
        }
    }

    fn set_addr(&mut self, addr: u64) -> &mut EntryOptions {
        self.offset_low = addr as u16;
        self.offset_mid = (addr >> 16) as u16;
        self.offset_high = (addr >> 32) as u32;
        self.segment_selector = current_cs();
        self.options = EntryOptions::new();
        &mut self.options
    }

    /// Installs a handler without an error code.
    pub fn set_handler_fn(&mut self, handler: HandlerFunc) -> &mut EntryOptions {
        self.set_addr(handler as usize as u64)
    }

    /// Installs a handler with an error code.
    pub fn set_handler_with_err_code(&mut self, handler: HandlerFuncWithErrCode) -> &mut EntryOptions {
        self.set_addr(handler as usize as u64)
    }

    /// Installs a diverging handler with an error code.
    pub fn set_diverging_with_err_code(
        &mut self,
        handler: DivergingHandlerFuncWithErrCode,
    ) -> &mut EntryOptions {
        self.set_addr(handler as usize as u64)
    }

    /// Installs a raw naked stub.
    ///
    /// # Safety
    ///
    /// The stub must follow the interrupt calling convention for its vector
    /// (register save/restore and `iretq`).
    pub unsafe fn set_naked_stub(&mut self, stub: unsafe extern "C" fn()) -> &mut EntryOptions {
        self.set_addr(stub as usize as u64)
    }
}

/// The 256-entry Interrupt Descriptor Table.
///
/// CPU exception vectors (0..32) are named fields; hardware interrupt
/// vectors (32..256) live in [`Self::interrupts`], indexed by `vector - 32`.
#[repr(C, align(16))]
pub struct InterruptDescriptorTable {
    /// Vector 0: divide error.
    pub divide_error: IdtEntry,
    /// Vector 1: debug.
    pub debug: IdtEntry,
    /// Vector 2: non-maskable interrupt.
    pub nmi: IdtEntry,
    /// Vector 3: breakpoint.
    pub breakpoint: IdtEntry,
    /// Vector 4: overflow.
    pub overflow: IdtEntry,
    /// Vector 5: bound range exceeded.
    pub bound_range: IdtEntry,
    /// Vector 6: invalid opcode.
    pub invalid_opcode: IdtEntry,
    /// Vector 7: device not available.
    pub device_not_available: IdtEntry,
    /// Vector 8: double fault.
    pub double_fault: IdtEntry,
    _coprocessor_segment_overrun: IdtEntry,
    /// Vector 10: invalid TSS.
    pub invalid_tss: IdtEntry,
    /// Vector 11: segment not present.
    pub segment_not_present: IdtEntry,
    /// Vector 12: stack-segment fault.
    pub stack_segment_fault: IdtEntry,
    /// Vector 13: general protection fault.
    pub general_protection: IdtEntry,
    /// Vector 14: page fault.
    pub page_fault: IdtEntry,
    _reserved_15: IdtEntry,
    /// Vector 16: x87 floating point.
    pub x87_floating_point: IdtEntry,
    /// Vector 17: alignment check.
    pub alignment_check: IdtEntry,
    /// Vector 18: machine check.
    pub machine_check: IdtEntry,
    /// Vector 19: SIMD floating point.
    pub simd_floating_point: IdtEntry,
    _reserved_20_31: [IdtEntry; 12],
    /// Vectors 32..256: hardware and software interrupts.
    pub interrupts: [IdtEntry; 224],
}

impl InterruptDescriptorTable {
    /// Creates an IDT with every entry missing.
    pub const fn new() -> Self {
        Self {
            divide_error: IdtEntry::missing(),
            debug: IdtEntry::missing(),
            nmi: IdtEntry::missing(),
            breakpoint: IdtEntry::missing(),
            overflow: IdtEntry::missing(),
            bound_range: IdtEntry::missing(),
            invalid_opcode: IdtEntry::missing(),
            device_not_available: IdtEntry::missing(),
            double_fault: IdtEntry::missing(),
            _coprocessor_segment_overrun: IdtEntry::missing(),
            invalid_tss: IdtEntry::missing(),
            segment_not_present: IdtEntry::missing(),
            stack_segment_fault: IdtEntry::missing(),
            general_protection: IdtEntry::missing(),
            page_fault: IdtEntry::missing(),
            _reserved_15: IdtEntry::missing(),
            x87_floating_point: IdtEntry::missing(),
            alignment_check: IdtEntry::missing(),
            machine_check: IdtEntry::missing(),
            simd_floating_point: IdtEntry::missing(),
            _reserved_20_31: [IdtEntry::missing(); 12],
            interrupts: [IdtEntry::missing(); 224],
        }
    }

    /// Loads this IDT (LIDT).
    ///
    /// # Safety
    ///
    /// The table must be `'static` and its handlers must stay valid.
    #[inline]
    pub unsafe fn load(&'static self) {
        let ptr = DescriptorTablePointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };
        unsafe {
            core::arch::asm!(
                "lidt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags),
            );
        }
    }
}

impl Default for InterruptDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idt_is_256_entries() {
        assert_eq!(size_of::<InterruptDescriptorTable>(), 256 * 16);
    }

    #[test]
    fn entry_is_16_bytes() {
        assert_eq!(size_of::<IdtEntry>(), 16);
    }

    #[test]
    fn missing_entry_not_present() {
        let entry = IdtEntry::missing();
        assert_eq!(entry.options.0 & (1 << 15), 0);
    }

    #[test]
    fn options_dpl_and_ist() {
        let mut opts = EntryOptions::new();
        opts.set_dpl(3).set_ist_index(1);
        assert_eq!((opts.0 >> 13) & 0b11, 3);
        assert_eq!(opts.0 & 0b111, 1);
        assert_ne!(opts.0 & (1 << 15), 0);
    }
}
