//! Legacy 8259 programmable interrupt controller.
//!
//! The PIC pair is remapped above the CPU exception range; handlers must
//! acknowledge every interrupt with an end-of-interrupt or the line stays
//! masked.

use muon_core::sync::IrqSpinLock;
use pic8259::ChainedPics;

/// Vector base of the primary PIC after remapping.
pub const PIC_1_OFFSET: u8 = 32;
/// Vector base of the secondary PIC after remapping.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Timer interrupt vector (IRQ 0).
pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
/// Keyboard interrupt vector (IRQ 1).
pub const KEYBOARD_VECTOR: u8 = PIC_1_OFFSET + 1;

// SAFETY: The chosen offsets do not collide with CPU exceptions.
static PICS: IrqSpinLock<ChainedPics> =
    IrqSpinLock::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remaps both PICs and unmasks the timer and keyboard lines only.
pub fn init() {
    // SAFETY: Standard 8259 initialization sequence at the standard ports.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Bit set = masked. Leave IRQ 0 (timer) and IRQ 1 (keyboard) open.
        pics.write_masks(!0b0000_0011, 0xFF);
    }
    muon_core::kdebug!("PIC remapped to vectors {PIC_1_OFFSET}..{}", PIC_2_OFFSET + 8);
}

/// Signals end-of-interrupt for `vector`.
pub fn end_of_interrupt(vector: u8) {
    // SAFETY: Only called from the handler of `vector`.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
