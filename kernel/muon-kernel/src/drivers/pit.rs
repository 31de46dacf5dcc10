//! 8254 PIT (Programmable Interval Timer) driver.
//!
//! Channel 0 in rate-generator mode delivers the scheduler's preemption
//! tick on IRQ 0.

use muon_core::arch::x86_64::Port;

/// PIT oscillator frequency: 1,193,182 Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

const CHANNEL0_DATA: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

/// Programs channel 0 to fire `hz` times per second.
///
/// A divisor outside the 16-bit range is clamped.
pub fn init(hz: u64) {
    let divisor = (PIT_FREQUENCY / hz.max(19) as u32).min(0xFFFF) as u16;

    let cmd = Port::<u8>::new(PIT_CMD);
    let data = Port::<u8>::new(CHANNEL0_DATA);

    // SAFETY: Standard PIT programming: channel 0, lobyte/hibyte, mode 2
    // (rate generator), binary counting.
    unsafe {
        cmd.write(0b0011_0100);
        data.write(divisor as u8);
        data.write((divisor >> 8) as u8);
    }
    muon_core::kdebug!("PIT armed at {hz} Hz (divisor {divisor})");
}
