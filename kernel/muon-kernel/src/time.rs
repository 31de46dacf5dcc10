//! The monotonic tick counter.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency in Hz.
pub const TICK_HZ: u64 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since the timer was armed.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Advances the counter. Called from the timer interrupt only.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Release);
}

/// Converts a millisecond duration to ticks, rounding up, minimum one.
pub fn ms_to_ticks(ms: u64) -> u64 {
    ((ms * TICK_HZ).div_ceil(1000)).max(1)
}
