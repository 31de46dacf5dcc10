//! Console input path.
//!
//! Every keystroke source feeds [`push_byte`]; it buffers into a fixed ring
//! and wakes at most one blocked reader. `read_blocking` is the single
//! consumer path behind descriptor 0; one producer discipline, one wake
//! discipline, regardless of which keyboard driver is wired in.

use alloc::sync::Arc;

use muon_core::sync::IrqSpinLock;
use planck_noalloc::ringbuf::RingBuf;

use muon_sched::Task;

use crate::{log, proc};

/// Ring capacity (usable capacity is one less).
const RING_SIZE: usize = 512;

struct ConsoleInput {
    ring: RingBuf<u8, RING_SIZE>,
    /// The task blocked in `read_blocking`, if any. Single-reader policy:
    /// the console belongs to one foreground task at a time.
    waiter: Option<Arc<Task>>,
}

static INPUT: IrqSpinLock<ConsoleInput> = IrqSpinLock::new(ConsoleInput {
    ring: RingBuf::new(),
    waiter: None,
});

/// Feeds one input byte from interrupt context.
///
/// Echoes printable bytes (and newline/backspace) to the console and wakes
/// the blocked reader, if there is one.
pub fn push_byte(byte: u8) {
    let waiter = {
        let mut input = INPUT.lock();
        if input.ring.try_push(byte).is_err() {
            // Ring full: drop the byte, keep the wake.
            muon_core::kwarn!("console: input ring overflow");
        }
        input.waiter.take()
    };

    match byte {
        0x08 => log::console_write(b"\x08 \x08"),
        b' '..=b'~' | b'\n' => log::console_write(&[byte]),
        _ => {}
    }

    if let Some(task) = waiter {
        proc::unblock(&task);
    }
}

/// Reads up to `buf.len()` bytes, blocking until at least a full line (or a
/// full buffer) is available. Returns the byte count, newline included.
pub fn read_blocking(buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let mut filled = 0usize;

    loop {
        let mut park = false;
        {
            let mut input = INPUT.lock();
            while filled < buf.len() {
                match input.ring.pop() {
                    Some(byte) => {
                        buf[filled] = byte;
                        filled += 1;
                        if byte == b'\n' {
                            return filled;
                        }
                    }
                    None => {
                        park = true;
                        break;
                    }
                }
            }
            if filled == buf.len() {
                return filled;
            }
            if park {
                input.waiter = Some(proc::current());
            }
        }
        // Lock released before blocking; the next keystroke wakes us.
        proc::block_current();
    }
}
