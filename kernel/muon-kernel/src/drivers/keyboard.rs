//! PS/2 keyboard driver.
//!
//! Translates scancode set 1 to ASCII with shift handling and pushes every
//! byte into the console input path, which owns buffering and reader
//! wakeup.

use core::sync::atomic::{AtomicBool, Ordering};

use muon_core::arch::x86_64::Port;

use crate::console;

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;

/// Status register bit: output buffer has data.
const STATUS_OUTPUT_FULL: u8 = 0x01;

static SHIFT_HELD: AtomicBool = AtomicBool::new(false);

#[rustfmt::skip]
static SCANCODE_TO_ASCII: [u8; 128] = [
    0, 0, b'1', b'2', b'3', b'4', b'5', b'6',
    b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i',
    b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';',
    b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*',
    0, b' ', 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, b'7',
    b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
];

#[rustfmt::skip]
static SCANCODE_TO_ASCII_SHIFT: [u8; 128] = [
    0, 0, b'!', b'@', b'#', b'$', b'%', b'^',
    b'&', b'*', b'(', b')', b'_', b'+', 0x08, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I',
    b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':',
    b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*',
    0, b' ', 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, b'7',
    b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
];

/// Left/right shift press and release scancodes.
const SHIFT_PRESS: [u8; 2] = [0x2A, 0x36];
const SHIFT_RELEASE: [u8; 2] = [0xAA, 0xB6];

/// Drains any stale bytes from the controller.
pub fn init() {
    let status = Port::<u8>::new(STATUS_PORT);
    let data = Port::<u8>::new(DATA_PORT);
    // SAFETY: Reading the i8042 status/data ports.
    unsafe {
        while status.read() & STATUS_OUTPUT_FULL != 0 {
            let _ = data.read();
        }
    }
}

/// IRQ 1 handler body: reads one scancode and forwards decoded bytes.
pub fn handle_interrupt() {
    let data = Port::<u8>::new(DATA_PORT);
    // SAFETY: The IRQ signalled that the output buffer is full.
    let scancode = unsafe { data.read() };

    if SHIFT_PRESS.contains(&scancode) {
        SHIFT_HELD.store(true, Ordering::Relaxed);
        return;
    }
    if SHIFT_RELEASE.contains(&scancode) {
        SHIFT_HELD.store(false, Ordering::Relaxed);
        return;
    }
    if scancode >= 0x80 {
        // Other key releases.
        return;
    }

    let table = if SHIFT_HELD.load(Ordering::Relaxed) {
        &SCANCODE_TO_ASCII_SHIFT
    } else {
        &SCANCODE_TO_ASCII
    };
    let ascii = table[scancode as usize];
    if ascii != 0 {
        console::push_byte(ascii);
    }
}
