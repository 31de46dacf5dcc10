//! Kernel logger: early serial bring-up and leveled output.

use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicU8, Ordering};

use muon_core::log::LogLevel;
use muon_core::sync::IrqSpinLock;

use crate::drivers::uart16550::Uart16550;

/// The serial console. Interrupt-safe: handlers log too.
static SERIAL: IrqSpinLock<Option<Uart16550>> = IrqSpinLock::new(None);

/// Highest level that reaches the sink (stored as the raw `LogLevel` value).
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);

fn serial_print(args: fmt::Arguments<'_>) {
    let mut serial = SERIAL.lock();
    if let Some(uart) = serial.as_mut() {
        let _ = uart.write_fmt(args);
    }
}

fn serial_log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level as u8 > MAX_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let mut serial = SERIAL.lock();
    if let Some(uart) = serial.as_mut() {
        let _ = write!(uart, "[{}] {}\n", level.name(), args);
    }
}

/// Brings up COM1 and installs the serial print/log sinks.
pub fn init_early_serial() {
    let uart = Uart16550::com1();
    // SAFETY: COM1 is the standard debug port; init programs only its own
    // registers.
    unsafe {
        uart.init();
        *SERIAL.lock() = Some(uart);
        muon_core::log::set_print_fn(serial_print);
        muon_core::log::set_log_fn(serial_log);
    }
}

/// Restricts logging to `level` and below.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Writes raw console output (the `write(1, ...)` path).
pub fn console_write(bytes: &[u8]) {
    let mut serial = SERIAL.lock();
    if let Some(uart) = serial.as_mut() {
        for &b in bytes {
            uart.write_byte(b);
        }
    }
}
