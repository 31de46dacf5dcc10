//! UART 16550 serial port driver.
//!
//! Minimal polled driver for the debug console: programs 115200 8N1 with
//! FIFOs enabled and offers blocking byte writes.

use core::fmt;

use bitflags::bitflags;
use muon_core::arch::x86_64::Port;

/// Register offsets from the UART base address.
mod reg {
    /// Transmit Holding Register (write, DLAB=0).
    pub const THR: u16 = 0;
    /// Divisor Latch Low byte (DLAB=1).
    pub const DLL: u16 = 0;
    /// Interrupt Enable Register (DLAB=0).
    pub const IER: u16 = 1;
    /// Divisor Latch High byte (DLAB=1).
    pub const DLM: u16 = 1;
    /// FIFO Control Register (write).
    pub const FCR: u16 = 2;
    /// Line Control Register.
    pub const LCR: u16 = 3;
    /// Modem Control Register.
    pub const MCR: u16 = 4;
    /// Line Status Register.
    pub const LSR: u16 = 5;
}

bitflags! {
    /// Line Status Register bits.
    struct Lsr: u8 {
        /// Receive data ready.
        const DATA_READY = 1 << 0;
        /// Transmit holding register empty.
        const THR_EMPTY  = 1 << 5;
    }
}

/// Base clock divided by the divisor gives the baud rate.
const UART_CLOCK: u32 = 115_200;

/// A 16550-compatible UART at a fixed port base.
pub struct Uart16550 {
    base: u16,
}

impl Uart16550 {
    /// The standard COM1 port.
    pub const fn com1() -> Self {
        Self { base: 0x3F8 }
    }

    fn port(&self, offset: u16) -> Port<u8> {
        Port::new(self.base + offset)
    }

    /// Programs 115200 baud, 8 data bits, no parity, one stop bit, FIFOs
    /// on.
    ///
    /// # Safety
    ///
    /// The port base must be a real UART; writes go straight to hardware.
    pub unsafe fn init(&self) {
        let divisor = (UART_CLOCK / 115_200) as u16;
        // SAFETY: All accesses target this UART's own registers.
        unsafe {
            self.port(reg::IER).write(0x00); // no interrupts
            self.port(reg::LCR).write(0x80); // DLAB on
            self.port(reg::DLL).write(divisor as u8);
            self.port(reg::DLM).write((divisor >> 8) as u8);
            self.port(reg::LCR).write(0x03); // 8N1, DLAB off
            self.port(reg::FCR).write(0xC7); // FIFO on, clear, 14-byte trigger
            self.port(reg::MCR).write(0x0B); // DTR + RTS + OUT2
        }
    }

    /// Blocks until the transmitter is idle, then sends one byte.
    /// `\n` is expanded to `\r\n` for terminal emulators.
    pub fn write_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            self.write_raw(b'\r');
        }
        self.write_raw(byte);
    }

    fn write_raw(&mut self, byte: u8) {
        // SAFETY: Polling LSR and writing THR on an initialized UART.
        unsafe {
            while !Lsr::from_bits_truncate(self.port(reg::LSR).read()).contains(Lsr::THR_EMPTY) {
                core::hint::spin_loop();
            }
            self.port(reg::THR).write(byte);
        }
    }
}

impl fmt::Write for Uart16550 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}
