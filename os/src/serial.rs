//! Serial port (COM1 @ 0x3F8) for debug output, and the `log` backend on top
//! of it.
//!
//! Only ring 0 may log. Records emitted from an outer ring are dropped, since
//! the port I/O would fault there whenever IOPL is below the ring.

use core::fmt;

use log::{Level, Metadata, Record};

/// One log line: `[LEVEL target] message`.
pub fn format_record(
    out: &mut impl fmt::Write,
    level: Level,
    target: &str,
    args: fmt::Arguments<'_>,
) -> fmt::Result {
    writeln!(out, "[{:<5} {}] {}", level, target, args)
}

#[cfg(target_arch = "x86")]
mod port {
    use spin::Mutex;

    use crate::arch::x86::port::{inb, outb};

    const COM1: u16 = 0x3F8;

    const LCR_OFF: u16 = 3;
    const LCR_8N1: u8 = 0x03;
    const MCR_OFF: u16 = 4;
    const MCR_DTR_RTS: u8 = 0x03;
    const LSR_OFF: u16 = 5;
    const LSR_THRE: u8 = 0x20;

    /// Serialises whole lines.
    pub static LOCK: Mutex<()> = Mutex::new(());

    /// Initialize COM1 (8n1, no interrupts). Safe to call once at boot.
    pub fn init() {
        unsafe {
            outb(COM1 + LCR_OFF, LCR_8N1);
            outb(COM1 + MCR_OFF, MCR_DTR_RTS);
        }
    }

    fn is_transmit_empty() -> bool {
        unsafe { (inb(COM1 + LSR_OFF) & LSR_THRE) != 0 }
    }

    /// Write one byte to serial. Blocks until THR empty.
    pub fn write_byte(b: u8) {
        while !is_transmit_empty() {}
        unsafe { outb(COM1, b) }
    }
}

#[cfg(target_arch = "x86")]
pub use port::init;

/// Write a string to serial. Newlines not translated.
#[cfg(target_arch = "x86")]
pub fn write_str(s: &str) {
    for b in s.bytes() {
        port::write_byte(b);
    }
}

/// Writer struct for use with core::fmt::Write
#[cfg(target_arch = "x86")]
pub struct Writer;

#[cfg(target_arch = "x86")]
impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_str(s);
        Ok(())
    }
}

pub struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= crate::config::LOG_LEVEL
    }

    #[cfg(target_arch = "x86")]
    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata())
            || crate::arch::x86::current_ring() != x86_64::PrivilegeLevel::Ring0
        {
            return;
        }
        let _line = port::LOCK.lock();
        let _ = format_record(&mut Writer, record.level(), record.target(), *record.args());
    }

    #[cfg(not(target_arch = "x86"))]
    fn log(&self, _record: &Record<'_>) {}

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Installs [`SerialLogger`] as the `log` backend.
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(crate::config::LOG_LEVEL);
    Ok(())
}
