//! `log` backend for the loader.
//!
//! Records are kept in a fixed buffer until the serial port is initialised,
//! then flushed and written straight to COM1 from there on.

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

const BUFFER_SIZE: usize = 8192;

/// Buffer for log records emitted before serial is initialized.
struct LogBuffer {
    buffer: [u8; BUFFER_SIZE],
    position: usize,
}

impl LogBuffer {
    const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            position: 0,
        }
    }

    fn contents(&self) -> &str {
        core::str::from_utf8(&self.buffer[..self.position]).unwrap_or("<invalid UTF-8>")
    }

    fn clear(&mut self) {
        self.position = 0;
    }
}

impl Write for LogBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = BUFFER_SIZE - self.position;

        // Full: keep the oldest records, drop the new one.
        if bytes.len() > remaining {
            return Ok(());
        }

        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LoggerState {
    Buffering,
    SerialReady,
}

pub struct BootLogger {
    buffer: Mutex<LogBuffer>,
    state: Mutex<LoggerState>,
}

impl BootLogger {
    const fn new() -> Self {
        BootLogger {
            buffer: Mutex::new(LogBuffer::new()),
            state: Mutex::new(LoggerState::Buffering),
        }
    }

    /// Call once COM1 is initialized: flushes buffered records to serial.
    pub fn serial_ready(&self) {
        let mut state = self.state.lock();
        let mut buffer = self.buffer.lock();

        if buffer.position > 0 {
            emit(format_args!("{}", buffer.contents()));
            buffer.clear();
        }

        *state = LoggerState::SerialReady;
    }
}

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let state = match self.state.try_lock() {
            Some(state) => *state,
            None => return,
        };

        match state {
            LoggerState::Buffering => {
                if let Some(mut buffer) = self.buffer.try_lock() {
                    let _ = writeln!(
                        &mut *buffer,
                        "[{:>5}] {}: {}",
                        record.level(),
                        record.target(),
                        record.args()
                    );
                }
            }
            LoggerState::SerialReady => {
                emit(format_args!(
                    "[{:>5}] {}: {}\n",
                    record.level(),
                    record.target(),
                    record.args()
                ));
            }
        }
    }

    fn flush(&self) {}
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn emit(args: fmt::Arguments) {
    let _ = crate::serial::try_print(args);
}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn emit(_args: fmt::Arguments) {}

pub static LOGGER: BootLogger = BootLogger::new();

/// Install the loader logger. Later calls are ignored.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_accumulates_records() {
        let mut buffer = LogBuffer::new();
        write!(buffer, "[{:>5}] usb: {}\n", "INFO", "bus 1").unwrap();
        write!(buffer, "second\n").unwrap();
        assert_eq!(buffer.contents(), "[ INFO] usb: bus 1\nsecond\n");
    }

    #[test]
    fn test_full_buffer_drops_new_records() {
        let mut buffer = LogBuffer::new();
        let chunk = "x".repeat(BUFFER_SIZE - 4);
        buffer.write_str(&chunk).unwrap();
        buffer.write_str("too long").unwrap();
        assert_eq!(buffer.position, BUFFER_SIZE - 4);
        buffer.write_str("ok").unwrap();
        assert_eq!(buffer.position, BUFFER_SIZE - 2);
    }

    #[test]
    fn test_serial_ready_switches_state() {
        let logger = BootLogger::new();
        logger.buffer.lock().write_str("early\n").unwrap();
        logger.serial_ready();
        assert_eq!(*logger.state.lock(), LoggerState::SerialReady);
        assert_eq!(logger.buffer.lock().position, 0);
    }
}
