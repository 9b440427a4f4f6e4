//! Defines the kernel console that carries the log output.

use core::{fmt::Write, sync::atomic::AtomicBool};

#[cfg(debug_assertions)]
use log::LevelFilter;
use spin::{Mutex, Once};

use crate::serial::SerialWriter;

pub struct Console {
    has_output: AtomicBool,
    serial: Mutex<Option<SerialWriter>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    pub fn init() -> &'static Self {
        let console = Self::default();
        console.install();
        console
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(|| Console {
            has_output: AtomicBool::new(false),
            serial: Mutex::new(None),
        })
    }

    pub fn install(&'static self) {
        log::set_logger(self).unwrap();

        #[cfg(debug_assertions)]
        log::set_max_level(LevelFilter::Trace);

        #[cfg(not(debug_assertions))]
        log::set_max_level(log::LevelFilter::Info);
    }

    pub fn has_output(&self) -> bool {
        self.has_output.load(core::sync::atomic::Ordering::SeqCst)
    }

    pub fn attach_serial(&self, serial: SerialWriter) {
        let mut guard = self.serial.lock();
        *guard = Some(serial);
        self.has_output
            .store(true, core::sync::atomic::Ordering::SeqCst);
    }

    /// Writes raw bytes to the console, bypassing the log format.
    ///
    /// This is the output path for the terminal stream handed to user
    /// processes as their standard descriptors.
    pub fn write_bytes(&self, bytes: &[u8]) {
        if let Some(serial) = &mut *self.serial.lock() {
            for chunk in bytes.utf8_chunks() {
                let _ = serial.write_str(chunk.valid());
                if !chunk.invalid().is_empty() {
                    let _ = serial.write_str("\u{FFFD}");
                }
            }
        }
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Some(serial) = &mut *self.serial.lock() {
            write_log_entry_to(serial, record).unwrap();
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(
    writer: &mut impl core::fmt::Write,
    record: &log::Record,
) -> core::fmt::Result {
    writeln!(writer, "[{:5}] {}", record.level(), record.args())
}
