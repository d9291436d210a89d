//! Logging backend for the transfer binaries.
//!
//! Records go to stderr: on the client, stdout is reserved for the
//! delivered file bytes.

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::{LineWriter, Stderr, Write, stderr};
use std::sync::Mutex;

/// Timestamped stderr logger.
///
/// Each record is formatted on the calling thread and written through a
/// mutex-guarded line writer, so lines from concurrent tasks never
/// interleave mid-record.
pub struct OpalLogger {
    filter: LevelFilter,
    sink: Mutex<LineWriter<Stderr>>,
}

impl OpalLogger {
    pub fn new(filter: LevelFilter) -> Self {
        Self {
            filter,
            sink: Mutex::new(LineWriter::new(stderr())),
        }
    }

    /// Installs the logger as the global `log` backend.
    pub fn init(filter: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_max_level(filter);
        log::set_boxed_logger(Box::new(Self::new(filter)))
    }
}

impl Log for OpalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stamp = Local::now().format("%H:%M:%S%.3f");
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(
                sink,
                "{stamp} {:<5} {} - {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}
