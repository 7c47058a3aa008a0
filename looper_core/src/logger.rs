//! Minimal stderr backend for the `log` facade.
//!
//! Lines look like `[1718000000123] [INFO] ThreadId(1): message`. Binaries
//! install it once with [`init`]; the library itself only emits through the
//! `log` macros.

use std::io::{self, Write};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Global stderr logger lock to avoid interleaved output from multiple threads.
static LOGGER_LOCK: Mutex<()> = Mutex::new(());

static LOGGER: StderrLogger = StderrLogger;

struct StderrLogger;

/// Formats one line without the trailing newline.
fn format_line(millis: u128, record: &Record<'_>) -> String {
    let tid = std::thread::current().id();
    format!("[{}] [{}] {:?}: {}", millis, record.level(), tid, record.args())
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let line = format_line(millis, record);
        // A poisoned lock only means another thread panicked mid-write.
        let _guard = LOGGER_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(io::stderr(), "{}", line);
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Installs the stderr logger with `level`. Fails if another logger is
/// already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
