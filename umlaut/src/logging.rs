//! Logging for the umlaut daemon.
//!
//! `initialize()` is called exactly once during startup. Messages go to
//! stdout, which a service manager routes to the journal. When `RUST_LOG`
//! is defined, `env_logger` takes over instead.

use std::env;
use std::io::{self, LineWriter, Stdout, Write};
use std::sync::Mutex;

use log::LevelFilter;

pub fn initialize(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_max_level(level);

    if env::var("RUST_LOG").is_ok() {
        env_logger::try_init()
    } else {
        log::set_boxed_logger(Box::new(Logger::new()))
    }
}

struct Logger {
    stdout: Mutex<LineWriter<Stdout>>,
}

impl Logger {
    fn new() -> Self {
        Logger { stdout: Mutex::new(LineWriter::new(io::stdout())) }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) || !record.target().starts_with("umlaut") {
            return;
        }

        let msg = format!("[{}] {}\n", record.level(), record.args());
        if let Ok(ref mut stdout) = self.stdout.lock() {
            let _ = stdout.write_all(msg.as_bytes());
        }
    }

    fn flush(&self) {}
}
