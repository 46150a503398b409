//! Kernel logging
//!
//! Backs the `log` facade with a renderer that writes
//! `[LEVEL] target: message` lines to the firmware console. Installed
//! once at the post-translation entry; messages emitted earlier are
//! dropped by the facade.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!(
            "[{}] {}: {}",
            level_tag(record.level()),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. Safe to call once; later calls are ignored.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
