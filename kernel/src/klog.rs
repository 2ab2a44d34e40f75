// Wires the `log` crate onto the console printer, so kernel code can use
// log::{error,warn,info,debug,trace}! instead of ad hoc printf! calls.
//
// There's no runtime config file to read a level from; the ceiling is a
// compile-time choice here, the same way the rest of the kernel's
// configuration surface (param.rs) is compile-time.

use log::{Level, LevelFilter, Log, Metadata, Record};

const MAX_LEVEL: LevelFilter = if cfg!(debug_assertions) {
    LevelFilter::Debug
} else {
    LevelFilter::Info
};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= MAX_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        printf!("[{}] {}\n", tag, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Must run once, on the boot hart, after Printer::init().
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(MAX_LEVEL))
        .ok();
}
