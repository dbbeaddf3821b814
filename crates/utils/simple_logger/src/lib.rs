//! a simple logger

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Lazy;

struct SimpleLogger {
    clog: LevelFilter,
}

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if self.clog >= record.level() {
            let color = match record.level() {
                Level::Error => 31, // Red
                Level::Warn => 93,  // BrightYellow
                Level::Info => 34,  // Blue
                Level::Debug => 32, // Green
                Level::Trace => 90, // BrightBlack
            };
            println!(
                "\u{1B}[{}m[{:>5}] {}\u{1B}[0m",
                color,
                record.level(),
                record.args(),
            );
        }
    }
    fn flush(&self) {}
}

/// initiate logger
///
/// 可重复调用，只有第一次生效
pub fn init() {
    static LOGGER: Lazy<SimpleLogger> = Lazy::new(|| {
        let clog = match std::env::var("VM_CLOG").as_deref() {
            Ok("ERROR") => LevelFilter::Error,
            Ok("WARN") => LevelFilter::Warn,
            Ok("INFO") => LevelFilter::Info,
            Ok("DEBUG") => LevelFilter::Debug,
            Ok("TRACE") => LevelFilter::Trace,
            _ => LevelFilter::Off,
        };
        SimpleLogger { clog }
    });

    if log::set_logger(&*LOGGER).is_ok() {
        log::set_max_level(LOGGER.clog);
    }
}
