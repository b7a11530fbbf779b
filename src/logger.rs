//! Ambient logging (`SPEC_FULL.md`, Ambient Logging). Two layers: a thin
//! `log::Log` implementation backed by the serial port, installed once at
//! boot via [`init`], and the boot-sequence `LOGGER::{ok,warn,failed}` /
//! `log!` macro idiom the teacher used for step-by-step init narration
//! (`[ OK ]`, `[ WARN ]`, `[FAILED]` tags), now emitted over serial instead
//! of the framebuffer the teacher's stub left commented out.
use core::fmt;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER_FACADE: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        crate::serial_println!("[{}] {}", level, record.args());
    }

    fn flush(&self) {}
}

/// Installs the serial-backed `log` facade. Must be called at most once,
/// before any `log::info!`/`log::warn!`/... call.
pub fn init() {
    log::set_logger(&LOGGER_FACADE)
        .map(|()| log::set_max_level(LevelFilter::Trace))
        .expect("logger already initialized");
}

pub struct LOGGER;

impl LOGGER {
    pub fn failed(fmt: fmt::Arguments) {
        crate::serial_println!("[FAILED] {}", fmt);
    }

    pub fn warn(fmt: fmt::Arguments) {
        crate::serial_println!("[ WARN ] {}", fmt);
    }

    pub fn ok(fmt: fmt::Arguments) {
        crate::serial_println!("[  OK  ] {}", fmt);
    }
}

#[macro_export]
macro_rules! log {
    ( $method:ident, $($arg:tt)* ) => {{
        use $crate::logger::LOGGER;
        LOGGER::$method(format_args!($($arg)*));
    }};
}
