//! File logging for the scheduler, its workers and the CLI.
//!
//! Lines go to `~/.hive/hive.log`, which is truncated when the process
//! starts. The default threshold is INFO. `--debug` or `HIVE_DEBUG=1`
//! lowers it to DEBUG, and `HIVE_LOG=<level>` picks any level directly.
//!
//! - ERROR: a store or log write failed and the operation was abandoned
//! - WARN: dangling dependencies, failed attempts, skipped log lines
//! - INFO: task lifecycle (enqueue, claim, report, cancel)
//! - DEBUG: status transitions and message appends
//! - TRACE: wave assignment and ready-set computation

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    const ALL: [Level; 5] = [
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
        Level::Trace,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

impl FromStr for Level {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Level::ALL
            .into_iter()
            .find(|l| l.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::Error::Validation(format!("unknown log level: {}", s)))
    }
}

static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);
static SINK: OnceLock<Mutex<File>> = OnceLock::new();

/// Log to `~/.hive/hive.log`. Without a home directory nothing is written.
pub fn init_with_debug(debug: bool) {
    let threshold = threshold_from(
        debug,
        std::env::var("HIVE_DEBUG").ok().as_deref(),
        std::env::var("HIVE_LOG").ok().as_deref(),
    );
    if let Some(path) = dirs::home_dir().map(|h| h.join(".hive").join("hive.log")) {
        init_at(&path, threshold);
    } else {
        THRESHOLD.store(threshold as u8, Ordering::Relaxed);
    }
}

/// Log to `path` at `threshold`. Only the first sink installed is used.
pub fn init_at(path: &Path, threshold: Level) {
    THRESHOLD.store(threshold as u8, Ordering::Relaxed);
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path);
    if let Ok(file) = file {
        let _ = SINK.set(Mutex::new(file));
    }
}

/// Whether DEBUG lines are being written.
pub fn is_debug() -> bool {
    enabled(Level::Debug)
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

fn threshold_from(debug: bool, env_debug: Option<&str>, env_level: Option<&str>) -> Level {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = env_debug.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug || env_debug {
        Level::Debug
    } else {
        Level::Info
    }
}

fn format_line(time: impl fmt::Display, level: Level, args: fmt::Arguments<'_>) -> String {
    format!("[{}] [{}] {}\n", time, level.label(), args)
}

/// Write one line. Use the `hlog*` macros instead of calling this.
#[doc(hidden)]
pub fn emit(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let line = format_line(chrono::Local::now().format("%H:%M:%S%.3f"), level, args);
    if let Ok(mut file) = sink.lock() {
        let _ = file.write_all(line.as_bytes());
    }
}

#[macro_export]
macro_rules! hlog {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! hlog_error {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Level::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! hlog_warn {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Level::Warn, format_args!($($arg)*))
    };
}

/// Only written when debug mode is on.
#[macro_export]
macro_rules! hlog_debug {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Level::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! hlog_trace {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Level::Trace, format_args!($($arg)*))
    };
}
