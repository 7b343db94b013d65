//! Injectable logging context.
//!
//! A [`Logger`] holds a callback and an atomic severity threshold. Sessions
//! receive one explicitly; the C ABI keeps a single process-wide instance
//! obtained through a [`LoggerFactory`], where the first caller decides the
//! callback and later callers share it.
//!
//! Without a user callback, messages go to `tracing`.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Message severity, ordered from most to least important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
}

impl LogLevel {
    pub fn from_raw(v: u32) -> Result<Self, crate::Error> {
        match v {
            1 => Ok(LogLevel::Error),
            2 => Ok(LogLevel::Warn),
            3 => Ok(LogLevel::Info),
            4 => Ok(LogLevel::Verbose),
            5 => Ok(LogLevel::Debug),
            other => Err(crate::Error::InvalidArgument(format!(
                "log level {other} out of range 1..=5"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Verbose => "VERBOSE",
            LogLevel::Debug => "DEBUG",
        };
        f.write_str(s)
    }
}

/// Receives the level, milliseconds since the logger was created, and the
/// rendered message.
pub type LogCallback = Arc<dyn Fn(LogLevel, u64, &str) + Send + Sync>;

pub struct Logger {
    callback: LogCallback,
    max_level: AtomicU32,
    epoch: Instant,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("max_level", &self.max_level())
            .finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(callback: LogCallback, max_level: LogLevel) -> Self {
        Self {
            callback,
            max_level: AtomicU32::new(max_level as u32),
            epoch: Instant::now(),
        }
    }

    /// Logger that forwards to the `tracing` macros.
    pub fn with_tracing(max_level: LogLevel) -> Self {
        Self::new(Arc::new(forward_to_tracing), max_level)
    }

    pub fn max_level(&self) -> LogLevel {
        LogLevel::from_raw(self.max_level.load(Ordering::Relaxed)).unwrap_or(LogLevel::Error)
    }

    pub fn set_max_level(&self, level: LogLevel) {
        self.max_level.store(level as u32, Ordering::Relaxed);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level as u32 <= self.max_level.load(Ordering::Relaxed)
    }

    /// Arguments are only rendered when `level` passes the threshold.
    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        match args.as_str() {
            Some(s) => (self.callback)(level, elapsed, s),
            None => (self.callback)(level, elapsed, &args.to_string()),
        }
    }

    /// Entry point for messages that arrive already rendered, e.g. from the
    /// vendor runtime's own log callback.
    pub fn log_str(&self, level: LogLevel, message: &str) {
        if self.enabled(level) {
            (self.callback)(level, self.epoch.elapsed().as_millis() as u64, message);
        }
    }
}

fn forward_to_tracing(level: LogLevel, elapsed_ms: u64, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(elapsed_ms, "{message}"),
        LogLevel::Warn => tracing::warn!(elapsed_ms, "{message}"),
        LogLevel::Info => tracing::info!(elapsed_ms, "{message}"),
        LogLevel::Verbose => tracing::debug!(elapsed_ms, "{message}"),
        LogLevel::Debug => tracing::trace!(elapsed_ms, "{message}"),
    }
}

/// Lazily creates one shared [`Logger`]. The first call to
/// [`get_or_init`](Self::get_or_init) wins; later callbacks are ignored and
/// only the level is updated.
pub struct LoggerFactory {
    slot: Mutex<Option<Arc<Logger>>>,
}

impl LoggerFactory {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn get_or_init(&self, callback: Option<LogCallback>, max_level: LogLevel) -> Arc<Logger> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(logger) = slot.as_ref() {
            logger.set_max_level(max_level);
            return Arc::clone(logger);
        }
        let logger = Arc::new(match callback {
            Some(cb) => Logger::new(cb, max_level),
            None => Logger::with_tracing(max_level),
        });
        *slot = Some(Arc::clone(&logger));
        logger
    }

    /// The shared logger, if one has been created.
    pub fn get(&self) -> Option<Arc<Logger>> {
        self.slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(Arc::clone)
    }
}

impl Default for LoggerFactory {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! accel_log {
    ($logger:expr, $level:expr, $($arg:tt)+) => {
        $logger.log($level, format_args!($($arg)+))
    };
}

macro_rules! accel_error {
    ($logger:expr, $($arg:tt)+) => { accel_log!($logger, $crate::log::LogLevel::Error, $($arg)+) };
}

macro_rules! accel_warn {
    ($logger:expr, $($arg:tt)+) => { accel_log!($logger, $crate::log::LogLevel::Warn, $($arg)+) };
}

macro_rules! accel_info {
    ($logger:expr, $($arg:tt)+) => { accel_log!($logger, $crate::log::LogLevel::Info, $($arg)+) };
}

macro_rules! accel_debug {
    ($logger:expr, $($arg:tt)+) => { accel_log!($logger, $crate::log::LogLevel::Debug, $($arg)+) };
}
