//! Ambient logging hook.
//!
//! The vnode's own logging framework is out of scope for this crate (see
//! `spec.md` §1); what this crate owns is the callback seam the real
//! framework plugs into, the same shape the storage layer exposes for
//! `sqlite3_log`: a process-wide, swappable sink behind a mutex, falling
//! back to stderr when nothing is installed.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Debug,
}

static LOG_CALLBACK: Mutex<Option<Box<dyn Fn(LogLevel, &str) + Send + Sync>>> = Mutex::new(None);

/// Emit a log message through the installed callback, or stderr if none is set.
pub fn log_message(level: LogLevel, message: &str) {
    if let Ok(guard) = LOG_CALLBACK.lock() {
        if let Some(ref callback) = *guard {
            callback(level, message);
            return;
        }
    }
    eprintln!("[vnode-runtime-core {:?}] {}", level, message);
}

/// Install a log callback, replacing any previously installed one.
pub fn set_log_callback(callback: impl Fn(LogLevel, &str) + Send + Sync + 'static) {
    if let Ok(mut guard) = LOG_CALLBACK.lock() {
        *guard = Some(Box::new(callback));
    }
}

/// Remove the installed log callback, reverting to the stderr fallback.
pub fn clear_log_callback() {
    if let Ok(mut guard) = LOG_CALLBACK.lock() {
        *guard = None;
    }
}

macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log::log_message($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::log_message($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
