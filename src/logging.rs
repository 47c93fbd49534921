//! Leveled diagnostics.
//!
//! The teacher never reaches for a logging facade crate; it rolls its own
//! (`crate::log::LogLevel`, consumed as `LogLevel::LogDebug` throughout
//! `replay_syscall.rs` and `thread_group.rs`) gated by a `lazy_static`
//! global read once at startup, the same shape as `flags.rs`'s
//! `lazy_static! { static ref FLAGS: Flags = init_flags(); }`. This module
//! keeps that shape rather than pulling in `log`/`tracing`.

use lazy_static::lazy_static;
use std::io::Write;

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

lazy_static! {
    static ref THRESHOLD: LogLevel = init_threshold();
}

fn init_threshold() -> LogLevel {
    match std::env::var("TASKORD_LOG") {
        Ok(v) => match v.to_lowercase().as_str() {
            "error" => LogLevel::LogError,
            "warn" => LogLevel::LogWarn,
            "info" => LogLevel::LogInfo,
            "debug" => LogLevel::LogDebug,
            _ => LogLevel::LogWarn,
        },
        Err(_) => LogLevel::LogWarn,
    }
}

pub fn threshold() -> LogLevel {
    *THRESHOLD
}

#[doc(hidden)]
pub fn __log_impl(level: LogLevel, component: &str, args: std::fmt::Arguments<'_>) {
    if level > threshold() {
        return;
    }
    let tag = match level {
        LogLevel::LogFatal => "FATAL",
        LogLevel::LogError => "ERROR",
        LogLevel::LogWarn => "WARN",
        LogLevel::LogInfo => "INFO",
        LogLevel::LogDebug => "DEBUG",
    };
    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "[{}] {}: {}", tag, component, args);
    if level == LogLevel::LogFatal {
        let _ = stderr.flush();
        std::process::abort();
    }
}

/// `log!(LogLevel::LogWarn, "frame dropped: {}", reason)`.
///
/// The component tag defaults to the enclosing module path, matching how
/// the teacher's diagnostics are always attributable to a single
/// subsystem.
#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::logging::__log_impl($level, module_path!(), format_args!($($arg)*))
    };
}
