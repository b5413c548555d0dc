//! Plugin-facing log levels on top of the `log` facade.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::LogLevel;


/// Highest accepted debug option.
pub const MAX_DEBUG_LEVEL: u32 = 9;


static OPTION_DEBUG: AtomicU32 = AtomicU32::new(0);


/// Sets the process-wide debug option (0 = none, 9 = maximum).
pub fn set_debug_level(level: u32) {
    OPTION_DEBUG.store(level.min(MAX_DEBUG_LEVEL), Ordering::Relaxed);
}


pub fn debug_level() -> u32 {
    OPTION_DEBUG.load(Ordering::Relaxed)
}


/// Whether a message at `level` would be emitted.
pub fn enabled(level: LogLevel) -> bool {
    match level {
        LogLevel::Debug => debug_level() > 0 && log::log_enabled!(target: "vmiop", log::Level::Trace),
        other => log::log_enabled!(target: "vmiop", to_log_level(other)),
    }
}


fn to_log_level(level: LogLevel) -> log::Level {
    match level {
        LogLevel::Fatal | LogLevel::Error => log::Level::Error,
        LogLevel::Notice => log::Level::Info,
        LogLevel::Status => log::Level::Debug,
        LogLevel::Debug => log::Level::Trace,
    }
}


/// Logs on behalf of `source`.
///
/// A `Fatal` message does not return: it ends the calling thread.
pub fn log(level: LogLevel, source: &str, args: fmt::Arguments<'_>) {
    if level == LogLevel::Fatal {
        fatal(source, args);
    }
    if level == LogLevel::Debug && debug_level() == 0 {
        return;
    }
    log::log!(target: "vmiop", to_log_level(level), "[{}] {}", source, args);
}


pub fn fatal(source: &str, args: fmt::Arguments<'_>) -> ! {
    log::error!(target: "vmiop", "[{}] fatal: {}", source, args);
    panic!("fatal error in {}: {}", source, args);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_level_is_clamped() {
        set_debug_level(42);
        assert_eq!(debug_level(), MAX_DEBUG_LEVEL);
        set_debug_level(0);
        assert_eq!(debug_level(), 0);
    }

    #[test]
    #[should_panic(expected = "fatal error in unit")]
    fn fatal_does_not_return() {
        log(LogLevel::Fatal, "unit", format_args!("bad state {}", 7));
    }
}
