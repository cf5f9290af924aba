//! Leveled logging macros for use inside the crate.
//!
//! With the `log` feature enabled, every record is forwarded to the `log`
//! crate. Without it, the arguments still go through `format_args!` so the
//! call sites type-check identically, and the record is discarded.

/// Forwards one record to `::log` at the given level, or swallows it when
/// the `log` feature is off.
macro_rules! rlc_log {
    ($level:ident, $($arg:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::$level!($($arg)*);
        #[cfg(not(feature = "log"))]
        let _ = format_args!($($arg)*);
    }};
}

macro_rules! error {
    ($($arg:tt)*) => { rlc_log!(error, $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { rlc_log!(warn, $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { rlc_log!(info, $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { rlc_log!(debug, $($arg)*) };
}

macro_rules! trace {
    ($($arg:tt)*) => { rlc_log!(trace, $($arg)*) };
}
