//! Leveled logging facade.
//!
//! The teacher crate carries no logging dependency of its own (its CLI just
//! prints with `println!`), but every server-shaped crate in the retrieval
//! pack reaches for the `log` facade instead. This core does the same: it
//! never decides where log lines land, it just emits through `log`'s
//! macros and leaves sink configuration (env_logger, syslog, journald, ...)
//! to the host process.

/// Verbose, per-record detail: cached-plaintext drains, repeated-read tick
/// bookkeeping. Disabled by default in any sink that only enables `info`.
macro_rules! log_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

/// Normal operational events: handshake completion, rotation, renegotiation
/// phase transitions. Maps to Redis's `LL_NOTICE`.
macro_rules! log_notice {
    ($($arg:tt)*) => { log::info!($($arg)*) };
}

/// Recoverable but noteworthy: repeated-read scheduling failure, a
/// handshake that failed for a single connection. Maps to `LL_WARNING`.
macro_rules! log_warning {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}

pub(crate) use log_debug;
pub(crate) use log_notice;
pub(crate) use log_warning;
