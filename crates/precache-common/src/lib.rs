//! # Precache Common
//!
//! Shared pieces for the precache crates.
//!
//! ## Features
//!
//! - Logging configuration and setup (`tracing-subscriber`)
//! - Wall-clock timestamps for cache bookkeeping

use std::time::{SystemTime, UNIX_EPOCH};

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};

/// Milliseconds since the Unix epoch.
///
/// A clock set before 1970 yields `0` rather than an error; the value is only
/// used to stamp cache entries.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
