//! Switchable logging macros for the chatty session loops.
//!
//! Tick loops, the snapshot mirror and the reconciliation pass log on every
//! iteration, which drowns everything else at `info`. Each of those modules
//! declares a flag and routes its logging through these macros:
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_debug, log_info, log_warn};
//!
//! log_info!("mirror loop started");
//! ```

/// Info-level log gated on the caller's `ENABLE_LOGS` constant.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Debug-level log gated on the caller's `ENABLE_LOGS` constant.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

/// Warn-level log gated on the caller's `ENABLE_LOGS` constant.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Error-level log gated on the caller's `ENABLE_LOGS` constant.
///
/// Errors that must always surface (persistence failures, hardware faults)
/// should call `log::error!` directly instead.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
