//! Custom error types for the runtime.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of
//! the device runtime. Using the `thiserror` crate, it provides a centralized and
//! consistent way to report failures from validators, the device lifecycle, the
//! cache protocol and the execution-mode gate.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: bad, missing or conflicting setup input. Never retried,
//!   always surfaced to the operator.
//! - **`Mode`**: the operation is not legal in the current execution mode.
//! - **`InvalidValue`**: a validator rejected a value. Carries the parameter name and
//!   the offending value for diagnostics.
//! - **`Communication`**: the cache or a device lock was unreachable or timed out.
//!   The only variant a caller may retry (see [`DaqError::is_retryable`]).
//! - **`Programming`**: a device type definition violates an invariant, e.g. a
//!   volatile parameter without a read hook. Caught at type registration.
//!
//! `ConfigLoad` and `Serialization` wrap errors from `figment` and `serde_json` so
//! that `?` works at the edges.

use serde_json::Value;
use thiserror::Error;

/// Convenience alias for results using the runtime error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    /// Setup input is missing, malformed or conflicting.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation not permitted in the current execution mode.
    #[error("Mode error: {0}")]
    Mode(String),

    /// Validator rejection.
    #[error("Invalid value {value} for parameter '{param}': {reason}")]
    InvalidValue {
        /// Parameter (or config key) being validated
        param: String,
        /// The raw value that was rejected
        value: Value,
        /// Human readable rejection reason
        reason: String,
    },

    /// Cache or lock unreachable, or a lock could not be acquired in time.
    #[error("Communication error: {0}")]
    Communication(String),

    /// A device type definition is internally inconsistent.
    #[error("Programming error: {0}")]
    Programming(String),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used by callers deciding how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Mode,
    InvalidValue,
    Communication,
    Programming,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Mode => "mode",
            ErrorKind::InvalidValue => "invalid_value",
            ErrorKind::Communication => "communication",
            ErrorKind::Programming => "programming",
        };
        f.write_str(label)
    }
}

impl DaqError {
    /// Configuration error attributed to a device.
    pub fn config(device: &str, msg: impl std::fmt::Display) -> Self {
        DaqError::Configuration(format!("{device}: {msg}"))
    }

    /// Mode error attributed to a device.
    pub fn mode(device: &str, msg: impl std::fmt::Display) -> Self {
        DaqError::Mode(format!("{device}: {msg}"))
    }

    /// Communication error attributed to a device.
    pub fn communication(device: &str, msg: impl std::fmt::Display) -> Self {
        DaqError::Communication(format!("{device}: {msg}"))
    }

    pub fn invalid(param: impl Into<String>, value: Value, reason: impl Into<String>) -> Self {
        DaqError::InvalidValue {
            param: param.into(),
            value,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Configuration(_) | DaqError::ConfigLoad(_) => ErrorKind::Configuration,
            DaqError::Mode(_) => ErrorKind::Mode,
            DaqError::InvalidValue { .. } => ErrorKind::InvalidValue,
            DaqError::Communication(_) => ErrorKind::Communication,
            DaqError::Programming(_) | DaqError::Serialization(_) => ErrorKind::Programming,
        }
    }

    /// Only transient cache/lock failures are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DaqError::Communication(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_only_for_communication() {
        assert!(DaqError::Communication("cache down".into()).is_retryable());
        assert!(!DaqError::Configuration("bad".into()).is_retryable());
        assert!(!DaqError::Mode("slave".into()).is_retryable());
        assert!(!DaqError::invalid("speed", json!(-1), "out of range").is_retryable());
    }

    #[test]
    fn test_invalid_value_message_names_param_and_value() {
        let err = DaqError::invalid("speed", json!("fast"), "not a number");
        let msg = err.to_string();
        assert!(msg.contains("speed"));
        assert!(msg.contains("\"fast\""));
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_device_prefixed_constructors() {
        let err = DaqError::config("m1", "device misses device 'motor' in configuration");
        assert_eq!(
            err.to_string(),
            "Configuration error: m1: device misses device 'motor' in configuration"
        );
        assert_eq!(DaqError::mode("m1", "x").kind(), ErrorKind::Mode);
        assert_eq!(ErrorKind::Communication.to_string(), "communication");
    }
}
