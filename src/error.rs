//! Error types for the programming station.
//!
//! Two layers of errors exist and are deliberately kept apart:
//!
//! - [`RigError`] is the crate-level error for infrastructure failures
//!   (configuration, I/O, transport). It is the error type of fallible
//!   constructors and adapters.
//! - [`RunError`] is the run-level error recorded on a run record. It is a
//!   stable error *code* (optionally with free text) that short-circuits the
//!   current pipeline but never crashes the orchestrator: finalization always
//!   runs, state is always persisted and a `finished` event is always
//!   published.
//!
//! Device/protocol faults are mapped to stable code strings
//! (`GLP2:FAULT:<status>`, `GLP2:TEST_STEP_FAILURE`, ...) rather than
//! propagating raw parse errors; anything unrecognized becomes
//! `GLP2:UNEXPECTED_RESPONSE`.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Error code recorded as the terminal outcome of a failed run.
///
/// The run contract allows either a bare code string or a composite carrying
/// code plus free text; both shapes are covered here. Finalization treats
/// `code` as the full error code and `message` as the optional exception
/// detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Terminal error code of a cancelled run. Cancellation always takes
/// precedence over any concurrently resolved error.
pub const CANCELLED: &str = "CANCELLED";

impl RunError {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
        }
    }

    pub fn with_message(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self::code(CANCELLED)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == CANCELLED
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => f.write_str(&self.code),
        }
    }
}

impl std::error::Error for RunError {}

impl From<&str> for RunError {
    fn from(code: &str) -> Self {
        Self::code(code)
    }
}

impl From<String> for RunError {
    fn from(code: String) -> Self {
        Self::code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_display() {
        assert_eq!(
            RunError::code("MISSING_FEATURE_FILE").to_string(),
            "MISSING_FEATURE_FILE"
        );
        assert_eq!(
            RunError::with_message("FEATURE_FILE_ERROR", "permission denied").to_string(),
            "FEATURE_FILE_ERROR: permission denied"
        );
    }

    #[test]
    fn cancelled_is_recognized() {
        assert!(RunError::cancelled().is_cancelled());
        assert!(!RunError::code("GLP2:TESTER_NOT_READY").is_cancelled());
    }
}
