//! Telemetry error types.

use thiserror::Error;

/// Errors raised while configuring telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The logging configuration was invalid.
    #[error("telemetry configuration error: {0}")]
    ConfigError(String),

    /// The global subscriber could not be installed.
    #[error("telemetry init error: {0}")]
    InitError(String),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
