//! Policy pipeline error kinds.

use thiserror::Error;

/// Errors raised while parsing, registering, or evaluating policies.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The DSL source failed to parse.
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// 1-based source line.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// The parsed policy failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Condition nesting exceeded the evaluator's depth bound.
    #[error("recursion limit exceeded at depth {depth}")]
    RecursionLimit {
        /// The depth that was exceeded.
        depth: usize,
    },

    /// Evaluation ran past its wall-clock deadline.
    #[error("evaluation timed out after {elapsed_ms}ms")]
    EvaluationTimeout {
        /// Elapsed time when the deadline fired.
        elapsed_ms: u64,
    },

    /// No policy registered under the id.
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// The id exists but not at the requested version.
    #[error("unknown version {version} for policy {id}")]
    UnknownVersion {
        /// Policy id.
        id: String,
        /// Requested version.
        version: u32,
    },
}

impl PolicyError {
    /// The stable kind token for telemetry and error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::Validation(_) => "validation_failed",
            Self::RecursionLimit { .. } => "recursion_limit",
            Self::EvaluationTimeout { .. } => "evaluation_timeout",
            Self::UnknownPolicy(_) => "unknown_policy",
            Self::UnknownVersion { .. } => "unknown_version",
        }
    }
}
