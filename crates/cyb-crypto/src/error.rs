//! Error kinds for envelope signing and verification.

use thiserror::Error;

/// Errors produced while signing an envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignError {
    /// The active key material was rejected by the MAC implementation.
    #[error("invalid signing key material")]
    InvalidKey,
}

/// Errors produced while verifying an envelope.
///
/// Each variant maps one-to-one onto a boundary error kind; [`VerifyError::kind`]
/// returns the wire token used in telemetry and dead-letter annotations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The security block is absent or incomplete.
    #[error("missing security headers")]
    MissingSecurityHeaders,

    /// Timestamp is further in the future than the allowed skew.
    #[error("clock skew into the future: {skew_ms}ms beyond window")]
    ClockSkewFuture {
        /// Observed skew magnitude in milliseconds.
        skew_ms: u64,
    },

    /// Timestamp is older than the allowed skew but still inside the replay window.
    #[error("clock skew into the past: {skew_ms}ms beyond window")]
    ClockSkewPast {
        /// Observed skew magnitude in milliseconds.
        skew_ms: u64,
    },

    /// Timestamp is older than the replay window; the nonce may already be evicted.
    #[error("timestamp expired: {age_ms}ms old")]
    ExpiredTimestamp {
        /// Message age in milliseconds.
        age_ms: u64,
    },

    /// The nonce was already seen inside the replay window.
    #[error("replay detected: nonce previously seen")]
    ReplayDetected,

    /// No key registered under the envelope's `key_id`.
    #[error("unknown key id: {key_id}")]
    UnknownKey {
        /// The unresolvable key identifier.
        key_id: String,
    },

    /// Signature recomputation did not match.
    #[error("invalid signature")]
    InvalidSignature,
}

impl VerifyError {
    /// The stable kind token for telemetry and error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingSecurityHeaders => "missing_security_headers",
            Self::ClockSkewFuture { .. } => "clock_skew_future",
            Self::ClockSkewPast { .. } => "clock_skew_past",
            Self::ExpiredTimestamp { .. } => "expired_timestamp",
            Self::ReplayDetected => "replay_detected",
            Self::UnknownKey { .. } => "unknown_key",
            Self::InvalidSignature => "invalid_signature",
        }
    }

    /// Whether this failure means the message was a duplicate rather than tampered.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::ReplayDetected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tokens() {
        assert_eq!(
            VerifyError::MissingSecurityHeaders.kind(),
            "missing_security_headers"
        );
        assert_eq!(
            VerifyError::ClockSkewFuture { skew_ms: 5 }.kind(),
            "clock_skew_future"
        );
        assert_eq!(VerifyError::ReplayDetected.kind(), "replay_detected");
        assert!(VerifyError::ReplayDetected.is_replay());
        assert!(!VerifyError::InvalidSignature.is_replay());
    }
}
