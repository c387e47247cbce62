//! Bus and handler error kinds.

use thiserror::Error;

/// Errors surfaced by the broker, publisher, and consumer plumbing.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publish targeted an exchange that was never declared.
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    /// Operation targeted a queue that was never declared.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The broker refused the publish.
    #[error("publish nacked: {0}")]
    PublishNack(String),

    /// No broker confirm arrived inside the window.
    #[error("confirm timeout")]
    ConfirmTimeout,

    /// The broker task or a consumer channel is gone.
    #[error("channel down")]
    ChannelDown,

    /// Delivered bytes were not a valid envelope.
    #[error("decode error: {0}")]
    Decode(String),

    /// Envelope signing failed before publish.
    #[error("signing error: {0}")]
    Security(String),
}

impl BusError {
    /// The stable kind token for telemetry and error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownExchange(_) => "unknown_exchange",
            Self::UnknownQueue(_) => "unknown_queue",
            Self::PublishNack(_) => "publish_nack",
            Self::ConfirmTimeout => "confirm_timeout",
            Self::ChannelDown => "channel_down",
            Self::Decode(_) => "decode_error",
            Self::Security(_) => "security_error",
        }
    }
}

/// Errors produced by registered message handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No handler registered for the message type.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The handler exceeded its deadline.
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The handler failed; the consumer decides whether to retry.
    #[error("handler failed: {0}")]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// The stable kind token for telemetry and error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownType(_) => "unknown_type",
            Self::Timeout { .. } => "handler_timeout",
            Self::Failed(_) => "handler_exception",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tokens() {
        assert_eq!(BusError::ConfirmTimeout.kind(), "confirm_timeout");
        assert_eq!(BusError::ChannelDown.kind(), "channel_down");
        assert_eq!(
            HandlerError::UnknownType("x".to_string()).kind(),
            "unknown_type"
        );
        assert_eq!(HandlerError::Timeout { timeout_ms: 5 }.kind(), "handler_timeout");
    }
}
