//! The S4 analysis provider seam.
//!
//! Vendor adapters live outside the core; S4 talks to anything that
//! implements [`AnalysisProvider`]. Provider failures are mediated by the
//! S4 circuit breaker, and budget consumption goes through the S3 limiter
//! before a provider is ever invoked.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cyb_core::Episode;

/// Provider failure kinds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider cannot be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider shed the request.
    #[error("provider rate limited")]
    RateLimited,

    /// The provider answered with an error.
    #[error("provider error: {0}")]
    Failed(String),
}

impl ProviderError {
    /// The stable kind token for telemetry and error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "provider_unavailable",
            Self::RateLimited => "provider_rate_limited",
            Self::Failed(_) => "provider_error",
        }
    }
}

/// Result of analysing one episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    /// Human-readable summary.
    pub summary: String,
    /// Structured findings.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Anything that can analyse an episode for S4.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Provider name for telemetry and breaker naming.
    fn name(&self) -> &str;

    /// Analyse one episode.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`]; the caller's breaker treats any error
    /// as a failure signal.
    async fn analyze(&self, episode: &Episode) -> Result<AnalysisOutcome, ProviderError>;
}

/// Development provider: echoes the episode back as its own analysis.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProvider;

#[async_trait]
impl AnalysisProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn analyze(&self, episode: &Episode) -> Result<AnalysisOutcome, ProviderError> {
        Ok(AnalysisOutcome {
            summary: format!("echo: {}", episode.title),
            data: episode.data.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyb_core::{EpisodeKind, VsmSystem};

    #[tokio::test]
    async fn test_echo_provider() {
        let episode = Episode::new(EpisodeKind::Analysis, "check this", VsmSystem::S1);
        let outcome = EchoProvider.analyze(&episode).await.unwrap();
        assert_eq!(outcome.summary, "echo: check this");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ProviderError::Unavailable("down".to_string()).kind(),
            "provider_unavailable"
        );
        assert_eq!(ProviderError::RateLimited.kind(), "provider_rate_limited");
    }
}
