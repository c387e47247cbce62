//! Authentication against an external identity component.
//!
//! The gateway accepts a bearer token or an API key and resolves it to a
//! tenant through an [`IdentityVerifier`]. In development mode only,
//! unauthenticated requests receive the configured default tenant.

use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;

use cyb_core::TenantId;

use crate::error::AdmissionError;

/// Authenticator behavior switches.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Whether unauthenticated requests fall back to the default tenant.
    pub dev_mode: bool,
    /// The tenant assigned in development fallback.
    pub default_tenant: TenantId,
}

/// Resolves credentials to tenants; production wires this to the external
/// identity component, tests use [`StaticKeyVerifier`].
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Unauthorized`] for unknown credentials.
    async fn verify_bearer(&self, token: &str) -> Result<TenantId, AdmissionError>;

    /// Resolve an API key.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Unauthorized`] for unknown credentials.
    async fn verify_api_key(&self, key: &str) -> Result<TenantId, AdmissionError>;
}

/// Static credential table: API keys and tokens mapped to tenants.
#[derive(Debug, Default)]
pub struct StaticKeyVerifier {
    credentials: HashMap<String, TenantId>,
}

impl StaticKeyVerifier {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `credential` as `tenant`.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>, tenant: TenantId) -> Self {
        self.credentials.insert(credential.into(), tenant);
        self
    }

    fn resolve(&self, credential: &str) -> Result<TenantId, AdmissionError> {
        self.credentials
            .get(credential)
            .cloned()
            .ok_or_else(|| AdmissionError::Unauthorized("unknown credential".to_string()))
    }
}

#[async_trait]
impl IdentityVerifier for StaticKeyVerifier {
    async fn verify_bearer(&self, token: &str) -> Result<TenantId, AdmissionError> {
        self.resolve(token)
    }

    async fn verify_api_key(&self, key: &str) -> Result<TenantId, AdmissionError> {
        self.resolve(key)
    }
}

/// The authentication stage of the admission pipeline.
pub struct Authenticator {
    config: AuthConfig,
    verifier: Arc<dyn IdentityVerifier>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Create an authenticator.
    #[must_use]
    pub fn new(config: AuthConfig, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { config, verifier }
    }

    /// Resolve the request's credentials to a tenant.
    ///
    /// Order: `Authorization: Bearer` first, then `x-api-key`, then the
    /// development fallback.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Unauthorized`] when no credential is
    /// acceptable.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<TenantId, AdmissionError> {
        if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
            let text = value
                .to_str()
                .map_err(|_| AdmissionError::Unauthorized("malformed authorization".to_string()))?;
            let Some(token) = text.strip_prefix("Bearer ") else {
                return Err(AdmissionError::Unauthorized(
                    "authorization scheme must be Bearer".to_string(),
                ));
            };
            return self.verifier.verify_bearer(token.trim()).await;
        }

        if let Some(value) = headers.get("x-api-key") {
            let key = value
                .to_str()
                .map_err(|_| AdmissionError::Unauthorized("malformed api key".to_string()))?;
            return self.verifier.verify_api_key(key.trim()).await;
        }

        if self.config.dev_mode {
            return Ok(self.config.default_tenant.clone());
        }
        Err(AdmissionError::Unauthorized("missing credentials".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn authenticator(dev_mode: bool) -> Authenticator {
        let verifier = StaticKeyVerifier::new()
            .with_credential("token-x", TenantId::parse("tenant-x").unwrap())
            .with_credential("key-y", TenantId::parse("tenant-y").unwrap());
        Authenticator::new(
            AuthConfig {
                dev_mode,
                default_tenant: TenantId::parse("dev").unwrap(),
            },
            Arc::new(verifier),
        )
    }

    #[tokio::test]
    async fn test_bearer_token() {
        let auth = authenticator(false);
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-x"),
        );
        assert_eq!(
            auth.authenticate(&headers).await.unwrap().as_str(),
            "tenant-x"
        );
    }

    #[tokio::test]
    async fn test_api_key() {
        let auth = authenticator(false);
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("key-y"));
        assert_eq!(
            auth.authenticate(&headers).await.unwrap().as_str(),
            "tenant-y"
        );
    }

    #[tokio::test]
    async fn test_unknown_credential_rejected() {
        let auth = authenticator(false);
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer nope"),
        );
        assert!(matches!(
            auth.authenticate(&headers).await,
            Err(AdmissionError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_rejected() {
        let auth = authenticator(true);
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(auth.authenticate(&headers).await.is_err());
    }

    #[tokio::test]
    async fn test_dev_fallback() {
        let auth = authenticator(true);
        assert_eq!(
            auth.authenticate(&HeaderMap::new()).await.unwrap().as_str(),
            "dev"
        );

        let strict = authenticator(false);
        assert!(strict.authenticate(&HeaderMap::new()).await.is_err());
    }
}
