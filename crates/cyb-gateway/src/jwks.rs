//! JWKS and discovery-document fetching with an SSRF guard.
//!
//! Documents are cached in a reader-protected map with a TTL. Fetches in
//! production must be HTTPS, never follow redirects, and resolve the host
//! before connecting so loopback, RFC1918, and link-local targets are
//! rejected outright.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// JWKS fetch failures.
#[derive(Debug, Error)]
pub enum JwksError {
    /// The URL failed validation.
    #[error("invalid jwks url: {0}")]
    InvalidUrl(String),

    /// The host resolved to a private or local address.
    #[error("jwks host rejected: {0}")]
    HostRejected(String),

    /// The fetch itself failed.
    #[error("jwks fetch failed: {0}")]
    Fetch(String),
}

struct CachedDoc {
    fetched_at: Instant,
    doc: serde_json::Value,
}

/// TTL cache of JWKS/discovery documents.
pub struct JwksCache {
    client: reqwest::Client,
    ttl: Duration,
    require_https: bool,
    cache: RwLock<HashMap<String, CachedDoc>>,
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("ttl", &self.ttl)
            .field("require_https", &self.require_https)
            .finish_non_exhaustive()
    }
}

impl JwksCache {
    /// Create a cache. `require_https` is on in production.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(ttl: Duration, require_https: bool) -> Result<Self, JwksError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| JwksError::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            ttl,
            require_https,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch a document, serving from cache within the TTL.
    ///
    /// # Errors
    ///
    /// Returns a [`JwksError`] on validation or fetch failure.
    pub async fn fetch(&self, url: &str) -> Result<serde_json::Value, JwksError> {
        if let Some(doc) = self.cached(url) {
            debug!(url, "jwks served from cache");
            return Ok(doc);
        }

        let parsed = self.validate_url(url)?;
        self.check_host(&parsed).await?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;
        if response.status().is_redirection() {
            return Err(JwksError::Fetch("redirects are refused".to_string()));
        }
        if !response.status().is_success() {
            return Err(JwksError::Fetch(format!("status {}", response.status())));
        }
        let doc: serde_json::Value = response
            .json()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        self.store(url, doc.clone());
        Ok(doc)
    }

    /// Validate scheme and shape without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::InvalidUrl`] on parse or scheme failures, and
    /// [`JwksError::HostRejected`] when the host is a literal private IP.
    pub fn validate_url(&self, url: &str) -> Result<url::Url, JwksError> {
        let parsed = url::Url::parse(url).map_err(|e| JwksError::InvalidUrl(e.to_string()))?;
        match parsed.scheme() {
            "https" => {},
            "http" if !self.require_https => {},
            other => {
                return Err(JwksError::InvalidUrl(format!(
                    "scheme {other} not allowed"
                )));
            },
        }
        let Some(host) = parsed.host() else {
            return Err(JwksError::InvalidUrl("missing host".to_string()));
        };
        // Literal IP hosts are checked immediately.
        if let url::Host::Ipv4(ip) = host
            && is_private(IpAddr::V4(ip))
        {
            return Err(JwksError::HostRejected(ip.to_string()));
        }
        if let url::Host::Ipv6(ip) = host
            && is_private(IpAddr::V6(ip))
        {
            return Err(JwksError::HostRejected(ip.to_string()));
        }
        Ok(parsed)
    }

    /// Resolve the hostname and reject private targets before connecting.
    async fn check_host(&self, url: &url::Url) -> Result<(), JwksError> {
        let Some(host) = url.host_str() else {
            return Err(JwksError::InvalidUrl("missing host".to_string()));
        };
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| JwksError::Fetch(format!("resolve {host}: {e}")))?;
        for addr in addrs {
            if is_private(addr.ip()) {
                warn!(host, ip = %addr.ip(), "jwks host resolves to private address");
                return Err(JwksError::HostRejected(format!("{host} -> {}", addr.ip())));
            }
        }
        Ok(())
    }

    fn cached(&self, url: &str) -> Option<serde_json::Value> {
        let cache = self
            .cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = cache.get(url)?;
        if entry.fetched_at.elapsed() <= self.ttl {
            Some(entry.doc.clone())
        } else {
            None
        }
    }

    fn store(&self, url: &str, doc: serde_json::Value) {
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.insert(
            url.to_string(),
            CachedDoc {
                fetched_at: Instant::now(),
                doc,
            },
        );
    }

    /// Pre-seed the cache (tests and warm boots).
    pub fn seed(&self, url: &str, doc: serde_json::Value) {
        self.store(url, doc);
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        },
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        },
    }
}
