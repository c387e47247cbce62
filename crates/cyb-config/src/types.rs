//! The configuration tree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Deployment environment; selects fail-closed or permissive behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Permissive: generated secrets, default tenant for anonymous calls.
    #[default]
    Development,
    /// Fail-closed: missing or weak secrets refuse to boot.
    Production,
}

impl Environment {
    /// Whether this is production.
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// A secret value: zeroized on drop, redacted in debug output.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret for use at a construction site.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString(<{} bytes>)", self.0.len())
    }
}

/// Bus and consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// External broker URL when one is attached (`AMQP_URL`).
    pub url: Option<String>,
    /// Main exchange name (`AMQP_EXCHANGE`).
    pub exchange: String,
    /// Per-message TTL on the VSM work queues, seconds.
    pub queue_ttl_secs: u64,
    /// Delayed-retry interval, seconds.
    pub retry_ttl_secs: u64,
    /// Consumer prefetch.
    pub prefetch: usize,
    /// Requeue passes before terminal failure.
    pub retry_cap: u32,
    /// Confirm timeout, milliseconds.
    pub confirm_timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            url: None,
            exchange: "cyb.events".to_string(),
            queue_ttl_secs: 300,
            retry_ttl_secs: 15,
            prefetch: 16,
            retry_cap: 3,
            confirm_timeout_ms: 5_000,
        }
    }
}

/// Envelope security and replay-ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// HMAC signing secret (`CYBERNETIC_HMAC_SECRET`); required in production.
    pub hmac_secret: Option<SecretString>,
    /// Cookie/session base secret (`SECRET_KEY_BASE`); >= 64 chars in production.
    pub secret_key_base: Option<SecretString>,
    /// Active signing key id.
    pub key_id: String,
    /// Clock-skew tolerance, seconds.
    pub max_skew_secs: u64,
    /// Replay window, seconds (up to 24 h).
    pub replay_window_secs: u64,
    /// Bloom filter sizing.
    pub bloom_capacity: usize,
    /// Bloom target false-positive rate.
    pub bloom_fp_rate: f64,
    /// Optional bloom persistence file (`CYB_BLOOM_FILE`).
    pub bloom_file: Option<PathBuf>,
    /// Ledger compaction interval, seconds.
    pub compaction_secs: u64,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            hmac_secret: None,
            secret_key_base: None,
            key_id: "k1".to_string(),
            max_skew_secs: 30,
            replay_window_secs: 90,
            bloom_capacity: 100_000,
            bloom_fp_rate: 1e-3,
            bloom_file: None,
            compaction_secs: 60,
        }
    }
}

/// Edge gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// HTTP bind address.
    pub bind: String,
    /// Separate metrics port (`METRICS_PORT`), when exposed standalone.
    pub metrics_port: Option<u16>,
    /// SSE heartbeat interval, seconds.
    pub heartbeat_secs: u64,
    /// Telegram webhook shared secret (`TELEGRAM_WEBHOOK_SECRET`).
    pub telegram_webhook_secret: Option<SecretString>,
    /// API key accepted for system clients (`CYBERNETIC_SYSTEM_API_KEY`).
    pub system_api_key: Option<SecretString>,
    /// Tenant assigned to unauthenticated calls in development.
    pub dev_default_tenant: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            metrics_port: None,
            heartbeat_secs: 30,
            telegram_webhook_secret: None,
            system_api_key: None,
            dev_default_tenant: "dev".to_string(),
        }
    }
}

/// Token-bucket defaults for the edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Bucket capacity.
    pub capacity: u32,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_rate: 1.0,
        }
    }
}

/// Circuit-breaker defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Base failure threshold.
    pub base_threshold: f64,
    /// Consecutive successes to close from half-open.
    pub success_threshold: u32,
    /// Call deadline, milliseconds.
    pub call_timeout_ms: u64,
    /// First recovery delay, milliseconds.
    pub recovery_initial_ms: u64,
    /// Recovery backoff cap, milliseconds.
    pub recovery_max_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            base_threshold: 5.0,
            success_threshold: 2,
            call_timeout_ms: 30_000,
            recovery_initial_ms: 1_000,
            recovery_max_ms: 300_000,
        }
    }
}

/// Fair-share coordinator defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// System-wide concurrency ceiling.
    pub max_slots: usize,
    /// Aging unit, milliseconds.
    pub aging_ms: u64,
    /// Boost per aging unit.
    pub aging_boost: f64,
    /// Cap on aging units.
    pub aging_cap: f64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_slots: 32,
            aging_ms: 5_000,
            aging_boost: 5.0,
            aging_cap: 10.0,
        }
    }
}

/// Context graph sync settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Delta ship interval, milliseconds.
    pub ship_interval_ms: u64,
    /// Write debounce, milliseconds.
    pub debounce_ms: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            ship_interval_ms: 200,
            debounce_ms: 20,
        }
    }
}

/// Policy evaluator settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Recursion depth bound.
    pub max_depth: usize,
    /// Evaluation deadline, milliseconds.
    pub timeout_ms: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_depth: 100,
            timeout_ms: 100,
        }
    }
}

/// The full configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment environment.
    pub environment: Environment,
    /// This node's site name.
    pub site: String,
    /// Bus settings.
    pub bus: BusSettings,
    /// Security settings.
    pub security: SecuritySettings,
    /// Gateway settings.
    pub gateway: GatewaySettings,
    /// Rate-limiter settings.
    pub limiter: LimiterSettings,
    /// Breaker settings.
    pub breaker: BreakerSettings,
    /// Coordinator settings.
    pub coordinator: CoordinatorSettings,
    /// Context graph settings.
    pub context: ContextSettings,
    /// Policy settings.
    pub policy: PolicySettings,
    /// OTLP endpoint (`OTEL_EXPORTER_OTLP_ENDPOINT`), forwarded to collectors.
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns the TOML error on malformed input.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bus.exchange, "cyb.events");
        assert_eq!(config.security.replay_window_secs, 90);
        assert_eq!(config.security.bloom_capacity, 100_000);
        assert_eq!(config.gateway.heartbeat_secs, 30);
        assert_eq!(config.policy.max_depth, 100);
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_text = r#"
            environment = "production"
            site = "node-7"

            [bus]
            queue_ttl_secs = 120

            [security]
            hmac_secret = "super-secret-material-here"
        "#;
        let config = Config::from_toml(toml_text).unwrap();
        assert!(config.environment.is_production());
        assert_eq!(config.site, "node-7");
        assert_eq!(config.bus.queue_ttl_secs, 120);
        assert_eq!(config.bus.retry_ttl_secs, 15); // default survives partial tables
        assert_eq!(
            config.security.hmac_secret.as_ref().map(SecretString::len),
            Some(26)
        );
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = SecretString::new("hunter2");
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
