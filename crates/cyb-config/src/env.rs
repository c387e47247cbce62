//! Environment loading through a testable variable provider.

use std::path::PathBuf;

use crate::types::{Config, Environment, SecretString};

/// The environment variables the loader recognizes.
pub const ENV_VARS: &[&str] = &[
    "CYB_ENV",
    "CYB_SITE",
    "CYB_BIND",
    "AMQP_URL",
    "AMQP_EXCHANGE",
    "CYBERNETIC_HMAC_SECRET",
    "SECRET_KEY_BASE",
    "CYB_BLOOM_FILE",
    "METRICS_PORT",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
    "TELEGRAM_WEBHOOK_SECRET",
    "CYBERNETIC_SYSTEM_API_KEY",
];

/// Load configuration from the process environment over defaults.
#[must_use]
pub fn from_env() -> Config {
    from_env_with(|name| std::env::var(name).ok())
}

/// Load configuration from an arbitrary variable provider (tests pass a
/// map; production passes `std::env::var`).
#[must_use]
pub fn from_env_with(var: impl Fn(&str) -> Option<String>) -> Config {
    let mut config = Config::default();

    if let Some(env) = var("CYB_ENV") {
        config.environment = match env.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        };
    }
    if let Some(site) = var("CYB_SITE") {
        config.site = site;
    }
    if config.site.is_empty() {
        config.site = "cybernetic-node".to_string();
    }
    if let Some(bind) = var("CYB_BIND") {
        config.gateway.bind = bind;
    }

    config.bus.url = var("AMQP_URL");
    if let Some(exchange) = var("AMQP_EXCHANGE") {
        config.bus.exchange = exchange;
    }

    config.security.hmac_secret = var("CYBERNETIC_HMAC_SECRET").map(SecretString::new);
    config.security.secret_key_base = var("SECRET_KEY_BASE").map(SecretString::new);
    config.security.bloom_file = var("CYB_BLOOM_FILE").map(PathBuf::from);

    if let Some(port) = var("METRICS_PORT").and_then(|p| p.parse().ok()) {
        config.gateway.metrics_port = Some(port);
    }
    config.otel_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT");
    config.gateway.telegram_webhook_secret = var("TELEGRAM_WEBHOOK_SECRET").map(SecretString::new);
    config.gateway.system_api_key = var("CYBERNETIC_SYSTEM_API_KEY").map(SecretString::new);

    config
}
