//! The Cybernetic control plane daemon.
//!
//! Boot order: configuration (file, then environment) -> production
//! validation -> logging -> broker and topology -> security envelope and
//! replay ledger -> control primitives -> VSM consumers -> context graph ->
//! edge gateway. Shutdown cancels every component and flushes the bloom
//! file when one is configured.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cyb_bus::{Broker, BrokerConfig, Publisher, PublisherConfig, Topology};
use cyb_config::{Config, Environment};
use cyb_context::{ContextGraph, GraphNetwork, SyncConfig};
use cyb_control::{
    BreakerConfig, BreakerRegistry, CoordinatorConfig, FairShareCoordinator, RateLimiter,
    TokenBucketConfig,
};
use cyb_core::SiteId;
use cyb_crypto::{EnvelopeCodec, KeyRing, ReplayConfig, ReplayLedger, SecretKey, SkewPolicy};
use cyb_gateway::{AppState, AuthConfig, Authenticator, Gateway, SseBroker, SseConfig, StaticKeyVerifier};
use cyb_policy::{Evaluator, PolicyRegistry};
use cyb_telemetry::{Counters, LogConfig, setup_logging};
use cyb_vsm::{EchoProvider, VsmDeps, VsmNode};

#[derive(Debug, Parser)]
#[command(name = "cybd", version, about = "Cybernetic control plane daemon")]
struct Args {
    /// TOML configuration file; environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force development mode (permissive secrets, default tenant).
    #[arg(long)]
    dev: bool,

    /// Log level filter.
    #[arg(long, default_value = "info", env = "CYB_LOG")]
    log: String,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Config::from_toml(&text).context("parsing configuration")?
        },
        None => Config::default(),
    };

    // Environment wins over the file.
    let from_env = cyb_config::from_env();
    if from_env.security.hmac_secret.is_some() {
        config.security.hmac_secret = from_env.security.hmac_secret;
    }
    if from_env.security.secret_key_base.is_some() {
        config.security.secret_key_base = from_env.security.secret_key_base;
    }
    if from_env.security.bloom_file.is_some() {
        config.security.bloom_file = from_env.security.bloom_file;
    }
    if from_env.gateway.telegram_webhook_secret.is_some() {
        config.gateway.telegram_webhook_secret = from_env.gateway.telegram_webhook_secret;
    }
    if from_env.gateway.system_api_key.is_some() {
        config.gateway.system_api_key = from_env.gateway.system_api_key;
    }
    if from_env.gateway.metrics_port.is_some() {
        config.gateway.metrics_port = from_env.gateway.metrics_port;
    }
    if from_env.bus.url.is_some() {
        config.bus.url = from_env.bus.url;
        config.bus.exchange = from_env.bus.exchange;
    }
    if from_env.otel_endpoint.is_some() {
        config.otel_endpoint = from_env.otel_endpoint;
    }
    if std::env::var("CYB_ENV").is_ok() {
        config.environment = from_env.environment;
    }
    if std::env::var("CYB_SITE").is_ok() {
        config.site = from_env.site;
    }
    if std::env::var("CYB_BIND").is_ok() {
        config.gateway.bind = from_env.gateway.bind;
    }

    if args.dev {
        config.environment = Environment::Development;
    }
    if config.site.is_empty() {
        config.site = "cybernetic-node".to_string();
    }
    Ok(config)
}

/// The signing secret: configured in production, generated in development.
fn signing_secret(config: &Config) -> Vec<u8> {
    if let Some(secret) = config.security.hmac_secret.as_ref() {
        return secret.expose().as_bytes().to_vec();
    }
    warn!("no CYBERNETIC_HMAC_SECRET configured, generating an ephemeral dev secret");
    let mut bytes = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Fail-closed: production refuses to boot on missing or weak secrets.
    cyb_config::validate(&config).context("configuration rejected")?;

    setup_logging(&LogConfig::new(args.log.clone()))
        .map_err(|e| anyhow::anyhow!("logging setup: {e}"))?;
    info!(
        site = %config.site,
        environment = ?config.environment,
        "cybernetic daemon starting"
    );
    if let Some(url) = &config.bus.url {
        info!(url, exchange = %config.bus.exchange, "external broker configured");
    }
    if let Some(endpoint) = &config.otel_endpoint {
        info!(endpoint, "otel export endpoint configured");
    }

    let cancel = CancellationToken::new();

    // Bus and topology.
    let (broker, _broker_task) = Broker::spawn(BrokerConfig::default());
    Topology::standard(
        Duration::from_secs(config.bus.queue_ttl_secs),
        Duration::from_secs(config.bus.retry_ttl_secs),
    )
    .declare_all(&broker)
    .await
    .map_err(|e| anyhow::anyhow!("topology: {e}"))?;

    // Security envelope and replay ledger.
    let site = SiteId::new(config.site.clone());
    let codec = Arc::new(EnvelopeCodec::new(
        site.clone(),
        KeyRing::new(
            config.security.key_id.clone(),
            SecretKey::new(signing_secret(&config)),
        ),
        SkewPolicy {
            max_skew: Duration::from_secs(config.security.max_skew_secs),
            replay_window: Duration::from_secs(config.security.replay_window_secs),
        },
    ));
    let replay_config = ReplayConfig {
        capacity: config.security.bloom_capacity,
        fp_rate: config.security.bloom_fp_rate,
        window: Duration::from_secs(config.security.replay_window_secs),
        compaction_interval: Duration::from_secs(config.security.compaction_secs),
    };
    let ledger = match config.security.bloom_file.as_ref() {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "loading replay bloom");
            Arc::new(ReplayLedger::load_bloom(path, replay_config)?)
        },
        _ => Arc::new(ReplayLedger::new(replay_config)),
    };
    let _compactor = ledger.spawn_compactor(cancel.child_token());

    // Control primitives and shared telemetry.
    let counters = Arc::new(Counters::new());
    let limiter = Arc::new(RateLimiter::new(TokenBucketConfig {
        capacity: config.limiter.capacity,
        refill_rate: config.limiter.refill_rate,
    }));
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        base_threshold: config.breaker.base_threshold,
        success_threshold: config.breaker.success_threshold,
        call_timeout: Duration::from_millis(config.breaker.call_timeout_ms),
        recovery_initial: Duration::from_millis(config.breaker.recovery_initial_ms),
        recovery_max: Duration::from_millis(config.breaker.recovery_max_ms),
        ema_alpha: 0.3,
    }));
    let coordinator = Arc::new(FairShareCoordinator::new(
        CoordinatorConfig {
            max_slots: config.coordinator.max_slots,
            aging_ms: config.coordinator.aging_ms,
            aging_boost: config.coordinator.aging_boost,
            aging_cap: config.coordinator.aging_cap,
        },
        Arc::clone(&counters),
    ));
    let policies = Arc::new(PolicyRegistry::new(Evaluator {
        max_depth: config.policy.max_depth,
        timeout: Duration::from_millis(config.policy.timeout_ms),
    }));

    // Publisher shared by the VSM node and the gateway.
    let publisher = Publisher::new(
        broker.clone(),
        Arc::clone(&codec),
        config.site.clone(),
        PublisherConfig {
            confirm_timeout: Duration::from_millis(config.bus.confirm_timeout_ms),
            max_attempts: 3,
        },
    );

    // VSM consumers.
    let deps = VsmDeps {
        publisher: publisher.clone(),
        limiter: Arc::clone(&limiter),
        breakers: Arc::clone(&breakers),
        coordinator,
        policies,
        provider: Arc::new(EchoProvider),
        counters: Arc::clone(&counters),
    };
    let _node = VsmNode::spawn(
        broker.clone(),
        Arc::clone(&codec),
        Arc::clone(&ledger),
        &deps,
        config.bus.prefetch,
        config.bus.retry_cap,
        cancel.child_token(),
    );

    // Context graph (single-node mesh; peers join through the network).
    let network = GraphNetwork::new(cancel.child_token());
    let graph = ContextGraph::spawn(
        site,
        SyncConfig {
            ship_interval: Duration::from_millis(config.context.ship_interval_ms),
            debounce: Duration::from_millis(config.context.debounce_ms),
        },
        cancel.child_token(),
    );
    network.register(&graph);

    // Edge gateway.
    let dev_mode = !config.environment.is_production();
    let default_tenant = cyb_core::TenantId::parse(&config.gateway.dev_default_tenant)
        .map_err(|e| anyhow::anyhow!("default tenant: {e}"))?;
    let mut verifier = StaticKeyVerifier::new();
    if let Some(key) = config.gateway.system_api_key.as_ref() {
        let system_tenant = cyb_core::TenantId::parse("system")
            .map_err(|e| anyhow::anyhow!("system tenant: {e}"))?;
        verifier = verifier.with_credential(key.expose(), system_tenant);
    }
    let state = Arc::new(AppState {
        auth: Authenticator::new(
            AuthConfig {
                dev_mode,
                default_tenant,
            },
            Arc::new(verifier),
        ),
        limiter,
        breakers,
        publisher,
        sse: Arc::new(SseBroker::new(SseConfig {
            heartbeat: Duration::from_secs(config.gateway.heartbeat_secs),
            history: 256,
        })),
        counters,
        environment: config.environment,
        heartbeat: Duration::from_secs(config.gateway.heartbeat_secs),
        telegram_secret: config
            .gateway
            .telegram_webhook_secret
            .as_ref()
            .map(|s| s.expose().to_string()),
    });

    let gateway_cancel = cancel.child_token();
    let bind = config.gateway.bind.clone();
    let serve = tokio::spawn(async move { Gateway::serve(&bind, state, gateway_cancel).await });

    // Run until interrupted.
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown requested");
    cancel.cancel();

    if let Some(path) = config.security.bloom_file.as_ref() {
        if let Err(e) = ledger.save_bloom(path) {
            warn!(path = %path.display(), error = %e, "bloom save failed");
        }
    }

    match serve.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => warn!(error = %e, "gateway exited with error"),
        Err(e) => warn!(error = %e, "gateway task panicked"),
    }
    info!("cybernetic daemon stopped");
    Ok(())
}
