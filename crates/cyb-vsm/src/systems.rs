//! The five subsystem handlers.
//!
//! Each handler owns the components its layer is responsible for and
//! dispatches on the envelope `type`. Forwarding between layers always
//! publishes back onto the bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use cyb_bus::{HandlerError, MessageHandler, PublishOptions, Publisher, exchanges};
use cyb_control::{BreakerRegistry, CallError, FairShareCoordinator, RateLimiter};
use cyb_core::{Envelope, Episode, EpisodeKind, VsmSystem};
use cyb_policy::{EvalContext, PolicyRegistry};
use cyb_telemetry::Counters;

use crate::messages::{CoordinationRequest, HealthReport, PolicyCheckRequest, RateLimitCommand};
use crate::provider::AnalysisProvider;
use crate::router::message_types;

fn decode<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, HandlerError> {
    serde_json::from_slice(&envelope.payload)
        .map_err(|e| HandlerError::Failed(anyhow::anyhow!("payload decode: {e}")))
}

fn kind_label(kind: EpisodeKind) -> &'static str {
    match kind {
        EpisodeKind::Operation => "operation",
        EpisodeKind::Coordination => "coordination",
        EpisodeKind::Control => "control",
        EpisodeKind::Analysis => "analysis",
        EpisodeKind::Policy => "policy",
        EpisodeKind::Alert => "alert",
    }
}

fn forward_opts(envelope: &Envelope) -> PublishOptions {
    PublishOptions {
        correlation_id: Some(envelope.headers.correlation_id),
        causal_vector: envelope.headers.causal_vector.clone(),
    }
}

// ---------------------------------------------------------------------------
// S1 - operations
// ---------------------------------------------------------------------------

/// S1 consumes operation episodes, counts them, and forwards significant
/// ones to S2 for coordination. Analysis results flowing back from S4 are
/// absorbed here as operation telemetry.
pub struct S1Handler {
    publisher: Publisher,
    counters: Arc<Counters>,
}

impl S1Handler {
    /// Create the operations handler.
    #[must_use]
    pub fn new(publisher: Publisher, counters: Arc<Counters>) -> Self {
        Self {
            publisher,
            counters,
        }
    }

    fn is_significant(episode: &Episode) -> bool {
        episode.priority <= cyb_core::Priority::High
            || episode
                .data
                .get("significant")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
    }
}

#[async_trait]
impl MessageHandler for S1Handler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        if envelope.message_type == message_types::S4_RESULT {
            self.counters.incr("s1_analysis_results");
            return Ok(());
        }

        let episode: Episode = decode(envelope)?;
        self.counters.incr("s1_operations");
        self.counters
            .incr(&format!("s1_op_{}", kind_label(episode.kind)));
        debug!(episode = %episode.id, kind = kind_label(episode.kind), "s1 operation");

        if Self::is_significant(&episode) {
            self.publisher
                .publish_json(
                    VsmSystem::S2.exchange(),
                    "s2.coordinate.episode",
                    message_types::S2_COORDINATE,
                    &episode,
                    forward_opts(envelope),
                )
                .await
                .map_err(|e| HandlerError::Failed(anyhow::anyhow!("forward to s2: {e}")))?;
            self.counters.incr("s1_forwarded");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// S2 - coordination
// ---------------------------------------------------------------------------

/// S2 owns the fair-share coordinator. Episodes get a slot before moving
/// on (backpressure rides the retry ladder); explicit coordination requests
/// adjust priorities and broadcast directives to target systems.
pub struct S2Handler {
    publisher: Publisher,
    coordinator: Arc<FairShareCoordinator>,
    counters: Arc<Counters>,
}

impl S2Handler {
    /// Create the coordination handler.
    #[must_use]
    pub fn new(
        publisher: Publisher,
        coordinator: Arc<FairShareCoordinator>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            publisher,
            coordinator,
            counters,
        }
    }

    async fn coordinate(
        &self,
        request: CoordinationRequest,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        if let Some(weight) = request.priority {
            self.coordinator.set_priority(&request.topic, weight);
            info!(topic = %request.topic, weight, "scheduling priority updated");
        }
        if let Some(directive) = request.directive {
            for target in &request.targets {
                let routing_key = format!("{}.directive", target.routing_prefix());
                self.publisher
                    .publish_json(
                        target.exchange(),
                        &routing_key,
                        message_types::DIRECTIVE,
                        &serde_json::json!({
                            "topic": request.topic,
                            "directive": directive,
                        }),
                        forward_opts(envelope),
                    )
                    .await
                    .map_err(|e| HandlerError::Failed(anyhow::anyhow!("broadcast: {e}")))?;
            }
            self.counters.incr("s2_broadcasts");
        }
        Ok(())
    }

    async fn schedule(&self, episode: Episode, envelope: &Envelope) -> Result<(), HandlerError> {
        let topic = format!("episode.{}", kind_label(episode.kind));
        if self.coordinator.reserve_slot(&topic).is_err() {
            // Backpressure: the retry queue provides the pacing.
            return Err(HandlerError::Failed(anyhow::anyhow!(
                "backpressure on {topic}"
            )));
        }

        let result = if episode.kind == EpisodeKind::Analysis {
            self.publisher
                .publish_json(
                    VsmSystem::S4.exchange(),
                    "s4.intelligence.analyze",
                    message_types::S4_ANALYZE,
                    &episode,
                    forward_opts(envelope),
                )
                .await
                .map(|_| ())
                .map_err(|e| HandlerError::Failed(anyhow::anyhow!("forward to s4: {e}")))
        } else {
            self.counters.incr("s2_coordinated");
            Ok(())
        };
        self.coordinator.release_slot(&topic);
        result
    }
}

#[async_trait]
impl MessageHandler for S2Handler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        // A coordination request names a topic; otherwise this is an
        // episode forwarded from S1.
        if let Ok(request) = serde_json::from_slice::<CoordinationRequest>(&envelope.payload) {
            return self.coordinate(request, envelope).await;
        }
        let episode: Episode = decode(envelope)?;
        self.schedule(episode, envelope).await
    }
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

/// Absorbs coordination directives broadcast by S2. Systems that need to
/// react to a directive register a richer handler; the default records it.
pub struct DirectiveHandler {
    counters: Arc<Counters>,
}

impl DirectiveHandler {
    /// Create the directive sink.
    #[must_use]
    pub fn new(counters: Arc<Counters>) -> Self {
        Self { counters }
    }
}

#[async_trait]
impl MessageHandler for DirectiveHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let doc: serde_json::Value = decode(envelope)?;
        self.counters.incr("directives_received");
        info!(
            routing_key = %envelope.routing_key,
            directive = %doc.get("directive").and_then(serde_json::Value::as_str).unwrap_or("?"),
            "coordination directive received"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// S3 - control
// ---------------------------------------------------------------------------

/// S3 owns the rate limiter and the breaker registry; health events tune
/// every breaker's adaptive threshold.
pub struct S3Handler {
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    counters: Arc<Counters>,
}

impl S3Handler {
    /// Create the control handler.
    #[must_use]
    pub fn new(
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            limiter,
            breakers,
            counters,
        }
    }
}

#[async_trait]
impl MessageHandler for S3Handler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.message_type.as_str() {
            message_types::S3_HEALTH => {
                let report: HealthReport = decode(envelope)?;
                self.breakers
                    .update_health_all(report.system_health, report.error_rate);
                self.counters.incr("s3_health_updates");
                Ok(())
            },
            message_types::S3_RATELIMIT => {
                let command: RateLimitCommand = decode(envelope)?;
                match command.action.as_str() {
                    "consume" => {
                        let decision =
                            self.limiter
                                .consume(&command.scope, &command.key, command.priority);
                        if decision.is_allowed() {
                            self.counters.incr("s3_limit_allowed");
                        } else {
                            self.counters.incr("s3_limit_denied");
                        }
                        Ok(())
                    },
                    "reset" => {
                        self.limiter.reset(&command.scope, &command.key);
                        Ok(())
                    },
                    other => Err(HandlerError::Failed(anyhow::anyhow!(
                        "unknown ratelimit action: {other}"
                    ))),
                }
            },
            other => Err(HandlerError::UnknownType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// S4 - intelligence
// ---------------------------------------------------------------------------

/// S4 analyses episodes through the pluggable provider; the `s4_llm`
/// budget is charged before the call and the provider sits behind its own
/// circuit breaker.
pub struct S4Handler {
    publisher: Publisher,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    provider: Arc<dyn AnalysisProvider>,
    counters: Arc<Counters>,
}

/// Published when an analysis completes.
#[derive(Debug, Serialize, Deserialize)]
struct AnalysisResult {
    episode_id: uuid::Uuid,
    provider: String,
    summary: String,
    data: serde_json::Value,
}

impl S4Handler {
    /// Create the intelligence handler.
    #[must_use]
    pub fn new(
        publisher: Publisher,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        provider: Arc<dyn AnalysisProvider>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            publisher,
            limiter,
            breakers,
            provider,
            counters,
        }
    }
}

#[async_trait]
impl MessageHandler for S4Handler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let episode: Episode = decode(envelope)?;
        let budget_key = episode
            .metadata
            .get("tenant")
            .map_or("global", String::as_str);

        let decision = self.limiter.consume("s4_llm", budget_key, episode.priority);
        if !decision.is_allowed() {
            self.counters.incr("s4_budget_limited");
            return Err(HandlerError::Failed(anyhow::anyhow!(
                "s4_llm budget exhausted for {budget_key}"
            )));
        }

        let breaker = self.breakers.get_or_create("s4_provider");
        let analysis = self.provider.analyze(&episode);
        let outcome = breaker.call(move || analysis).await;

        match outcome {
            Ok(outcome) => {
                self.counters.incr("s4_analyzed");
                let result = AnalysisResult {
                    episode_id: episode.id,
                    provider: self.provider.name().to_string(),
                    summary: outcome.summary,
                    data: outcome.data,
                };
                self.publisher
                    .publish_json(
                        exchanges::EVENTS,
                        "vsm.s1.analysis",
                        message_types::S4_RESULT,
                        &result,
                        forward_opts(envelope),
                    )
                    .await
                    .map_err(|e| HandlerError::Failed(anyhow::anyhow!("publish result: {e}")))?;
                Ok(())
            },
            Err(CallError::Open) => {
                self.counters.incr("s4_circuit_open");
                Err(HandlerError::Failed(anyhow::anyhow!("provider circuit open")))
            },
            Err(CallError::Timeout) => {
                self.counters.incr("s4_provider_timeout");
                Err(HandlerError::Failed(anyhow::anyhow!("provider timed out")))
            },
            Err(CallError::Inner(e)) => {
                self.counters.incr(&format!("s4_{}", e.kind()));
                warn!(provider = self.provider.name(), error = %e, "analysis failed");
                Err(HandlerError::Failed(anyhow::anyhow!(e)))
            },
        }
    }
}

// ---------------------------------------------------------------------------
// S5 - policy
// ---------------------------------------------------------------------------

/// Registration document consumed by S5.
#[derive(Debug, Serialize, Deserialize)]
struct RegisterPolicy {
    id: String,
    source: String,
}

/// S5 owns the policy registry; registrations and evaluations arrive over
/// the bus, decisions are published for streaming consumers.
pub struct S5Handler {
    publisher: Publisher,
    policies: Arc<PolicyRegistry>,
    counters: Arc<Counters>,
}

impl S5Handler {
    /// Create the policy handler.
    #[must_use]
    pub fn new(
        publisher: Publisher,
        policies: Arc<PolicyRegistry>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            publisher,
            policies,
            counters,
        }
    }
}

#[async_trait]
impl MessageHandler for S5Handler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.message_type.as_str() {
            message_types::S5_REGISTER => {
                let request: RegisterPolicy = decode(envelope)?;
                let version = self
                    .policies
                    .register(&request.id, &request.source)
                    .map_err(|e| HandlerError::Failed(anyhow::anyhow!("register: {e}")))?;
                self.counters.incr("s5_registered");
                info!(policy = %request.id, version, "policy registered via bus");
                Ok(())
            },
            message_types::S5_EVALUATE => {
                let request: PolicyCheckRequest = decode(envelope)?;
                let mut ctx = EvalContext::new().with_context(request.context);
                for role in request.roles {
                    ctx = ctx.with_role(role);
                }
                let ids: Vec<&str> = request.policy_ids.iter().map(String::as_str).collect();
                let decision = self
                    .policies
                    .evaluate_all(&ids, &ctx)
                    .map_err(|e| HandlerError::Failed(anyhow::anyhow!("evaluate: {e}")))?;
                self.counters.incr("s5_evaluations");
                self.publisher
                    .publish_json(
                        exchanges::EVENTS,
                        "policy.decision",
                        message_types::S5_DECISION,
                        &serde_json::json!({
                            "policy_ids": ids,
                            "decision": format!("{decision:?}").to_lowercase(),
                        }),
                        forward_opts(envelope),
                    )
                    .await
                    .map_err(|e| HandlerError::Failed(anyhow::anyhow!("publish decision: {e}")))?;
                Ok(())
            },
            other => Err(HandlerError::UnknownType(other.to_string())),
        }
    }
}
