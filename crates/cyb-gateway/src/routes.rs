//! The HTTP surface.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use cyb_bus::{PublishOptions, exchanges};
use cyb_control::CallError;
use cyb_core::{Episode, EpisodeKind, Priority, VsmSystem};

use crate::error::AdmissionError;
use crate::pipeline::admit;
use crate::server::AppState;
use crate::sse::{parse_topic_patterns, spawn_subscription};

/// Body of `POST /v1/generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    /// The prompt to analyse.
    pub prompt: String,
    /// Optional model hint passed through to the provider.
    #[serde(default)]
    pub model: Option<String>,
    /// Optional sampling temperature.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Optional completion budget.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Whether the caller will stream the result over `/v1/events`.
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct GenerateAccepted {
    status: &'static str,
    episode_id: uuid::Uuid,
    request_id: String,
}

/// `POST /v1/generate`: admit, then forward an analysis episode into the
/// substrate under the edge breaker.
pub(crate) async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AdmissionError> {
    let ctx = admit(&state, &headers, Priority::Normal).await?;
    let Json(request) = body.map_err(|e| AdmissionError::BadRequest(e.to_string()))?;
    if request.prompt.trim().is_empty() {
        return Err(AdmissionError::BadRequest("prompt is required".to_string()));
    }

    let title: String = request.prompt.chars().take(64).collect();
    let episode = Episode::new(EpisodeKind::Analysis, title, VsmSystem::S1)
        .with_priority(Priority::High)
        .with_context(serde_json::json!({"request_id": ctx.request_id}))
        .with_data(serde_json::json!({
            "prompt": request.prompt,
            "model": request.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": request.stream.unwrap_or(false),
        }))
        .with_metadata("tenant", ctx.tenant.as_str());
    let episode_id = episode.id;

    let breaker = state.breakers.get_or_create("edge");
    let publish = state.publisher.publish_json(
        exchanges::EVENTS,
        "vsm.s1.operation",
        "vsm.s1.operation",
        &episode,
        PublishOptions::default(),
    );
    let outcome = breaker.call(move || publish).await;

    match outcome {
        Ok(_) => {
            state.counters.incr("generate_accepted");
            state.sse.publish_for_tenant(
                &ctx.tenant,
                "episode.created",
                &serde_json::json!({"episode_id": episode_id}),
            );
            Ok(Json(GenerateAccepted {
                status: "accepted",
                episode_id,
                request_id: ctx.request_id,
            }))
        },
        Err(CallError::Open) => {
            state.counters.incr("generate_circuit_open");
            Err(AdmissionError::CircuitOpen)
        },
        Err(CallError::Timeout) => Err(AdmissionError::Unavailable("bus timeout".to_string())),
        Err(CallError::Inner(e)) => Err(AdmissionError::Unavailable(e.to_string())),
    }
}

/// Query of `GET /v1/events`.
#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    topics: Option<String>,
    last_event_id: Option<String>,
}

/// `GET /v1/events`: admit, validate patterns, stream.
pub(crate) async fn events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, AdmissionError> {
    let ctx = admit(&state, &headers, Priority::Normal).await?;

    if state.breakers.get_or_create("edge").state() == cyb_control::CircuitState::Open {
        return Err(AdmissionError::CircuitOpen);
    }

    let raw = query
        .topics
        .ok_or_else(|| AdmissionError::BadRequest("topics query is required".to_string()))?;
    let patterns = parse_topic_patterns(&raw)?;
    let last_event_id = query.last_event_id.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    info!(tenant = %ctx.tenant, topics = %raw, "sse subscription opened");
    let stream = spawn_subscription(
        &state.sse,
        Arc::clone(&state.counters),
        &ctx.tenant,
        patterns,
        last_event_id,
        state.heartbeat,
    );
    Ok(Sse::new(stream))
}

/// `POST /telegram/webhook`: opaque body forwarded into S1; in production
/// the shared secret header must match.
pub(crate) async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, AdmissionError> {
    if state.environment.is_production() {
        let expected = state.telegram_secret.as_deref().ok_or_else(|| {
            AdmissionError::Unavailable("webhook secret not configured".to_string())
        })?;
        let provided = headers
            .get("x-telegram-bot-api-secret-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != expected {
            state.counters.incr("webhook_rejected");
            return Err(AdmissionError::Forbidden("webhook token mismatch".to_string()));
        }
    }

    let episode = Episode::new(EpisodeKind::Operation, "telegram update", VsmSystem::S1)
        .with_data(serde_json::json!({
            "webhook": String::from_utf8_lossy(&body),
        }));
    state
        .publisher
        .publish_json(
            exchanges::EVENTS,
            "vsm.s1.operation",
            "vsm.s1.operation",
            &episode,
            PublishOptions::default(),
        )
        .await
        .map_err(|e| AdmissionError::Unavailable(e.to_string()))?;
    state.counters.incr("webhook_accepted");
    Ok(Json(serde_json::json!({"ok": true})))
}

/// `GET /metrics`: counter and breaker text exposition.
pub(crate) async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = state.counters.render_text();
    body.push_str("# TYPE cyb_breaker_health gauge\n");
    for snapshot in state.breakers.snapshots() {
        body.push_str(&format!(
            "cyb_breaker_health{{name=\"{}\"}} {:.2}\n",
            snapshot.name, snapshot.health_score
        ));
    }
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// `GET /health` and `GET /`.
pub(crate) async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "cybernetic",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
