//! Router construction and the serving loop.

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use cyb_bus::Publisher;
use cyb_config::Environment;
use cyb_control::{BreakerRegistry, RateLimiter};
use cyb_telemetry::Counters;

use crate::auth::Authenticator;
use crate::routes;
use crate::sse::SseBroker;

/// Request body cap for the edge.
const BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Everything the route handlers share.
pub struct AppState {
    /// Authentication stage.
    pub auth: Authenticator,
    /// Per-tenant token buckets.
    pub limiter: Arc<RateLimiter>,
    /// Named breakers (the edge uses `edge`).
    pub breakers: Arc<BreakerRegistry>,
    /// Signing publisher into the substrate.
    pub publisher: Publisher,
    /// SSE fan-out.
    pub sse: Arc<SseBroker>,
    /// Boundary counters.
    pub counters: Arc<Counters>,
    /// Deployment environment.
    pub environment: Environment,
    /// SSE heartbeat interval.
    pub heartbeat: Duration,
    /// Telegram webhook shared secret.
    pub telegram_secret: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

/// Build the edge router over the shared state.
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/generate", post(routes::generate))
        .route("/v1/events", get(routes::events))
        .route("/telegram/webhook", post(routes::telegram_webhook))
        .route("/metrics", get(routes::metrics))
        .route("/health", get(routes::health))
        .route("/", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .with_state(state)
}

/// The serving loop.
#[derive(Debug)]
pub struct Gateway;

impl Gateway {
    /// Bind and serve until the token cancels.
    ///
    /// # Errors
    ///
    /// Returns the bind or serve I/O error.
    pub async fn serve(
        bind: &str,
        state: Arc<AppState>,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(bind).await?;
        info!(bind, "gateway listening");
        let router = build_router(state);
        axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, StaticKeyVerifier};
    use crate::sse::SseConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use cyb_bus::{Broker, BrokerConfig, PublisherConfig, Topology};
    use cyb_control::{BreakerConfig, TokenBucketConfig};
    use cyb_core::{SiteId, TenantId};
    use cyb_crypto::{EnvelopeCodec, KeyRing, SecretKey, SkewPolicy};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn state(capacity: u32) -> Arc<AppState> {
        let (broker, _join) = Broker::spawn(BrokerConfig::default());
        Topology::default().declare_all(&broker).await.unwrap();
        let codec = Arc::new(EnvelopeCodec::new(
            SiteId::new("edge-test"),
            KeyRing::new("k1", SecretKey::new(b"edge-test-secret-material".to_vec())),
            SkewPolicy::default(),
        ));
        let publisher = Publisher::new(broker, codec, "edge-test", PublisherConfig::default());

        let verifier = StaticKeyVerifier::new()
            .with_credential("token-x", TenantId::parse("tenant-x").unwrap());
        Arc::new(AppState {
            auth: Authenticator::new(
                AuthConfig {
                    dev_mode: false,
                    default_tenant: TenantId::parse("dev").unwrap(),
                },
                Arc::new(verifier),
            ),
            limiter: Arc::new(RateLimiter::new(TokenBucketConfig {
                capacity,
                refill_rate: 0.0,
            })),
            breakers: Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            publisher,
            sse: Arc::new(SseBroker::new(SseConfig::default())),
            counters: Arc::new(Counters::new()),
            environment: Environment::Production,
            heartbeat: Duration::from_secs(30),
            telegram_secret: Some("tg-secret".to_string()),
        })
    }

    fn generate_request(auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/generate")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = auth {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
            .body(Body::from(r#"{"prompt": "analyse this"}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = build_router(state(100).await);
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["status"], "ok");
        assert_eq!(doc["service"], "cybernetic");
    }

    #[tokio::test]
    async fn test_generate_requires_auth() {
        let router = build_router(state(100).await);
        let response = router.oneshot(generate_request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_generate_accepted() {
        let router = build_router(state(100).await);
        let response = router
            .oneshot(generate_request(Some("token-x")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["status"], "accepted");
        assert!(doc["episode_id"].is_string());
    }

    #[tokio::test]
    async fn test_tenant_header_mismatch_forbidden() {
        let router = build_router(state(100).await);
        let request = Request::builder()
            .method("POST")
            .uri("/v1/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer token-x")
            .header("x-tenant-id", "other-tenant")
            .body(Body::from(r#"{"prompt": "hi"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_rate_limit_429_with_retry_after() {
        let shared = state(2).await;
        // Normal priority costs 2: the first request empties the bucket.
        let first = build_router(Arc::clone(&shared))
            .oneshot(generate_request(Some("token-x")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = build_router(shared)
            .oneshot(generate_request(Some("token-x")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_breaker_open_is_503() {
        let shared = state(100).await;
        shared
            .breakers
            .get_or_create("edge")
            .force_open(Duration::from_secs(60));
        let response = build_router(shared)
            .oneshot(generate_request(Some("token-x")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let router = build_router(state(100).await);
        let request = Request::builder()
            .method("POST")
            .uri("/v1/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer token-x")
            .body(Body::from("{not json"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_events_requires_topics() {
        let router = build_router(state(100).await);
        let request = Request::get("/v1/events")
            .header(header::AUTHORIZATION, "Bearer token-x")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_events_stream_starts_with_connected() {
        let router = build_router(state(100).await);
        let request = Request::get("/v1/events?topics=episode.*")
            .header(header::AUTHORIZATION, "Bearer token-x")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        let mut body = response.into_body().into_data_stream();
        let first = futures::StreamExt::next(&mut body).await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&first).to_string();
        assert!(text.contains("event: connected"));
        assert!(text.contains("tenant-x"));
    }

    #[tokio::test]
    async fn test_webhook_secret_enforced_in_production() {
        let shared = state(100).await;
        let rejected = build_router(Arc::clone(&shared))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/telegram/webhook")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::FORBIDDEN);

        let accepted = build_router(shared)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/telegram/webhook")
                    .header("x-telegram-bot-api-secret-token", "tg-secret")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let shared = state(100).await;
        shared.counters.incr("generate_accepted");
        let response = build_router(shared)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("generate_accepted 1"));
    }
}
