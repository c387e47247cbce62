//! Cyb Gateway - The edge of the Cybernetic control plane.
//!
//! This crate provides:
//! - The ordered admission pipeline: request-id, authentication, tenant
//!   isolation, token-bucket rate limit, circuit breaker, handler
//! - A JWKS/discovery cache with an SSRF guard for external identity
//! - SSE fan-out with per-tenant topics, pattern subscriptions, heartbeat
//!   comments, and resume from `Last-Event-ID`
//! - The HTTP surface: `/v1/generate`, `/v1/events`, `/telegram/webhook`,
//!   `/metrics`, `/health`, `/`
//!
//! Every rejection maps to a structured `{error, message}` body and the
//! status codes of the error taxonomy.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod auth;
mod error;
mod jwks;
mod pipeline;
mod routes;
mod server;
mod sse;

pub use auth::{AuthConfig, Authenticator, IdentityVerifier, StaticKeyVerifier};
pub use error::AdmissionError;
pub use jwks::{JwksCache, JwksError};
pub use pipeline::AdmissionContext;
pub use routes::GenerateRequest;
pub use server::{AppState, Gateway, build_router};
pub use sse::{SseBroker, SseConfig, SseEvent, parse_topic_patterns, pattern_matches, tenant_topic};
