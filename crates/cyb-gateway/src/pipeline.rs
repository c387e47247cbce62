//! The ordered admission chain.
//!
//! Every protected route runs the same stages in the same order:
//!
//! 1. Assign (or adopt) a request id
//! 2. Authenticate to a tenant
//! 3. Enforce tenant isolation against an explicit `x-tenant-id`
//! 4. Charge the tenant's token bucket
//!
//! The circuit breaker is the fifth stage; it wraps the handler's work at
//! the call site so an open circuit rejects before any work happens.

use axum::http::HeaderMap;

use cyb_core::{Priority, TenantId};

use crate::error::AdmissionError;
use crate::server::AppState;

/// What admission attaches to an accepted request.
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    /// Request id, echoed in responses and logs.
    pub request_id: String,
    /// The authenticated tenant; canonical for the whole request.
    pub tenant: TenantId,
}

pub(crate) async fn admit(
    state: &AppState,
    headers: &HeaderMap,
    priority: Priority,
) -> Result<AdmissionContext, AdmissionError> {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

    let tenant = match state.auth.authenticate(headers).await {
        Ok(tenant) => tenant,
        Err(e) => {
            state.counters.incr("admission_unauthorized");
            return Err(e);
        },
    };

    // The authenticated tenant is canonical; an explicit header must agree.
    if let Some(value) = headers.get("x-tenant-id") {
        let claimed = value
            .to_str()
            .ok()
            .and_then(|s| TenantId::parse(s).ok())
            .ok_or_else(|| AdmissionError::Forbidden("malformed tenant header".to_string()))?;
        if claimed != tenant {
            state.counters.incr("admission_forbidden");
            return Err(AdmissionError::Forbidden(format!(
                "tenant header {claimed} does not match credentials"
            )));
        }
    }

    let decision = state
        .limiter
        .consume("api_gateway", tenant.as_str(), priority);
    if let Some(retry_after) = decision.retry_after() {
        state.counters.incr("admission_rate_limited");
        return Err(AdmissionError::RateLimited { retry_after });
    }

    state.counters.incr("admission_ok");
    Ok(AdmissionContext { request_id, tenant })
}
