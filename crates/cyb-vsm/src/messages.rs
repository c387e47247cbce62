//! Documents exchanged between the VSM systems.

use serde::{Deserialize, Serialize};

use cyb_core::{Priority, VsmSystem};

/// S2 coordination request: adjust scheduling and/or broadcast a directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRequest {
    /// Scheduling topic the request concerns.
    pub topic: String,
    /// New priority weight for the topic, if any.
    #[serde(default)]
    pub priority: Option<f64>,
    /// Directive broadcast to the target systems, if any.
    #[serde(default)]
    pub directive: Option<String>,
    /// Systems the directive goes to.
    #[serde(default)]
    pub targets: Vec<VsmSystem>,
}

/// Periodic health input consumed by S3.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall system health in `[0, 1]`.
    pub system_health: f64,
    /// Observed error rate in `[0, 1]`.
    pub error_rate: f64,
}

/// Rate-limiter command consumed by S3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitCommand {
    /// Bucket scope, e.g. `api_gateway` or `s4_llm`.
    pub scope: String,
    /// Bucket key within the scope.
    pub key: String,
    /// `consume` or `reset`.
    pub action: String,
    /// Priority class for weighted consumption.
    #[serde(default)]
    pub priority: Priority,
}

/// Policy evaluation request consumed by S5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheckRequest {
    /// Policies to evaluate, in order.
    pub policy_ids: Vec<String>,
    /// Context document.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Roles held by the caller.
    #[serde(default)]
    pub roles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordination_request_defaults() {
        let request: CoordinationRequest =
            serde_json::from_str(r#"{"topic": "analysis"}"#).unwrap();
        assert_eq!(request.topic, "analysis");
        assert!(request.priority.is_none());
        assert!(request.targets.is_empty());
    }

    #[test]
    fn test_health_report_round_trip() {
        let report = HealthReport {
            system_health: 0.9,
            error_rate: 0.05,
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: HealthReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
