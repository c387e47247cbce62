//! Dispatch table construction and the per-system consumer node.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cyb_bus::{BrokerHandle, Consumer, ConsumerConfig, DispatchTable, Publisher};
use cyb_control::{BreakerRegistry, FairShareCoordinator, RateLimiter};
use cyb_core::VsmSystem;
use cyb_crypto::{EnvelopeCodec, ReplayLedger};
use cyb_policy::PolicyRegistry;
use cyb_telemetry::Counters;

use crate::provider::AnalysisProvider;
use crate::systems::{DirectiveHandler, S1Handler, S2Handler, S3Handler, S4Handler, S5Handler};

/// Wire discriminators dispatched by the router.
pub mod message_types {
    /// Operation episode into S1.
    pub const S1_OPERATION: &str = "vsm.s1.operation";
    /// Coordination request or forwarded episode into S2.
    pub const S2_COORDINATE: &str = "vsm.s2.coordinate";
    /// Health report into S3.
    pub const S3_HEALTH: &str = "vsm.s3.health";
    /// Rate-limiter command into S3.
    pub const S3_RATELIMIT: &str = "vsm.s3.ratelimit";
    /// Analysis request into S4.
    pub const S4_ANALYZE: &str = "vsm.s4.analyze";
    /// Analysis result flowing back to S1.
    pub const S4_RESULT: &str = "vsm.s4.result";
    /// Policy registration into S5.
    pub const S5_REGISTER: &str = "vsm.s5.register";
    /// Policy evaluation into S5.
    pub const S5_EVALUATE: &str = "vsm.s5.evaluate";
    /// Published policy decision.
    pub const S5_DECISION: &str = "vsm.s5.decision";
    /// Coordination directive broadcast by S2.
    pub const DIRECTIVE: &str = "vsm.directive";
}

/// Everything the subsystem handlers share.
#[derive(Clone)]
pub struct VsmDeps {
    /// Signing publisher for cross-system forwards.
    pub publisher: Publisher,
    /// S3's token-bucket limiter.
    pub limiter: Arc<RateLimiter>,
    /// S3's breaker registry.
    pub breakers: Arc<BreakerRegistry>,
    /// S2's fair-share coordinator.
    pub coordinator: Arc<FairShareCoordinator>,
    /// S5's policy registry.
    pub policies: Arc<PolicyRegistry>,
    /// S4's analysis provider.
    pub provider: Arc<dyn AnalysisProvider>,
    /// Boundary counters.
    pub counters: Arc<Counters>,
}

impl std::fmt::Debug for VsmDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsmDeps").finish_non_exhaustive()
    }
}

/// Build the static dispatch table: every message type a system consumes,
/// registered once at startup.
#[must_use]
pub fn build_dispatch(deps: &VsmDeps) -> DispatchTable {
    let s1 = Arc::new(S1Handler::new(
        deps.publisher.clone(),
        Arc::clone(&deps.counters),
    ));
    let s2 = Arc::new(S2Handler::new(
        deps.publisher.clone(),
        Arc::clone(&deps.coordinator),
        Arc::clone(&deps.counters),
    ));
    let s3 = Arc::new(S3Handler::new(
        Arc::clone(&deps.limiter),
        Arc::clone(&deps.breakers),
        Arc::clone(&deps.counters),
    ));
    let s4 = Arc::new(S4Handler::new(
        deps.publisher.clone(),
        Arc::clone(&deps.limiter),
        Arc::clone(&deps.breakers),
        Arc::clone(&deps.provider),
        Arc::clone(&deps.counters),
    ));
    let s5 = Arc::new(S5Handler::new(
        deps.publisher.clone(),
        Arc::clone(&deps.policies),
        Arc::clone(&deps.counters),
    ));

    DispatchTable::new()
        .on(message_types::S1_OPERATION, s1.clone())
        .on(message_types::S4_RESULT, s1)
        .on(message_types::S2_COORDINATE, s2)
        .on(message_types::S3_HEALTH, s3.clone())
        .on(message_types::S3_RATELIMIT, s3)
        .on(message_types::S4_ANALYZE, s4)
        .on(message_types::S5_REGISTER, s5.clone())
        .on(message_types::S5_EVALUATE, s5)
        .on(
            message_types::DIRECTIVE,
            Arc::new(DirectiveHandler::new(Arc::clone(&deps.counters))),
        )
}

/// The running VSM node: one verified consumer per system queue.
#[derive(Debug)]
pub struct VsmNode {
    cancel: CancellationToken,
}

impl VsmNode {
    /// Spawn consumers for all five system queues against the shared
    /// dispatch table.
    #[must_use]
    pub fn spawn(
        broker: BrokerHandle,
        codec: Arc<EnvelopeCodec>,
        ledger: Arc<ReplayLedger>,
        deps: &VsmDeps,
        prefetch: usize,
        retry_cap: u32,
        cancel: CancellationToken,
    ) -> Self {
        let dispatch = Arc::new(build_dispatch(deps));
        for system in VsmSystem::ALL {
            let mut config = ConsumerConfig::for_queue(system.queue_name());
            config.prefetch = prefetch;
            config.retry_cap = retry_cap;
            Consumer::new(
                broker.clone(),
                Arc::clone(&codec),
                Arc::clone(&ledger),
                Arc::clone(&dispatch),
                Arc::clone(&deps.counters),
                config,
            )
            .spawn(cancel.child_token());
        }
        info!("vsm node started (s1-s5 consumers)");
        Self { cancel }
    }

    /// Stop all consumers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::EchoProvider;
    use cyb_bus::{Broker, BrokerConfig, PublishOptions, PublisherConfig, Topology, exchanges};
    use cyb_control::{BreakerConfig, CoordinatorConfig, TokenBucketConfig};
    use cyb_core::{Episode, EpisodeKind, Priority, SiteId};
    use cyb_crypto::{KeyRing, ReplayConfig, SecretKey, SkewPolicy};
    use cyb_policy::Evaluator;
    use std::time::Duration;

    struct Node {
        publisher: Publisher,
        counters: Arc<Counters>,
        breakers: Arc<BreakerRegistry>,
        broker: BrokerHandle,
        cancel: CancellationToken,
    }

    async fn node() -> Node {
        let (broker, _join) = Broker::spawn(BrokerConfig::default());
        Topology::default().declare_all(&broker).await.unwrap();

        let codec = Arc::new(EnvelopeCodec::new(
            SiteId::new("vsm-test"),
            KeyRing::new("k1", SecretKey::new(b"vsm-test-secret-material".to_vec())),
            SkewPolicy::default(),
        ));
        let ledger = Arc::new(ReplayLedger::new(ReplayConfig::default()));
        let counters = Arc::new(Counters::new());
        let publisher = Publisher::new(
            broker.clone(),
            Arc::clone(&codec),
            "vsm-test",
            PublisherConfig::default(),
        );

        let limiter = Arc::new(RateLimiter::new(TokenBucketConfig {
            capacity: 100,
            refill_rate: 10.0,
        }));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let coordinator = Arc::new(FairShareCoordinator::new(
            CoordinatorConfig::default(),
            Arc::clone(&counters),
        ));
        let policies = Arc::new(PolicyRegistry::new(Evaluator::default()));

        let deps = VsmDeps {
            publisher: publisher.clone(),
            limiter,
            breakers: Arc::clone(&breakers),
            coordinator,
            policies,
            provider: Arc::new(EchoProvider),
            counters: Arc::clone(&counters),
        };

        let cancel = CancellationToken::new();
        let _node = VsmNode::spawn(
            broker.clone(),
            codec,
            ledger,
            &deps,
            16,
            3,
            cancel.clone(),
        );

        Node {
            publisher,
            counters,
            breakers,
            broker,
            cancel,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_operation_flows_s1_to_s4_result() {
        let node = node().await;

        let episode = Episode::new(EpisodeKind::Analysis, "inspect", VsmSystem::S1)
            .with_priority(Priority::High)
            .with_data(serde_json::json!({"text": "inspect this"}));
        node.publisher
            .publish_json(
                exchanges::EVENTS,
                "vsm.s1.operation",
                message_types::S1_OPERATION,
                &episode,
                PublishOptions::default(),
            )
            .await
            .unwrap();

        settle().await;

        assert_eq!(node.counters.get("s1_operations"), 1);
        assert_eq!(node.counters.get("s1_forwarded"), 1);
        assert_eq!(node.counters.get("s4_analyzed"), 1);
        // The analysis result flowed back into S1 over the bus.
        assert_eq!(node.counters.get("s1_analysis_results"), 1);
        node.cancel.cancel();
    }

    #[tokio::test]
    async fn test_low_priority_operation_not_forwarded() {
        let node = node().await;

        let episode = Episode::new(EpisodeKind::Operation, "sweep", VsmSystem::S1)
            .with_priority(Priority::Low);
        node.publisher
            .publish_json(
                exchanges::EVENTS,
                "vsm.s1.operation",
                message_types::S1_OPERATION,
                &episode,
                PublishOptions::default(),
            )
            .await
            .unwrap();

        settle().await;
        assert_eq!(node.counters.get("s1_operations"), 1);
        assert_eq!(node.counters.get("s1_forwarded"), 0);
        node.cancel.cancel();
    }

    #[tokio::test]
    async fn test_health_report_tunes_breakers() {
        let node = node().await;
        let breaker = node.breakers.get_or_create("s4_provider");
        let before = breaker.snapshot().adaptive_threshold;

        node.publisher
            .publish_json(
                VsmSystem::S3.exchange(),
                "s3.health.report",
                message_types::S3_HEALTH,
                &crate::messages::HealthReport {
                    system_health: 0.95,
                    error_rate: 0.0,
                },
                PublishOptions::default(),
            )
            .await
            .unwrap();

        settle().await;
        assert_eq!(node.counters.get("s3_health_updates"), 1);
        assert!(breaker.snapshot().adaptive_threshold > before);
        node.cancel.cancel();
    }

    #[tokio::test]
    async fn test_policy_register_and_evaluate_over_bus() {
        let node = node().await;

        node.publisher
            .publish_json(
                VsmSystem::S5.exchange(),
                "s5.policy.register",
                message_types::S5_REGISTER,
                &serde_json::json!({
                    "id": "edge",
                    "source": "require :authenticated\nallow",
                }),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        settle().await;
        assert_eq!(node.counters.get("s5_registered"), 1);

        // Evaluate and observe the published decision on events.stream.
        let mut stream = node.broker.subscribe("events.stream", 64).await.unwrap();
        node.publisher
            .publish_json(
                VsmSystem::S5.exchange(),
                "s5.policy.evaluate",
                message_types::S5_EVALUATE,
                &crate::messages::PolicyCheckRequest {
                    policy_ids: vec!["edge".to_string()],
                    context: serde_json::json!({"authenticated": true}),
                    roles: Vec::new(),
                },
                PublishOptions::default(),
            )
            .await
            .unwrap();
        settle().await;

        assert_eq!(node.counters.get("s5_evaluations"), 1);
        let mut saw_decision = false;
        while let Ok(delivery) = stream.try_recv() {
            if delivery.envelope.message_type == message_types::S5_DECISION {
                let doc: serde_json::Value =
                    serde_json::from_slice(&delivery.envelope.payload).unwrap();
                assert_eq!(doc["decision"], "allow");
                saw_decision = true;
            }
        }
        assert!(saw_decision, "decision not published");
        node.cancel.cancel();
    }

    #[tokio::test]
    async fn test_directive_broadcast() {
        let node = node().await;

        node.publisher
            .publish_json(
                VsmSystem::S2.exchange(),
                "s2.coordinate.request",
                message_types::S2_COORDINATE,
                &crate::messages::CoordinationRequest {
                    topic: "maintenance".to_string(),
                    priority: Some(50.0),
                    directive: Some("drain".to_string()),
                    targets: vec![VsmSystem::S1, VsmSystem::S3],
                },
                PublishOptions::default(),
            )
            .await
            .unwrap();

        settle().await;
        assert_eq!(node.counters.get("s2_broadcasts"), 1);
        assert_eq!(node.counters.get("directives_received"), 2);
        node.cancel.cancel();
    }
}
