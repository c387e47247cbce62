//! Exchange, queue, and binding declarations.
//!
//! The topology manager declares everything idempotently on every boot and
//! never destroys pre-existing structure: a re-declaration with different
//! parameters keeps the original.

use std::time::Duration;

use cyb_core::VsmSystem;

use crate::broker::BrokerHandle;
use crate::error::BusError;

/// Well-known exchange names.
pub mod exchanges {
    /// Main durable topic exchange.
    pub const EVENTS: &str = "cyb.events";
    /// Command traffic.
    pub const COMMANDS: &str = "cyb.commands";
    /// Telemetry fan-out.
    pub const TELEMETRY: &str = "cyb.telemetry";
    /// Tool invocation traffic.
    pub const MCP_TOOLS: &str = "cyb.mcp.tools";
    /// Direct exchange for priority alerts.
    pub const PRIORITY: &str = "cyb.priority";
    /// Dead-letter fanout.
    pub const DLX: &str = "cyb.dlx";
}

/// Well-known queue names.
pub mod queues {
    /// Telemetry metric stream.
    pub const TELEMETRY_METRICS: &str = "telemetry.metrics";
    /// Telemetry log stream.
    pub const TELEMETRY_LOGS: &str = "telemetry.logs";
    /// Firehose of events for streaming consumers.
    pub const EVENTS_STREAM: &str = "events.stream";
    /// High-priority alert queue.
    pub const PRIORITY_ALERTS: &str = "priority.alerts";
    /// Terminal dead-letter queue.
    pub const DLQ: &str = "dlq";
    /// Delayed-retry queue; TTL dead-letters back into `cyb.events`.
    pub const EVENTS_RETRY: &str = "cyb.events.retry";
    /// Terminal failure queue for retry-exhausted messages.
    pub const EVENTS_FAILED: &str = "cyb.events.failed";
}

/// Exchange routing semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Wildcard pattern routing over dot-segmented keys.
    Topic,
    /// Exact routing-key match.
    Direct,
    /// Every bound queue receives every message.
    Fanout,
}

/// A durable exchange declaration.
#[derive(Debug, Clone)]
pub struct ExchangeDecl {
    /// Exchange name.
    pub name: String,
    /// Routing semantics.
    pub kind: ExchangeKind,
}

impl ExchangeDecl {
    /// Declare a topic exchange.
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
        }
    }

    /// Declare a direct exchange.
    #[must_use]
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
        }
    }

    /// Declare a fanout exchange.
    #[must_use]
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
        }
    }
}

/// A durable queue declaration.
#[derive(Debug, Clone)]
pub struct QueueDecl {
    /// Queue name.
    pub name: String,
    /// Per-message TTL; expired messages dead-letter or drop.
    pub message_ttl: Option<Duration>,
    /// Exchange that receives expired/rejected messages.
    pub dead_letter_exchange: Option<String>,
    /// `x-priority` hint carried for the alert queue.
    pub max_priority: Option<u8>,
}

impl QueueDecl {
    /// A plain durable queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message_ttl: None,
            dead_letter_exchange: None,
            max_priority: None,
        }
    }

    /// Set the per-message TTL.
    #[must_use]
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Set the dead-letter exchange.
    #[must_use]
    pub fn with_dead_letter(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Set the priority hint.
    #[must_use]
    pub fn with_max_priority(mut self, priority: u8) -> Self {
        self.max_priority = Some(priority);
        self
    }
}

/// A binding from an exchange to a queue.
#[derive(Debug, Clone)]
pub struct BindingDecl {
    /// Source exchange.
    pub exchange: String,
    /// Destination queue.
    pub queue: String,
    /// Routing pattern (ignored by fanout exchanges).
    pub pattern: String,
}

impl BindingDecl {
    /// Bind a queue to an exchange with a pattern.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            pattern: pattern.into(),
        }
    }
}

/// The full set of declarations applied at startup.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Exchanges to declare.
    pub exchanges: Vec<ExchangeDecl>,
    /// Queues to declare.
    pub queues: Vec<QueueDecl>,
    /// Bindings to declare.
    pub bindings: Vec<BindingDecl>,
}

impl Topology {
    /// The standard control-plane topology.
    ///
    /// `queue_ttl` bounds how long a message may sit in a VSM work queue
    /// (default 300 s); `retry_ttl` is the delayed-retry interval (default
    /// 15 s) after which the retry queue dead-letters back into `cyb.events`.
    #[must_use]
    pub fn standard(queue_ttl: Duration, retry_ttl: Duration) -> Self {
        let mut exchange_decls = vec![
            ExchangeDecl::topic(exchanges::EVENTS),
            ExchangeDecl::topic(exchanges::COMMANDS),
            ExchangeDecl::topic(exchanges::TELEMETRY),
            ExchangeDecl::topic(exchanges::MCP_TOOLS),
            ExchangeDecl::direct(exchanges::PRIORITY),
            ExchangeDecl::fanout(exchanges::DLX),
        ];
        for system in VsmSystem::ALL {
            exchange_decls.push(ExchangeDecl::topic(system.exchange()));
        }

        let mut queue_decls = vec![
            QueueDecl::new(queues::TELEMETRY_METRICS),
            QueueDecl::new(queues::TELEMETRY_LOGS),
            QueueDecl::new(queues::EVENTS_STREAM),
            QueueDecl::new(queues::PRIORITY_ALERTS).with_max_priority(10),
            QueueDecl::new(queues::DLQ),
            QueueDecl::new(queues::EVENTS_RETRY)
                .with_message_ttl(retry_ttl)
                .with_dead_letter(exchanges::EVENTS),
            QueueDecl::new(queues::EVENTS_FAILED),
        ];
        for system in VsmSystem::ALL {
            queue_decls.push(
                QueueDecl::new(system.queue_name())
                    .with_message_ttl(queue_ttl)
                    .with_dead_letter(exchanges::DLX),
            );
        }

        let mut binding_decls = vec![
            BindingDecl::new(exchanges::PRIORITY, queues::PRIORITY_ALERTS, "alert"),
            BindingDecl::new(exchanges::DLX, queues::DLQ, "#"),
            BindingDecl::new(exchanges::EVENTS, queues::EVENTS_STREAM, "#"),
            BindingDecl::new(exchanges::TELEMETRY, queues::TELEMETRY_METRICS, "metrics.#"),
            BindingDecl::new(exchanges::TELEMETRY, queues::TELEMETRY_LOGS, "logs.#"),
        ];
        for system in VsmSystem::ALL {
            let queue = system.queue_name();
            binding_decls.push(BindingDecl::new(
                exchanges::EVENTS,
                &queue,
                format!("vsm.{}.*", system.routing_prefix()),
            ));
            binding_decls.push(BindingDecl::new(
                system.exchange(),
                &queue,
                format!("{}.#", system.routing_prefix()),
            ));
        }

        Self {
            exchanges: exchange_decls,
            queues: queue_decls,
            bindings: binding_decls,
        }
    }

    /// Apply every declaration through the broker handle.
    ///
    /// Safe to run on every boot: re-declarations are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is down or a binding references a
    /// name that failed to declare.
    pub async fn declare_all(&self, broker: &BrokerHandle) -> Result<(), BusError> {
        for exchange in &self.exchanges {
            broker.declare_exchange(exchange.clone()).await?;
        }
        for queue in &self.queues {
            broker.declare_queue(queue.clone()).await?;
        }
        for binding in &self.bindings {
            broker.bind(binding.clone()).await?;
        }
        tracing::info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "topology declared"
        );
        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::standard(Duration::from_secs(300), Duration::from_secs(15))
    }
}
