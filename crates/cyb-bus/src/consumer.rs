//! The verified consumer loop.
//!
//! For each delivery: verify the envelope (clock skew, replay, HMAC),
//! dispatch by message type through the static table, then ack. Replay and
//! integrity failures are fatal at the boundary: reject without requeue so
//! the queue's dead-letter exchange owns them. Handler failures walk the
//! retry ladder: the envelope is re-signed with `x-cyb-retry` incremented
//! and parked on the delayed-retry queue until the cap is reached, then
//! routed to the terminal failure queue.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cyb_core::Backoff;
use cyb_crypto::{EnvelopeCodec, ReplayLedger};
use cyb_telemetry::Counters;

use crate::broker::{BrokerHandle, Delivery};
use crate::dispatch::DispatchTable;
use crate::error::HandlerError;
use crate::topology::queues;

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume.
    pub queue: String,
    /// In-flight delivery cap.
    pub prefetch: usize,
    /// Requeue passes before a message is terminally failed.
    pub retry_cap: u32,
    /// Per-message handler deadline.
    pub handler_timeout: Duration,
    /// Delayed-retry queue name.
    pub retry_queue: String,
    /// Terminal failure queue name.
    pub failed_queue: String,
}

impl ConsumerConfig {
    /// Defaults for a named queue.
    #[must_use]
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 16,
            retry_cap: 3,
            handler_timeout: Duration::from_secs(30),
            retry_queue: queues::EVENTS_RETRY.to_string(),
            failed_queue: queues::EVENTS_FAILED.to_string(),
        }
    }
}

/// A prefetch-bounded consumer bound to one queue.
pub struct Consumer {
    broker: BrokerHandle,
    codec: Arc<EnvelopeCodec>,
    ledger: Arc<ReplayLedger>,
    dispatch: Arc<DispatchTable>,
    counters: Arc<Counters>,
    config: ConsumerConfig,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.config.queue)
            .field("prefetch", &self.config.prefetch)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Create a consumer.
    #[must_use]
    pub fn new(
        broker: BrokerHandle,
        codec: Arc<EnvelopeCodec>,
        ledger: Arc<ReplayLedger>,
        dispatch: Arc<DispatchTable>,
        counters: Arc<Counters>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            codec,
            ledger,
            dispatch,
            counters,
            config,
        }
    }

    /// Spawn the consumer loop; it runs until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// The consume loop with bounded exponential reconnect.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::reconnect();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self
                .broker
                .subscribe(self.config.queue.clone(), self.config.prefetch)
                .await
            {
                Ok(mut deliveries) => {
                    info!(queue = %self.config.queue, "consumer subscribed");
                    backoff.reset();
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            delivery = deliveries.recv() => match delivery {
                                Some(delivery) => self.process(delivery).await,
                                None => {
                                    warn!(queue = %self.config.queue, "consumer channel down");
                                    break;
                                },
                            },
                        }
                    }
                },
                Err(e) => {
                    warn!(queue = %self.config.queue, error = %e, "subscribe failed");
                },
            }
            let delay = backoff.next_delay();
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {},
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let envelope = &delivery.envelope;
        match self.codec.verify(envelope, &self.ledger) {
            Ok(()) => self.dispatch_verified(delivery).await,
            Err(e) if e.is_replay() => {
                self.counters.incr("replay_rejected");
                warn!(
                    queue = %self.config.queue,
                    message_id = %envelope.id,
                    routing_key = %envelope.routing_key,
                    "replay detected, rejecting to dead-letter"
                );
                self.broker.nack(&self.config.queue, delivery.tag, false);
            },
            Err(e) => {
                self.counters.incr("envelope_rejected");
                self.counters.incr(&format!("envelope_rejected_{}", e.kind()));
                warn!(
                    queue = %self.config.queue,
                    message_id = %envelope.id,
                    kind = e.kind(),
                    "envelope verification failed"
                );
                self.broker.nack(&self.config.queue, delivery.tag, false);
            },
        }
    }

    async fn dispatch_verified(&self, delivery: Delivery) {
        let envelope = &delivery.envelope;
        let Some(handler) = self.dispatch.resolve(&envelope.message_type) else {
            self.counters.incr("unknown_type");
            warn!(
                queue = %self.config.queue,
                message_type = %envelope.message_type,
                "no handler registered, rejecting to dead-letter"
            );
            self.broker.nack(&self.config.queue, delivery.tag, false);
            return;
        };

        let outcome =
            match tokio::time::timeout(self.config.handler_timeout, handler.handle(envelope)).await
            {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout {
                    timeout_ms: u64::try_from(self.config.handler_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                }),
            };

        match outcome {
            Ok(()) => {
                self.counters.incr("consumed");
                self.broker.ack(&self.config.queue, delivery.tag);
            },
            Err(e) => {
                self.counters.incr(&format!("handler_{}", e.kind()));
                self.route_failed(delivery, &e).await;
            },
        }
    }

    /// Walk the retry ladder for a failed delivery.
    async fn route_failed(&self, delivery: Delivery, cause: &HandlerError) {
        let mut envelope = delivery.envelope.clone();
        let retries_used = envelope.headers.retry_count;

        if retries_used < self.config.retry_cap {
            envelope.headers.retry_count = retries_used.saturating_add(1);
            debug!(
                message_id = %envelope.id,
                retry = envelope.headers.retry_count,
                cap = self.config.retry_cap,
                error = %cause,
                "parking failed message on retry queue"
            );
            if self.enrich_and_park(&self.config.retry_queue, envelope).await {
                self.broker.ack(&self.config.queue, delivery.tag);
            } else {
                self.broker.nack(&self.config.queue, delivery.tag, true);
            }
        } else {
            self.counters.incr("retry_exhausted");
            error!(
                message_id = %envelope.id,
                retries = retries_used,
                error = %cause,
                "retries exhausted, routing to failure queue"
            );
            if self.enrich_and_park(&self.config.failed_queue, envelope).await {
                self.broker.ack(&self.config.queue, delivery.tag);
            } else {
                self.broker.nack(&self.config.queue, delivery.tag, false);
            }
        }
    }

    /// Re-sign with a fresh nonce (each hop is replay-protected) and place
    /// on the named queue. Returns whether the park succeeded.
    async fn enrich_and_park(&self, queue: &str, mut envelope: cyb_core::Envelope) -> bool {
        envelope.security = None;
        let signed = match self.codec.enrich(envelope) {
            Ok(signed) => signed,
            Err(e) => {
                error!(error = %e, "re-sign for requeue failed");
                return false;
            },
        };
        match self.broker.publish_to_queue(queue, signed).await {
            Ok(_) => true,
            Err(e) => {
                error!(queue, error = %e, "requeue publish failed");
                false
            },
        }
    }
}
