//! The signing publisher.
//!
//! Every publish builds an envelope (correlation id generated if absent,
//! persistent content type, source identifier), signs it through the
//! envelope codec, and blocks until the broker confirm arrives or the
//! bounded timeout elapses. Nacks and confirm timeouts retry with a
//! jittered exponential backoff; each retry re-signs with a fresh nonce so
//! downstream replay detection only ever rejects true duplicates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use cyb_core::{Backoff, CorrelationId, Envelope, MessageId};
use cyb_crypto::EnvelopeCodec;

use crate::broker::BrokerHandle;
use crate::error::BusError;

/// Publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// How long to wait for a broker confirm before reporting timeout.
    pub confirm_timeout: Duration,
    /// Publish attempts before giving up (1 = no retry).
    pub max_attempts: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// Per-publish options.
#[derive(Debug, Default, Clone)]
pub struct PublishOptions {
    /// Carry an existing correlation id instead of generating one.
    pub correlation_id: Option<CorrelationId>,
    /// Attach a causal vector.
    pub causal_vector: Option<BTreeMap<String, u64>>,
}

/// Publishes signed envelopes with confirms.
#[derive(Clone)]
pub struct Publisher {
    broker: BrokerHandle,
    codec: Arc<EnvelopeCodec>,
    source: String,
    config: PublisherConfig,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("source", &self.source)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Create a publisher stamping `source` into every envelope.
    #[must_use]
    pub fn new(
        broker: BrokerHandle,
        codec: Arc<EnvelopeCodec>,
        source: impl Into<String>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            broker,
            codec,
            source: source.into(),
            config,
        }
    }

    /// Publish a payload to `exchange` under `routing_key`.
    ///
    /// Returns the message id once the broker has confirmed the enqueue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConfirmTimeout`] if no confirm arrived within the
    /// window after all attempts, or the underlying broker error.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_type: &str,
        payload: Vec<u8>,
        opts: PublishOptions,
    ) -> Result<MessageId, BusError> {
        let mut builder = Envelope::builder(exchange, routing_key, message_type)
            .payload(payload)
            .source(self.source.clone());
        if let Some(correlation_id) = opts.correlation_id {
            builder = builder.correlation_id(correlation_id);
        }
        if let Some(causal_vector) = opts.causal_vector {
            builder = builder.causal_vector(causal_vector);
        }
        self.publish_envelope(builder.build()).await
    }

    /// Serialize a document and publish it as JSON.
    ///
    /// # Errors
    ///
    /// Returns a decode-kind error if serialization fails, otherwise as
    /// [`Self::publish`].
    pub async fn publish_json<T: serde::Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message_type: &str,
        doc: &T,
        opts: PublishOptions,
    ) -> Result<MessageId, BusError> {
        let payload = serde_json::to_vec(doc).map_err(|e| BusError::Decode(e.to_string()))?;
        self.publish(exchange, routing_key, message_type, payload, opts).await
    }

    /// Sign and publish a pre-built envelope with confirm + bounded retry.
    ///
    /// # Errors
    ///
    /// See [`Self::publish`].
    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<MessageId, BusError> {
        let mut backoff = Backoff::reconnect();
        let mut last_error = BusError::ConfirmTimeout;
        let attempts = self.config.max_attempts.max(1);

        for attempt in 0..attempts {
            // Fresh nonce per attempt: a confirmed-but-slow first attempt
            // must not poison the retry as a replay.
            let signed = self
                .codec
                .enrich(envelope.clone())
                .map_err(|e| BusError::Security(e.to_string()))?;
            let id = signed.id;

            let outcome =
                tokio::time::timeout(self.config.confirm_timeout, self.broker.publish(signed))
                    .await;
            match outcome {
                Ok(Ok(reached)) => {
                    debug!(
                        message_id = %id,
                        exchange = %envelope.exchange,
                        routing_key = %envelope.routing_key,
                        queues = reached,
                        "publish confirmed"
                    );
                    return Ok(id);
                },
                Ok(Err(e @ (BusError::UnknownExchange(_) | BusError::UnknownQueue(_)))) => {
                    // Topology errors never heal by retrying.
                    return Err(e);
                },
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "publish rejected, retrying");
                    last_error = e;
                },
                Err(_) => {
                    warn!(attempt, "publish confirm timeout, retrying");
                    last_error = BusError::ConfirmTimeout;
                },
            }
            if attempt.saturating_add(1) < attempts {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
        Err(last_error)
    }

    /// Sign and place an envelope directly onto a named queue (retry and
    /// terminal-failure paths).
    ///
    /// # Errors
    ///
    /// Returns the broker error or [`BusError::ConfirmTimeout`].
    pub async fn publish_to_queue(
        &self,
        queue: &str,
        envelope: Envelope,
    ) -> Result<MessageId, BusError> {
        let signed = self
            .codec
            .enrich(envelope)
            .map_err(|e| BusError::Security(e.to_string()))?;
        let id = signed.id;
        tokio::time::timeout(
            self.config.confirm_timeout,
            self.broker.publish_to_queue(queue, signed),
        )
        .await
        .map_err(|_| BusError::ConfirmTimeout)??;
        Ok(id)
    }

    /// The envelope codec, for consumers sharing this publisher's keys.
    #[must_use]
    pub fn codec(&self) -> &Arc<EnvelopeCodec> {
        &self.codec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};
    use crate::topology::{BindingDecl, ExchangeDecl, QueueDecl, exchanges};
    use cyb_core::SiteId;
    use cyb_crypto::{KeyRing, ReplayConfig, ReplayLedger, SecretKey, SkewPolicy};

    fn codec() -> Arc<EnvelopeCodec> {
        Arc::new(EnvelopeCodec::new(
            SiteId::new("pub-test"),
            KeyRing::new("k1", SecretKey::new(b"test-secret-material".to_vec())),
            SkewPolicy::default(),
        ))
    }

    async fn wired() -> (BrokerHandle, Publisher) {
        let (handle, _join) = Broker::spawn(BrokerConfig::default());
        handle
            .declare_exchange(ExchangeDecl::topic(exchanges::EVENTS))
            .await
            .unwrap();
        handle.declare_queue(QueueDecl::new("q1")).await.unwrap();
        handle
            .bind(BindingDecl::new(exchanges::EVENTS, "q1", "s1.*"))
            .await
            .unwrap();
        let publisher = Publisher::new(
            handle.clone(),
            codec(),
            "pub-test",
            PublisherConfig::default(),
        );
        (handle, publisher)
    }

    #[tokio::test]
    async fn test_publish_is_signed_and_confirmed() {
        let (broker, publisher) = wired().await;
        let mut rx = broker.subscribe("q1", 4).await.unwrap();

        let id = publisher
            .publish(
                exchanges::EVENTS,
                "s1.echo",
                "echo",
                b"hi".to_vec(),
                PublishOptions::default(),
            )
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.envelope.id, id);
        assert!(delivery.envelope.has_security_headers());
        assert_eq!(delivery.envelope.headers.source, "pub-test");

        // The envelope verifies against the same codec.
        let ledger = ReplayLedger::new(ReplayConfig::default());
        assert!(publisher.codec().verify(&delivery.envelope, &ledger).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_not_retried() {
        let (_broker, publisher) = wired().await;
        let started = std::time::Instant::now();
        let result = publisher
            .publish(
                "cyb.ghost",
                "s1.echo",
                "echo",
                Vec::new(),
                PublishOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(BusError::UnknownExchange(_))));
        // No backoff ladder was climbed.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_correlation_id_carried() {
        let (broker, publisher) = wired().await;
        let mut rx = broker.subscribe("q1", 4).await.unwrap();
        let correlation_id = CorrelationId::generate();

        publisher
            .publish(
                exchanges::EVENTS,
                "s1.echo",
                "echo",
                Vec::new(),
                PublishOptions {
                    correlation_id: Some(correlation_id),
                    causal_vector: None,
                },
            )
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.envelope.headers.correlation_id, correlation_id);
    }
}
