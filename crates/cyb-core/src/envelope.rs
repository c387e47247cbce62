//! The canonical message envelope passed over the bus.
//!
//! Every message that enters the substrate is wrapped in an [`Envelope`]:
//! routing metadata, opaque payload bytes, correlation headers, and the
//! security block added by the envelope codec. The envelope serializes to
//! JSON on the wire; payload bytes travel base64-encoded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{CorrelationId, MessageId, now_ms};

/// Content type attached to every publish.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Routing and correlation headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    /// Correlation identifier, generated at the first hop if absent.
    pub correlation_id: CorrelationId,
    /// Logical source of the message (component or node name).
    pub source: String,
    /// Publish wall-clock timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Optional causal vector for consumers that tolerate reordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causal_vector: Option<BTreeMap<String, u64>>,
    /// Requeue count, incremented by the consumer on each retry pass.
    #[serde(rename = "x-cyb-retry", default)]
    pub retry_count: u32,
}

/// Security block attached by the envelope codec.
///
/// `signature` is the hex HMAC-SHA256 over the canonical string
/// `nonce|timestamp|site|exchange|routing_key|content_type|payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityHeaders {
    /// High-entropy per-message nonce (hex).
    pub nonce: String,
    /// Signing wall-clock timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Name of the signing node.
    pub site: String,
    /// Hex HMAC-SHA256 signature.
    pub signature: String,
    /// Identifier of the key that produced the signature.
    pub key_id: String,
}

/// The universal unit passed over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque identifier, unique per publish.
    pub id: MessageId,
    /// Target exchange name.
    pub exchange: String,
    /// Dot-segmented routing key, e.g. `s4.intelligence.analyze`.
    pub routing_key: String,
    /// Free-form discriminator dispatched on by consumers.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Payload media type.
    pub content_type: String,
    /// Opaque payload bytes.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Routing and correlation headers.
    pub headers: EnvelopeHeaders,
    /// Security block; `None` until the codec enriches the envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityHeaders>,
}

impl Envelope {
    /// Start building an envelope for the given routing target.
    #[must_use]
    pub fn builder(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message_type: impl Into<String>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message_type: message_type.into(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            payload: Vec::new(),
            correlation_id: None,
            source: String::new(),
            causal_vector: None,
        }
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails (unbounded payloads are
    /// the only practical cause).
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope document.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Drop the security block and return the bare payload.
    #[must_use]
    pub fn into_payload(mut self) -> Vec<u8> {
        self.security = None;
        self.payload
    }

    /// Whether the security block is present and complete.
    #[must_use]
    pub fn has_security_headers(&self) -> bool {
        self.security.as_ref().is_some_and(|s| {
            !s.nonce.is_empty()
                && !s.site.is_empty()
                && !s.signature.is_empty()
                && !s.key_id.is_empty()
        })
    }
}

/// Builder for [`Envelope`].
#[derive(Debug)]
pub struct EnvelopeBuilder {
    exchange: String,
    routing_key: String,
    message_type: String,
    content_type: String,
    payload: Vec<u8>,
    correlation_id: Option<CorrelationId>,
    source: String,
    causal_vector: Option<BTreeMap<String, u64>>,
}

impl EnvelopeBuilder {
    /// Set raw payload bytes.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serialize a document as the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the document fails to serialize.
    pub fn json_payload<T: Serialize>(mut self, doc: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_vec(doc)?;
        self.content_type = CONTENT_TYPE_JSON.to_string();
        Ok(self)
    }

    /// Set the logical source.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Carry an existing correlation id instead of generating one.
    #[must_use]
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Attach a causal vector.
    #[must_use]
    pub fn causal_vector(mut self, vector: BTreeMap<String, u64>) -> Self {
        self.causal_vector = Some(vector);
        self
    }

    /// Override the content type.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Finish the envelope. A fresh id and timestamp are assigned here;
    /// the security block stays empty until the codec enriches it.
    #[must_use]
    pub fn build(self) -> Envelope {
        Envelope {
            id: MessageId::generate(),
            exchange: self.exchange,
            routing_key: self.routing_key,
            message_type: self.message_type,
            content_type: self.content_type,
            payload: self.payload,
            headers: EnvelopeHeaders {
                correlation_id: self.correlation_id.unwrap_or_else(CorrelationId::generate),
                source: self.source,
                timestamp_ms: now_ms(),
                causal_vector: self.causal_vector,
                retry_count: 0,
            },
            security: None,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
