//! Envelope enrichment and verification.
//!
//! # Verification Order
//!
//! 1. All security headers present? -> `missing_security_headers`
//! 2. Timestamp inside the skew window? -> `clock_skew_*` / `expired_timestamp`
//! 3. Nonce fresh in the replay ledger? -> `replay_detected`
//! 4. Key id resolvable? -> `unknown_key`
//! 5. HMAC recomputed and compared in constant time? -> `invalid_signature`
//!
//! Each check fails closed; a rejected envelope never reaches a handler.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::RwLock;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use cyb_core::{Envelope, SecurityHeaders, SiteId, now_ms};

use crate::error::{SignError, VerifyError};
use crate::keyring::KeyRing;
use crate::nonce::Nonce;
use crate::replay::ReplayLedger;

type HmacSha256 = Hmac<Sha256>;

/// Separator of the canonical signing string. Fields before the payload are
/// hex tokens or validated names that can never contain it.
const CANONICAL_SEP: u8 = b'|';

/// Clock-skew tolerance for inbound envelopes.
#[derive(Debug, Clone, Copy)]
pub struct SkewPolicy {
    /// Maximum tolerated skew in either direction.
    pub max_skew: Duration,
    /// Horizon beyond which a past timestamp is treated as expired.
    pub replay_window: Duration,
}

impl Default for SkewPolicy {
    fn default() -> Self {
        Self {
            max_skew: Duration::from_secs(30),
            replay_window: Duration::from_secs(90),
        }
    }
}

/// Signs outbound envelopes and verifies inbound ones.
///
/// The key ring sits behind a reader-writer lock: verification takes the
/// read side, rotation briefly takes the write side. No lock is held across
/// an await point.
#[derive(Debug)]
pub struct EnvelopeCodec {
    site: SiteId,
    keyring: RwLock<KeyRing>,
    policy: SkewPolicy,
}

impl EnvelopeCodec {
    /// Create a codec for this node.
    #[must_use]
    pub fn new(site: SiteId, keyring: KeyRing, policy: SkewPolicy) -> Self {
        Self {
            site,
            keyring: RwLock::new(keyring),
            policy,
        }
    }

    /// The node name stamped into signed envelopes.
    #[must_use]
    pub fn site(&self) -> &SiteId {
        &self.site
    }

    /// Identifier of the currently active signing key.
    #[must_use]
    pub fn active_key_id(&self) -> String {
        self.read_ring().active_id().to_string()
    }

    /// Swap the active signing key atomically. Prior keys keep verifying.
    pub fn rotate_key(&self, key_id: impl Into<String>, secret: crate::SecretKey) {
        let mut ring = self
            .keyring
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ring.rotate(key_id, secret);
    }

    /// Attach a fresh nonce, timestamp, site, key id, and signature.
    ///
    /// # Errors
    ///
    /// Returns [`SignError::InvalidKey`] if the active key material is
    /// rejected by the MAC implementation.
    pub fn enrich(&self, mut envelope: Envelope) -> Result<Envelope, SignError> {
        let nonce = Nonce::generate();
        let timestamp_ms = now_ms();
        let ring = self.read_ring();

        let canonical = canonical_bytes(
            &nonce.to_hex(),
            timestamp_ms,
            self.site.as_str(),
            &envelope.exchange,
            &envelope.routing_key,
            &envelope.content_type,
            &envelope.payload,
        );
        let signature = sign_bytes(ring.active_key().as_bytes(), &canonical)?;

        envelope.security = Some(SecurityHeaders {
            nonce: nonce.to_hex(),
            timestamp_ms,
            site: self.site.as_str().to_string(),
            signature: hex::encode(signature),
            key_id: ring.active_id().to_string(),
        });
        Ok(envelope)
    }

    /// Run the full verification chain against an inbound envelope.
    ///
    /// On success the nonce has been recorded in the ledger, so a second
    /// byte-identical envelope fails with `replay_detected`.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a distinct [`VerifyError`] kind.
    pub fn verify(&self, envelope: &Envelope, ledger: &ReplayLedger) -> Result<(), VerifyError> {
        if !envelope.has_security_headers() {
            return Err(VerifyError::MissingSecurityHeaders);
        }
        // Presence was just checked.
        let Some(security) = envelope.security.as_ref() else {
            return Err(VerifyError::MissingSecurityHeaders);
        };

        self.check_skew(security.timestamp_ms)?;

        if !ledger.check_and_insert(&security.nonce) {
            warn!(
                site = %security.site,
                routing_key = %envelope.routing_key,
                "replayed nonce rejected"
            );
            return Err(VerifyError::ReplayDetected);
        }

        let ring = self.read_ring();
        let Some(key) = ring.resolve(&security.key_id) else {
            return Err(VerifyError::UnknownKey {
                key_id: security.key_id.clone(),
            });
        };

        let canonical = canonical_bytes(
            &security.nonce,
            security.timestamp_ms,
            &security.site,
            &envelope.exchange,
            &envelope.routing_key,
            &envelope.content_type,
            &envelope.payload,
        );
        let expected = sign_bytes(key.as_bytes(), &canonical)
            .map_err(|_| VerifyError::InvalidSignature)?;
        let provided = hex::decode(&security.signature)
            .map_err(|_| VerifyError::InvalidSignature)?;

        if expected.ct_eq(provided.as_slice()).into() {
            Ok(())
        } else {
            Err(VerifyError::InvalidSignature)
        }
    }

    /// Skew check with the magnitude exported for telemetry.
    fn check_skew(&self, timestamp_ms: u64) -> Result<(), VerifyError> {
        let now = now_ms();
        let max_skew_ms = duration_ms(self.policy.max_skew);
        let window_ms = duration_ms(self.policy.replay_window);

        if timestamp_ms > now {
            let skew_ms = timestamp_ms.saturating_sub(now);
            debug!(skew_ms, direction = "future", "clock skew check");
            if skew_ms > max_skew_ms {
                return Err(VerifyError::ClockSkewFuture { skew_ms });
            }
            return Ok(());
        }

        let age_ms = now.saturating_sub(timestamp_ms);
        debug!(skew_ms = age_ms, direction = "past", "clock skew check");
        if age_ms > window_ms {
            return Err(VerifyError::ExpiredTimestamp { age_ms });
        }
        if age_ms > max_skew_ms {
            return Err(VerifyError::ClockSkewPast { skew_ms: age_ms });
        }
        Ok(())
    }

    fn read_ring(&self) -> std::sync::RwLockReadGuard<'_, KeyRing> {
        self.keyring
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Build the canonical signing string:
/// `nonce|timestamp|site|exchange|routing_key|content_type|payload`.
fn canonical_bytes(
    nonce_hex: &str,
    timestamp_ms: u64,
    site: &str,
    exchange: &str,
    routing_key: &str,
    content_type: &str,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        nonce_hex
            .len()
            .saturating_add(site.len())
            .saturating_add(exchange.len())
            .saturating_add(routing_key.len())
            .saturating_add(content_type.len())
            .saturating_add(payload.len())
            .saturating_add(32),
    );
    out.extend_from_slice(nonce_hex.as_bytes());
    out.push(CANONICAL_SEP);
    out.extend_from_slice(timestamp_ms.to_string().as_bytes());
    out.push(CANONICAL_SEP);
    out.extend_from_slice(site.as_bytes());
    out.push(CANONICAL_SEP);
    out.extend_from_slice(exchange.as_bytes());
    out.push(CANONICAL_SEP);
    out.extend_from_slice(routing_key.as_bytes());
    out.push(CANONICAL_SEP);
    out.extend_from_slice(content_type.as_bytes());
    out.push(CANONICAL_SEP);
    out.extend_from_slice(payload);
    out
}

fn sign_bytes(key: &[u8], data: &[u8]) -> Result<[u8; 32], SignError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::SecretKey;
    use crate::replay::{ReplayConfig, ReplayLedger};

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(
            SiteId::new("node-a"),
            KeyRing::new("k1", SecretKey::new(b"0123456789abcdef".to_vec())),
            SkewPolicy::default(),
        )
    }

    fn ledger() -> ReplayLedger {
        ReplayLedger::new(ReplayConfig::default())
    }

    fn envelope() -> Envelope {
        Envelope::builder("cyb.events", "s1.echo", "echo")
            .payload(b"hi".to_vec())
            .source("test")
            .build()
    }

    #[test]
    fn test_enrich_then_verify() {
        let codec = codec();
        let ledger = ledger();
        let signed = codec.enrich(envelope()).unwrap();

        assert!(signed.has_security_headers());
        assert!(codec.verify(&signed, &ledger).is_ok());
    }

    #[test]
    fn test_verify_without_security_block() {
        let codec = codec();
        assert_eq!(
            codec.verify(&envelope(), &ledger()),
            Err(VerifyError::MissingSecurityHeaders)
        );
    }

    #[test]
    fn test_second_verify_is_replay() {
        let codec = codec();
        let ledger = ledger();
        let signed = codec.enrich(envelope()).unwrap();

        codec.verify(&signed, &ledger).unwrap();
        assert_eq!(
            codec.verify(&signed, &ledger),
            Err(VerifyError::ReplayDetected)
        );
    }

    #[test]
    fn test_payload_mutation_breaks_signature() {
        let codec = codec();
        let mut signed = codec.enrich(envelope()).unwrap();
        signed.payload = b"tampered".to_vec();
        assert_eq!(
            codec.verify(&signed, &ledger()),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn test_routing_key_mutation_breaks_signature() {
        let codec = codec();
        let mut signed = codec.enrich(envelope()).unwrap();
        signed.routing_key = "s5.policy.evaluate".to_string();
        assert_eq!(
            codec.verify(&signed, &ledger()),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn test_nonce_mutation_breaks_signature() {
        let codec = codec();
        let mut signed = codec.enrich(envelope()).unwrap();
        signed.security.as_mut().unwrap().nonce = Nonce::generate().to_hex();
        assert_eq!(
            codec.verify(&signed, &ledger()),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn test_timestamp_mutation_breaks_signature() {
        let codec = codec();
        let mut signed = codec.enrich(envelope()).unwrap();
        let security = signed.security.as_mut().unwrap();
        security.timestamp_ms = security.timestamp_ms.saturating_sub(1);
        assert_eq!(
            codec.verify(&signed, &ledger()),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn test_future_skew_boundary() {
        let codec = codec();
        let ledger = ledger();
        let max_skew_ms = duration_ms(SkewPolicy::default().max_skew);

        // Exactly max_skew is accepted (the signature check then fails
        // because we forged the timestamp, so re-sign manually).
        let mut signed = codec.enrich(envelope()).unwrap();
        let forged_ts = now_ms().saturating_add(max_skew_ms.saturating_add(1000));
        signed.security.as_mut().unwrap().timestamp_ms = forged_ts;
        assert!(matches!(
            codec.verify(&signed, &ledger),
            Err(VerifyError::ClockSkewFuture { .. })
        ));
    }

    #[test]
    fn test_expired_timestamp() {
        let codec = codec();
        let mut signed = codec.enrich(envelope()).unwrap();
        let window_ms = duration_ms(SkewPolicy::default().replay_window);
        signed.security.as_mut().unwrap().timestamp_ms =
            now_ms().saturating_sub(window_ms.saturating_add(1000));
        assert!(matches!(
            codec.verify(&signed, &ledger()),
            Err(VerifyError::ExpiredTimestamp { .. })
        ));
    }

    #[test]
    fn test_past_skew_inside_window() {
        let codec = codec();
        let max_skew_ms = duration_ms(SkewPolicy::default().max_skew);
        let mut signed = codec.enrich(envelope()).unwrap();
        signed.security.as_mut().unwrap().timestamp_ms =
            now_ms().saturating_sub(max_skew_ms.saturating_add(2000));
        assert!(matches!(
            codec.verify(&signed, &ledger()),
            Err(VerifyError::ClockSkewPast { .. })
        ));
    }

    #[test]
    fn test_skew_boundary_is_exact() {
        let codec = codec();
        let max_skew_ms = duration_ms(SkewPolicy::default().max_skew);
        let window_ms = duration_ms(SkewPolicy::default().replay_window);
        let now = now_ms();

        // Exactly max_skew in the future is accepted; one more millisecond
        // is not. Same at the past edge and the replay-window edge.
        assert!(codec.check_skew(now.saturating_add(max_skew_ms)).is_ok());
        assert!(matches!(
            codec.check_skew(now.saturating_add(max_skew_ms).saturating_add(2)),
            Err(VerifyError::ClockSkewFuture { .. })
        ));
        // Small margin on the accepted side: the wall clock advances
        // between the capture above and the check below.
        assert!(
            codec
                .check_skew(now.saturating_sub(max_skew_ms.saturating_sub(5)))
                .is_ok()
        );
        assert!(matches!(
            codec.check_skew(now.saturating_sub(max_skew_ms.saturating_add(2))),
            Err(VerifyError::ClockSkewPast { .. })
        ));
        assert!(matches!(
            codec.check_skew(now.saturating_sub(window_ms.saturating_add(2))),
            Err(VerifyError::ExpiredTimestamp { .. })
        ));
    }

    #[test]
    fn test_rotation_keeps_old_envelopes_verifiable() {
        let codec = codec();
        let ledger = ledger();
        let old = codec.enrich(envelope()).unwrap();

        codec.rotate_key("k2", SecretKey::new(b"fedcba9876543210".to_vec()));
        assert_eq!(codec.active_key_id(), "k2");

        // Signed under k1, still verifies.
        assert!(codec.verify(&old, &ledger).is_ok());

        // New envelopes sign under k2.
        let fresh = codec.enrich(envelope()).unwrap();
        assert_eq!(fresh.security.as_ref().unwrap().key_id, "k2");
        assert!(codec.verify(&fresh, &ledger).is_ok());
    }

    #[test]
    fn test_unknown_key_id() {
        let codec = codec();
        let mut signed = codec.enrich(envelope()).unwrap();
        signed.security.as_mut().unwrap().key_id = "ghost".to_string();
        assert_eq!(
            codec.verify(&signed, &ledger()),
            Err(VerifyError::UnknownKey {
                key_id: "ghost".to_string()
            })
        );
    }
}
