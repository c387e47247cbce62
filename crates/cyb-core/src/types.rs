//! Identifier newtypes, priority classes, and the VSM system enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Opaque 16-byte message identifier, unique per publish.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Get the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encode as a hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from a hex string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not 16 bytes.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Correlation identifier carried in envelope headers.
///
/// Generated at the first hop if the caller did not supply one, then echoed
/// on every downstream message so a whole exchange can be stitched together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    /// Generate a fresh correlation identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse from string form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node name used in envelope security headers and CRDT write tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    /// Create a site identifier.
    ///
    /// The `|` character is reserved by the canonical signing string and is
    /// stripped here so a site name can never break field boundaries.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        let cleaned: String = name.chars().filter(|c| *c != '|').collect();
        if cleaned.is_empty() {
            Self("node".to_string())
        } else {
            Self(cleaned)
        }
    }

    /// The site name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error produced when a tenant identifier fails validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid tenant id: {reason}")]
pub struct TenantIdError {
    /// Why the identifier was rejected.
    pub reason: String,
}

/// Validated tenant identifier: `[a-zA-Z0-9_-]{1,128}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Parse and validate a tenant identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TenantIdError`] if the identifier is empty, longer than 128
    /// characters, or contains characters outside `[a-zA-Z0-9_-]`.
    pub fn parse(s: &str) -> Result<Self, TenantIdError> {
        if s.is_empty() {
            return Err(TenantIdError {
                reason: "empty".to_string(),
            });
        }
        if s.len() > 128 {
            return Err(TenantIdError {
                reason: format!("length {} exceeds 128", s.len()),
            });
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(TenantIdError {
                reason: format!("character {bad:?} not allowed"),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// The tenant identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Priority class for admission and scheduling decisions.
///
/// Lower classes pay more tokens per unit request, so a saturated bucket
/// sheds low-priority load first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Never shed; cost 1.
    Critical,
    /// Interactive traffic; cost 1.
    High,
    /// Default class; cost 2.
    #[default]
    Normal,
    /// Background work; cost 4.
    Low,
}

impl Priority {
    /// Tokens consumed per unit request at this class.
    #[must_use]
    pub const fn token_cost(self) -> u32 {
        match self {
            Self::Critical | Self::High => 1,
            Self::Normal => 2,
            Self::Low => 4,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// The five logical subsystems of the Viable System Model.
///
/// Systems communicate exclusively through the bus; the enumeration pins
/// down the queue, exchange, and routing-key naming conventions so every
/// crate derives names from one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VsmSystem {
    /// Operations.
    S1,
    /// Coordination.
    S2,
    /// Control.
    S3,
    /// Intelligence.
    S4,
    /// Policy.
    S5,
}

impl VsmSystem {
    /// All systems in order.
    pub const ALL: [Self; 5] = [Self::S1, Self::S2, Self::S3, Self::S4, Self::S5];

    /// Ordinal 1..=5.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::S1 => 1,
            Self::S2 => 2,
            Self::S3 => 3,
            Self::S4 => 4,
            Self::S5 => 5,
        }
    }

    /// Human label for the layer.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::S1 => "operations",
            Self::S2 => "coordination",
            Self::S3 => "control",
            Self::S4 => "intelligence",
            Self::S5 => "policy",
        }
    }

    /// Short routing prefix: `s1`..`s5`.
    #[must_use]
    pub const fn routing_prefix(self) -> &'static str {
        match self {
            Self::S1 => "s1",
            Self::S2 => "s2",
            Self::S3 => "s3",
            Self::S4 => "s4",
            Self::S5 => "s5",
        }
    }

    /// The per-system topic exchange: `cyb.vsm.s1`..`cyb.vsm.s5`.
    #[must_use]
    pub const fn exchange(self) -> &'static str {
        match self {
            Self::S1 => "cyb.vsm.s1",
            Self::S2 => "cyb.vsm.s2",
            Self::S3 => "cyb.vsm.s3",
            Self::S4 => "cyb.vsm.s4",
            Self::S5 => "cyb.vsm.s5",
        }
    }

    /// The durable work queue for this system, e.g. `vsm.system2.coordination`.
    #[must_use]
    pub fn queue_name(self) -> String {
        format!("vsm.system{}.{}", self.number(), self.label())
    }

    /// Classify a dot-segmented routing key by its leading segment.
    ///
    /// `s4.intelligence.analyze` and `vsm.s4.analyze` both resolve to S4.
    #[must_use]
    pub fn classify(routing_key: &str) -> Option<Self> {
        let mut segments = routing_key.split('.');
        let first = segments.next()?;
        let prefix = if first == "vsm" { segments.next()? } else { first };
        match prefix {
            "s1" | "system1" => Some(Self::S1),
            "s2" | "system2" => Some(Self::S2),
            "s3" | "system3" => Some(Self::S3),
            "s4" | "system4" => Some(Self::S4),
            "s5" | "system5" => Some(Self::S5),
            _ => None,
        }
    }
}

impl fmt::Display for VsmSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.routing_prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_hex_round_trip() {
        let id = MessageId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(MessageId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_message_id_rejects_short_hex() {
        assert!(MessageId::from_hex("abcd").is_err());
        assert!(MessageId::from_hex("not hex at all!").is_err());
    }

    #[test]
    fn test_message_id_serde() {
        let id = MessageId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_tenant_id_validation() {
        assert!(TenantId::parse("acme-corp_01").is_ok());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("bad tenant").is_err());
        assert!(TenantId::parse("tenant/../../etc").is_err());
        assert!(TenantId::parse(&"x".repeat(128)).is_ok());
        assert!(TenantId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_site_id_strips_separator() {
        let site = SiteId::new("node|a");
        assert_eq!(site.as_str(), "nodea");
        assert_eq!(SiteId::new("||").as_str(), "node");
    }

    #[test]
    fn test_priority_costs() {
        assert_eq!(Priority::Critical.token_cost(), 1);
        assert_eq!(Priority::High.token_cost(), 1);
        assert_eq!(Priority::Normal.token_cost(), 2);
        assert_eq!(Priority::Low.token_cost(), 4);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_vsm_naming() {
        assert_eq!(VsmSystem::S2.queue_name(), "vsm.system2.coordination");
        assert_eq!(VsmSystem::S4.exchange(), "cyb.vsm.s4");
        assert_eq!(VsmSystem::S5.label(), "policy");
    }

    #[test]
    fn test_vsm_classify() {
        assert_eq!(
            VsmSystem::classify("s4.intelligence.analyze"),
            Some(VsmSystem::S4)
        );
        assert_eq!(VsmSystem::classify("vsm.s1.echo"), Some(VsmSystem::S1));
        assert_eq!(VsmSystem::classify("telemetry.metrics"), None);
        assert_eq!(VsmSystem::classify(""), None);
    }
}
