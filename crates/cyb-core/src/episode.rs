//! Episodes: the unit of cross-layer analytic work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Priority, VsmSystem};

/// Discriminator for what kind of work an episode represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    /// Day-to-day operational work (S1).
    Operation,
    /// Cross-system coordination (S2).
    Coordination,
    /// Resource and control decisions (S3).
    Control,
    /// Analysis requests handled by a provider (S4).
    Analysis,
    /// Policy and identity work (S5).
    Policy,
    /// High-priority alert traffic.
    Alert,
}

/// Unit of work handed across S1-S5.
///
/// Episodes are identified and typed so any layer can reason about them
/// without knowing which layer minted them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Unique episode identifier.
    pub id: uuid::Uuid,
    /// What kind of work this is.
    pub kind: EpisodeKind,
    /// Short human title.
    pub title: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Which system minted the episode.
    pub source_system: VsmSystem,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Caller-supplied context document.
    #[serde(default)]
    pub context: serde_json::Value,
    /// The work itself.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Free-form string metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Episode {
    /// Create an episode with defaults for the optional documents.
    #[must_use]
    pub fn new(kind: EpisodeKind, title: impl Into<String>, source_system: VsmSystem) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            kind,
            title: title.into(),
            priority: Priority::Normal,
            source_system,
            created_at: Utc::now(),
            context: serde_json::Value::Null,
            data: serde_json::Value::Null,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach the work document.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach the context document.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Add one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_defaults() {
        let episode = Episode::new(EpisodeKind::Analysis, "inspect logs", VsmSystem::S1);
        assert_eq!(episode.priority, Priority::Normal);
        assert_eq!(episode.source_system, VsmSystem::S1);
        assert!(episode.data.is_null());
    }

    #[test]
    fn test_episode_serde_round_trip() {
        let episode = Episode::new(EpisodeKind::Operation, "ping", VsmSystem::S1)
            .with_priority(Priority::High)
            .with_data(serde_json::json!({"op": "ping"}))
            .with_metadata("origin", "test");
        let json = serde_json::to_string(&episode).unwrap();
        let back: Episode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, episode);
        assert_eq!(back.metadata.get("origin").map(String::as_str), Some("test"));
    }

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&EpisodeKind::Analysis).unwrap();
        assert_eq!(json, "\"analysis\"");
    }
}
