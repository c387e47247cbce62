//! Semantic triples and their binary key encoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A `(subject, predicate, object)` statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    /// Who or what the statement is about.
    pub subject: String,
    /// The relation.
    pub predicate: String,
    /// The related entity or value.
    pub object: String,
}

impl Triple {
    /// Create a triple.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    /// Binary replica key: three length-prefixed segments, so distinct
    /// triples can never collide regardless of embedded separators.
    #[must_use]
    pub fn key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.subject
                .len()
                .saturating_add(self.predicate.len())
                .saturating_add(self.object.len())
                .saturating_add(12),
        );
        for segment in [&self.subject, &self.predicate, &self.object] {
            let len = u32::try_from(segment.len()).unwrap_or(u32::MAX);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(segment.as_bytes());
        }
        out
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.subject, self.predicate, self.object)
    }
}

/// Write metadata attached to a stored triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleMeta {
    /// Write wall-clock timestamp.
    pub timestamp_ms: u64,
    /// Writing site.
    pub site: String,
    /// Free-form user fields.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// A stored triple with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleValue {
    /// The statement.
    pub triple: Triple,
    /// Its write metadata.
    pub meta: TripleMeta,
}
