//! The add-wins last-writer-wins replica map.
//!
//! Every mutation produces a [`Delta`] carrying a [`WriteTag`]; merges keep
//! the entry with the higher `(timestamp_ms, site)` tag. Removes are
//! tombstones: they supersede older puts and are superseded by newer ones.
//! On an exact tag tie a put wins over a tombstone (add-wins). Merge is
//! idempotent and commutative, which is what makes delta exchange converge.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use cyb_core::{SiteId, now_ms};

use crate::triple::{Triple, TripleMeta, TripleValue};

/// Total write order: `(timestamp_ms, site)` lexicographic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteTag {
    /// Write timestamp.
    pub timestamp_ms: u64,
    /// Writing site (tie-break).
    pub site: String,
}

/// One replicated map slot: a live value or a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The write that produced this slot.
    pub tag: WriteTag,
    /// `None` marks a remove.
    pub value: Option<TripleValue>,
}

/// A shippable mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Replica key of the affected triple.
    pub key: Vec<u8>,
    /// The new slot content.
    pub entry: Entry,
}

/// One node's copy of the context graph.
#[derive(Debug)]
pub struct GraphReplica {
    site: SiteId,
    entries: HashMap<Vec<u8>, Entry>,
    pending: Vec<Delta>,
}

impl GraphReplica {
    /// Create an empty replica for this site.
    #[must_use]
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            entries: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// This replica's site.
    #[must_use]
    pub fn site(&self) -> &SiteId {
        &self.site
    }

    /// Record a triple with the current wall clock.
    pub fn put_triple(
        &mut self,
        triple: Triple,
        fields: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Delta {
        self.put_triple_at(triple, fields, now_ms())
    }

    /// Record a triple at an explicit timestamp (backfill and tests).
    pub fn put_triple_at(
        &mut self,
        triple: Triple,
        fields: std::collections::BTreeMap<String, serde_json::Value>,
        timestamp_ms: u64,
    ) -> Delta {
        let key = triple.key();
        let entry = Entry {
            tag: WriteTag {
                timestamp_ms,
                site: self.site.as_str().to_string(),
            },
            value: Some(TripleValue {
                meta: TripleMeta {
                    timestamp_ms,
                    site: self.site.as_str().to_string(),
                    fields,
                },
                triple,
            }),
        };
        let delta = Delta { key, entry };
        self.apply(delta.clone());
        self.pending.push(delta.clone());
        delta
    }

    /// Record a remove (tombstone) for the triple.
    pub fn remove_triple(&mut self, triple: &Triple) -> Delta {
        let delta = Delta {
            key: triple.key(),
            entry: Entry {
                tag: WriteTag {
                    timestamp_ms: now_ms(),
                    site: self.site.as_str().to_string(),
                },
                value: None,
            },
        };
        self.apply(delta.clone());
        self.pending.push(delta.clone());
        delta
    }

    /// Merge a remote delta. Returns whether it changed local state.
    pub fn merge(&mut self, delta: Delta) -> bool {
        self.apply(delta)
    }

    /// Merge a batch of remote deltas.
    pub fn merge_all(&mut self, deltas: Vec<Delta>) {
        for delta in deltas {
            self.apply(delta);
        }
    }

    fn apply(&mut self, delta: Delta) -> bool {
        match self.entries.get(&delta.key) {
            None => {
                self.entries.insert(delta.key, delta.entry);
                true
            },
            Some(existing) => {
                let wins = delta.entry.tag > existing.tag
                    || (delta.entry.tag == existing.tag
                        && existing.value.is_none()
                        && delta.entry.value.is_some());
                if wins {
                    self.entries.insert(delta.key, delta.entry);
                    true
                } else {
                    false
                }
            },
        }
    }

    /// The current live triples, sorted by key for stable comparison.
    #[must_use]
    pub fn read(&self) -> Vec<TripleValue> {
        let mut live: Vec<(&Vec<u8>, &TripleValue)> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| entry.value.as_ref().map(|value| (key, value)))
            .collect();
        live.sort_by(|a, b| a.0.cmp(b.0));
        live.into_iter().map(|(_, value)| value.clone()).collect()
    }

    /// Look up one triple.
    #[must_use]
    pub fn get(&self, triple: &Triple) -> Option<TripleValue> {
        self.entries
            .get(&triple.key())
            .and_then(|entry| entry.value.clone())
    }

    /// Drain the mutations not yet shipped to neighbours.
    pub fn take_pending(&mut self) -> Vec<Delta> {
        std::mem::take(&mut self.pending)
    }

    /// Whether unshipped mutations exist.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Every entry (including tombstones) as a full-state delta, for
    /// bootstrapping a newly joined neighbour.
    #[must_use]
    pub fn full_state(&self) -> Vec<Delta> {
        self.entries
            .iter()
            .map(|(key, entry)| Delta {
                key: key.clone(),
                entry: entry.clone(),
            })
            .collect()
    }

    /// Number of live triples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.value.is_some()).count()
    }

    /// Whether no live triples exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn replica(site: &str) -> GraphReplica {
        GraphReplica::new(SiteId::new(site))
    }

    fn fields() -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }

    #[test]
    fn test_put_then_read() {
        let mut a = replica("a");
        a.put_triple(Triple::new("alice", "knows", "bob"), fields());
        let read = a.read();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].triple, Triple::new("alice", "knows", "bob"));
    }

    #[test]
    fn test_concurrent_puts_resolve_by_tag() {
        let mut a = replica("a");
        let mut b = replica("b");
        let triple = Triple::new("alice", "knows", "bob");

        let da = a.put_triple_at(triple.clone(), fields(), 1);
        let db = b.put_triple_at(triple.clone(), fields(), 2);

        a.merge(db);
        b.merge(da);

        assert_eq!(a.read(), b.read());
        assert_eq!(a.get(&triple).unwrap().meta.timestamp_ms, 2);
        assert_eq!(a.get(&triple).unwrap().meta.site, "b");
    }

    #[test]
    fn test_equal_timestamp_breaks_on_site() {
        let mut a = replica("a");
        let mut b = replica("b");
        let triple = Triple::new("x", "is", "y");

        let da = a.put_triple_at(triple.clone(), fields(), 5);
        let db = b.put_triple_at(triple.clone(), fields(), 5);

        a.merge(db);
        b.merge(da);

        // Site "b" sorts above "a" at the same timestamp.
        assert_eq!(a.get(&triple).unwrap().meta.site, "b");
        assert_eq!(a.read(), b.read());
    }

    #[test]
    fn test_remove_supersedes_older_put() {
        let mut a = replica("a");
        let triple = Triple::new("alice", "knows", "bob");
        a.put_triple_at(triple.clone(), fields(), 1);
        a.remove_triple(&triple);
        assert!(a.get(&triple).is_none());
        assert!(a.is_empty());
    }

    #[test]
    fn test_newer_put_supersedes_remove() {
        let mut a = replica("a");
        let mut b = replica("b");
        let triple = Triple::new("alice", "knows", "bob");

        a.put_triple_at(triple.clone(), fields(), 1);
        let tombstone = a.remove_triple(&triple);
        let resurrect = b.put_triple_at(triple.clone(), fields(), now_ms().saturating_add(1000));

        a.merge(resurrect);
        b.merge(tombstone);

        assert_eq!(a.read(), b.read());
        assert!(a.get(&triple).is_some());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = replica("a");
        let mut b = replica("b");
        let delta = a.put_triple_at(Triple::new("s", "p", "o"), fields(), 3);

        assert!(b.merge(delta.clone()));
        assert!(!b.merge(delta.clone()));
        assert!(!b.merge(delta));
        assert_eq!(a.read(), b.read());
    }

    #[test]
    fn test_convergence_under_interleaved_exchange() {
        let mut a = replica("a");
        let mut b = replica("b");

        for i in 0..20u64 {
            a.put_triple_at(Triple::new(format!("s{i}"), "p", "from-a"), fields(), i);
            b.put_triple_at(
                Triple::new(format!("s{}", i % 7), "p", "from-b"),
                fields(),
                i.saturating_add(1),
            );
        }

        let from_a = a.take_pending();
        let from_b = b.take_pending();
        a.merge_all(from_b);
        b.merge_all(from_a);

        assert_eq!(a.read(), b.read());
    }

    #[test]
    fn test_full_state_bootstraps_new_replica() {
        let mut a = replica("a");
        a.put_triple(Triple::new("x", "p", "1"), fields());
        let triple = Triple::new("y", "p", "2");
        a.put_triple(triple.clone(), fields());
        a.remove_triple(&triple);

        let mut c = replica("c");
        c.merge_all(a.full_state());
        assert_eq!(a.read(), c.read());
        // The tombstone travelled too.
        assert!(c.get(&triple).is_none());
    }
}
