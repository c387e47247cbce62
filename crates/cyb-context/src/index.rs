//! Multi-layer ANN index for semantic lookup over triple embeddings.
//!
//! A native hierarchical navigable small-world graph: each element gets a
//! geometrically sampled top level; search greedily descends the upper
//! layers and runs a beam search (`ef`) at the bottom. Distance is cosine.

use rand::Rng;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::trace;

/// Index construction and search parameters.
#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    /// Neighbours kept per node per layer (level 0 keeps `2 * m`).
    pub m: usize,
    /// Beam width while building.
    pub ef_construction: usize,
    /// Beam width while searching.
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
            ef_search: 50,
        }
    }
}

struct Node {
    id: String,
    vector: Vec<f32>,
    /// `neighbors[level]` holds the adjacency at that level.
    neighbors: Vec<Vec<usize>>,
}

/// Distance-ordered candidate for the search heaps.
#[derive(PartialEq)]
struct Candidate {
    dist: f32,
    idx: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The index. Inserting an existing id replaces its vector in place.
pub struct HnswIndex {
    config: HnswConfig,
    nodes: Vec<Node>,
    by_id: HashMap<String, usize>,
    entry_point: Option<usize>,
    level_mult: f64,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("len", &self.nodes.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HnswIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new(config: HnswConfig) -> Self {
        let level_mult = 1.0 / (config.m.max(2) as f64).ln();
        Self {
            config,
            nodes: Vec::new(),
            by_id: HashMap::new(),
            entry_point: None,
            level_mult,
        }
    }

    /// Number of indexed elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert an embedding under `id`.
    #[allow(clippy::missing_panics_doc)]
    pub fn insert(&mut self, id: impl Into<String>, vector: Vec<f32>) {
        let id = id.into();
        if let Some(&existing) = self.by_id.get(&id) {
            self.nodes[existing].vector = vector;
            return;
        }

        let level = self.random_level();
        let idx = self.nodes.len();
        self.nodes.push(Node {
            id: id.clone(),
            vector,
            neighbors: vec![Vec::new(); level.saturating_add(1)],
        });
        self.by_id.insert(id, idx);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(idx);
            return;
        };

        let entry_level = self.nodes[entry].neighbors.len().saturating_sub(1);
        let mut current = entry;

        // Greedy descent through the layers above the new node's level.
        let mut layer = entry_level;
        while layer > level {
            current = self.greedy_step(idx, current, layer);
            layer = layer.saturating_sub(1);
        }

        // Beam search and bidirectional linking on the shared layers.
        let top = level.min(entry_level);
        for layer in (0..=top).rev() {
            let found =
                self.search_layer(&self.nodes[idx].vector, current, self.config.ef_construction, layer);
            if let Some(best) = found.first() {
                current = best.idx;
            }
            let max_links = self.max_links(layer);
            let selected: Vec<usize> =
                found.iter().take(self.config.m).map(|c| c.idx).collect();
            for &neighbor in &selected {
                self.nodes[idx].neighbors[layer].push(neighbor);
                self.nodes[neighbor].neighbors[layer].push(idx);
                self.prune(neighbor, layer, max_links);
            }
        }

        if level > entry_level {
            self.entry_point = Some(idx);
        }
        trace!(len = self.nodes.len(), level, "hnsw insert");
    }

    /// The `k` nearest ids with cosine distances, closest first.
    #[must_use]
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        let entry_level = self.nodes[entry].neighbors.len().saturating_sub(1);
        let mut current = entry;
        for layer in (1..=entry_level).rev() {
            current = self.greedy_step_query(query, current, layer);
        }
        let ef = self.config.ef_search.max(k);
        let mut found = self.search_layer(query, current, ef, 0);
        found.truncate(k);
        found
            .into_iter()
            .map(|c| (self.nodes[c.idx].id.clone(), c.dist))
            .collect()
    }

    fn random_level(&self) -> usize {
        let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let level = (-u.ln() * self.level_mult) as usize;
        level.min(32)
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m.saturating_mul(2)
        } else {
            self.config.m
        }
    }

    fn greedy_step(&self, target: usize, start: usize, layer: usize) -> usize {
        let vector = self.nodes[target].vector.clone();
        self.greedy_step_query(&vector, start, layer)
    }

    fn greedy_step_query(&self, query: &[f32], start: usize, layer: usize) -> usize {
        let mut current = start;
        let mut best = cosine_distance(query, &self.nodes[current].vector);
        loop {
            let mut improved = false;
            let neighbors = self.nodes[current]
                .neighbors
                .get(layer)
                .cloned()
                .unwrap_or_default();
            for neighbor in neighbors {
                let dist = cosine_distance(query, &self.nodes[neighbor].vector);
                if dist < best {
                    best = dist;
                    current = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer; results sorted closest first.
    fn search_layer(&self, query: &[f32], entry: usize, ef: usize, layer: usize) -> Vec<Candidate> {
        let mut visited: HashSet<usize> = HashSet::from([entry]);
        let entry_dist = cosine_distance(query, &self.nodes[entry].vector);

        // Min-heap of frontiers, max-heap of current results.
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        frontier.push(Reverse(Candidate {
            dist: entry_dist,
            idx: entry,
        }));
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        results.push(Candidate {
            dist: entry_dist,
            idx: entry,
        });

        while let Some(Reverse(candidate)) = frontier.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |c| c.dist);
            if candidate.dist > worst && results.len() >= ef {
                break;
            }
            let neighbors = self.nodes[candidate.idx]
                .neighbors
                .get(layer)
                .cloned()
                .unwrap_or_default();
            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = cosine_distance(query, &self.nodes[neighbor].vector);
                let worst = results.peek().map_or(f32::INFINITY, |c| c.dist);
                if results.len() < ef || dist < worst {
                    frontier.push(Reverse(Candidate { dist, idx: neighbor }));
                    results.push(Candidate { dist, idx: neighbor });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut sorted = results.into_vec();
        sorted.sort();
        sorted
    }

    /// Keep only the closest `max_links` neighbours of `node` at `layer`.
    fn prune(&mut self, node: usize, layer: usize, max_links: usize) {
        if self.nodes[node].neighbors[layer].len() <= max_links {
            return;
        }
        let vector = self.nodes[node].vector.clone();
        let mut scored: Vec<Candidate> = self.nodes[node].neighbors[layer]
            .iter()
            .map(|&n| Candidate {
                dist: cosine_distance(&vector, &self.nodes[n].vector),
                idx: n,
            })
            .collect();
        scored.sort();
        scored.truncate(max_links);
        self.nodes[node].neighbors[layer] = scored.into_iter().map(|c| c.idx).collect();
    }
}

impl Default for HnswIndex {
    fn default() -> Self {
        Self::new(HnswConfig::default())
    }
}

#[allow(clippy::arithmetic_side_effects)]
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_search() {
        let index = HnswIndex::default();
        assert!(index.search(&[1.0, 0.0], 3).is_empty());
    }

    #[test]
    fn test_exact_match_is_first() {
        let mut index = HnswIndex::default();
        index.insert("x", vec![1.0, 0.0, 0.0]);
        index.insert("y", vec![0.0, 1.0, 0.0]);
        index.insert("z", vec![0.0, 0.0, 1.0]);

        let found = index.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(found[0].0, "x");
        assert!(found[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_replacing_existing_id() {
        let mut index = HnswIndex::default();
        index.insert("a", vec![1.0, 0.0]);
        index.insert("a", vec![0.0, 1.0]);
        assert_eq!(index.len(), 1);

        let found = index.search(&[0.0, 1.0], 1);
        assert!(found[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_recall_on_known_vectors() {
        let mut index = HnswIndex::new(HnswConfig {
            m: 8,
            ef_construction: 64,
            ef_search: 64,
        });
        let mut rng = rand::thread_rng();
        let vectors: Vec<Vec<f32>> = (0..100)
            .map(|_| (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();
        for (i, v) in vectors.iter().enumerate() {
            index.insert(format!("v{i}"), v.clone());
        }

        // Querying an indexed vector must return it first.
        for probe in [0usize, 17, 42, 99] {
            let found = index.search(&vectors[probe], 3);
            assert_eq!(found[0].0, format!("v{probe}"), "missed probe {probe}");
            assert!(found[0].1.abs() < 1e-5);
        }
    }

    #[test]
    fn test_k_bounds_results() {
        let mut index = HnswIndex::default();
        for i in 0..10 {
            index.insert(format!("v{i}"), vec![i as f32, 1.0]);
        }
        assert_eq!(index.search(&[5.0, 1.0], 4).len(), 4);
        assert_eq!(index.search(&[5.0, 1.0], 100).len(), 10);
    }
}
