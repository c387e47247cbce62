//! Cyb Context - The replicated context graph.
//!
//! This crate provides:
//! - Semantic [`Triple`]s with a binary key encoding
//! - The [`GraphReplica`]: an add-wins last-writer-wins map with tombstones
//!   whose merges commute, so any two replicas that exchange all deltas
//!   converge to the same read
//! - [`ContextGraph`]: a single-writer replica task with debounced delta
//!   shipping to registered neighbours
//! - [`GraphNetwork`]: membership-driven neighbour wiring
//! - [`HnswIndex`]: an optional multi-layer ANN index for semantic lookup
//!   over triple embeddings
//!
//! Consistency is eventual only; readers see the local snapshot, stale by
//! at most the ship interval.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod index;
mod replica;
mod sync;
mod triple;

pub use index::{HnswConfig, HnswIndex};
pub use replica::{Delta, Entry, GraphReplica, WriteTag};
pub use sync::{ContextGraph, GraphNetwork, Membership, MembershipEvent, StaticMembership, SyncConfig};
pub use triple::{Triple, TripleMeta, TripleValue};
