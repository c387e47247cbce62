//! Cyb Bus - The durable topic bus of the Cybernetic control plane.
//!
//! This crate provides:
//! - AMQP-style topic/direct/fanout [`pattern`] matching
//! - The [`Topology`] declared idempotently at startup (exchanges, per-system
//!   queues, dead-letter fanout, TTL retry queue, bindings)
//! - A single-owner [`Broker`] task with per-queue TTL, prefetch-bounded
//!   consumer channels, ack/nack, and dead-letter routing
//! - A [`Publisher`] that signs every envelope and blocks on broker confirms
//!   with a bounded timeout and retry
//! - A [`Consumer`] that decodes, verifies (clock skew, replay, HMAC),
//!   dispatches by message type through a static [`DispatchTable`], and
//!   routes failures through the retry/failed queues
//!
//! The broker is in-process: every client goes through [`BrokerHandle`]
//! request/response messages, so a network-backed broker can replace it
//! behind the same surface.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod broker;
mod consumer;
mod dispatch;
mod error;
pub mod pattern;
mod publisher;
mod topology;

pub use broker::{Broker, BrokerConfig, BrokerHandle, Delivery};
pub use consumer::{Consumer, ConsumerConfig};
pub use dispatch::{DispatchTable, MessageHandler};
pub use error::{BusError, HandlerError};
pub use publisher::{PublishOptions, Publisher, PublisherConfig};
pub use topology::{BindingDecl, ExchangeDecl, ExchangeKind, QueueDecl, Topology, exchanges, queues};
