//! Cyb Core - Foundation types for the Cybernetic control plane.
//!
//! This crate provides:
//! - The canonical message [`Envelope`] passed over the bus
//! - [`Episode`], the unit of work handed across the VSM layers
//! - Identifier newtypes (message, correlation, tenant, site)
//! - Priority classes with token-bucket weights
//! - The [`VsmSystem`] enumeration and its naming conventions
//! - Jittered exponential [`Backoff`] for reconnects and recovery timers
//!
//! Everything here is plain data: no I/O, no runtime. Components in the
//! other crates own the behavior; this crate owns the vocabulary they share.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod backoff;
mod envelope;
mod episode;
mod types;

pub use backoff::Backoff;
pub use envelope::{
    CONTENT_TYPE_JSON, Envelope, EnvelopeBuilder, EnvelopeHeaders, SecurityHeaders,
};
pub use episode::{Episode, EpisodeKind};
pub use types::{
    CorrelationId, MessageId, Priority, SiteId, TenantId, TenantIdError, VsmSystem, now_ms,
};
