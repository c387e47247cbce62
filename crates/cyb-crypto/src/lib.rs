//! Cyb Crypto - The security envelope for the Cybernetic control plane.
//!
//! This crate provides:
//! - High-entropy [`Nonce`] generation
//! - A [`KeyRing`] with an active signing key and atomic rotation
//! - The envelope codec: [`EnvelopeCodec::enrich`] signs, [`EnvelopeCodec::verify`]
//!   checks presence, clock skew, replay, and the HMAC in constant time
//! - The [`ReplayLedger`]: bloom-assisted nonce ledger with precise TTL
//!   eviction and periodic compaction
//!
//! Verification fails closed: any missing header, stale timestamp, replayed
//! nonce, unknown key, or signature mismatch is a distinct error kind and
//! the message never reaches a handler.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod codec;
mod error;
mod keyring;
mod nonce;
mod replay;

pub use codec::{EnvelopeCodec, SkewPolicy};
pub use error::{SignError, VerifyError};
pub use keyring::{KeyRing, SecretKey};
pub use nonce::Nonce;
pub use replay::{CompactionStats, ReplayConfig, ReplayLedger};
