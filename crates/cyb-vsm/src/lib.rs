//! Cyb VSM - The five logical subsystems and their routing.
//!
//! This crate provides:
//! - Message documents exchanged between systems
//! - The per-system handlers: S1 operations, S2 coordination (fair-share),
//!   S3 control (limiter + breakers), S4 intelligence (pluggable provider),
//!   S5 policy (registry + identity metadata)
//! - [`build_dispatch`], the static dispatch table registered at startup
//! - [`VsmNode`], which spawns one verified consumer per system queue
//!
//! Cross-system messages always traverse the bus; no handler calls another
//! system in-process, so every hop is signed and replay-protected.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod messages;
mod provider;
mod router;
mod systems;

pub use messages::{CoordinationRequest, HealthReport, PolicyCheckRequest, RateLimitCommand};
pub use provider::{AnalysisOutcome, AnalysisProvider, EchoProvider, ProviderError};
pub use router::{VsmDeps, VsmNode, build_dispatch, message_types};
pub use systems::{DirectiveHandler, S1Handler, S2Handler, S3Handler, S4Handler, S5Handler};
