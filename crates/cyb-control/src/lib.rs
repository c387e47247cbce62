//! Cyb Control - The S3/S2 control primitives of the Cybernetic plane.
//!
//! This crate provides:
//! - A priority-weighted token-bucket [`RateLimiter`] with per-key
//!   serialization
//! - The adaptive [`CircuitBreaker`] (closed/open/half-open, health-score
//!   feedback, EMA-tuned threshold) and its name [`BreakerRegistry`]
//! - The [`FairShareCoordinator`]: per-topic concurrency slots proportional
//!   to priority, with aging so nothing starves
//!
//! All three are consulted inline on hot paths; critical sections are short
//! and never held across await points.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod breaker;
mod coordinator;
mod limiter;

pub use breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, CallError, CircuitBreaker, CircuitState,
};
pub use coordinator::{Backpressure, CoordinatorConfig, FairShareCoordinator, SlotPermit};
pub use limiter::{RateLimitDecision, RateLimiter, TokenBucketConfig};
