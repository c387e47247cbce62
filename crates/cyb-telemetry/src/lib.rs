//! Cyb Telemetry - Logging and boundary counters for the control plane.
//!
//! This crate provides:
//! - Configurable logging setup over the tracing ecosystem
//! - A process-wide counter registry for boundary events (replay rejections,
//!   schedule/pressure decisions, breaker transitions, skew checks)
//! - Text exposition of the counters for the `/metrics` endpoint
//!
//! Components emit structured `tracing` events at every boundary and bump a
//! named counter; the gateway renders the registry on scrape.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod counters;
mod error;
mod logging;

pub use counters::{Counters, global_counters};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
