//! Cyb Config - Configuration for the Cybernetic control plane.
//!
//! This crate provides:
//! - The typed [`Config`] tree with serde defaults (TOML-loadable)
//! - Environment loading through a testable variable provider
//! - Production boot validation: the daemon refuses to start without its
//!   required secrets (fail-closed in production, permissive in dev)
//!
//! Components never read the process environment themselves; everything
//! arrives through a [`Config`] handed in at construction.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod env;
mod types;
mod validate;

pub use env::{ENV_VARS, from_env, from_env_with};
pub use types::{
    BreakerSettings, BusSettings, Config, ContextSettings, CoordinatorSettings, Environment,
    GatewaySettings, LimiterSettings, PolicySettings, SecretString, SecuritySettings,
};
pub use validate::{ConfigError, validate};
