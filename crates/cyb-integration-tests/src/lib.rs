//! Cross-crate scenarios for the Cybernetic control plane.
//!
//! The actual suites live under `tests/`; this crate exists so they can
//! depend on every layer at once.

#![deny(unsafe_code)]
#![deny(clippy::all)]
