//! Cyb Policy - The S5 policy pipeline.
//!
//! This crate provides:
//! - The rule [`ast`]: ordered `require`/`allow`/`deny` rules over boolean
//!   conditions on `context`/`resource`/`action`/`environment` paths
//! - A hand-rolled lexer and recursive-descent [`parse`]r for the DSL
//! - A deterministic, pure [`Evaluator`] with bounded recursion depth and a
//!   wall-clock deadline
//! - The versioned [`PolicyRegistry`] with zero-downtime rollback
//!
//! # Rule Semantics
//!
//! Rules run in order: `require c` denies when `c` is false, `allow c`
//! allows when `c` is true, `deny c` denies when `c` is true; anything else
//! falls through. An exhausted rule list denies.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod ast;
mod error;
mod eval;
mod parse;
mod registry;

pub use ast::{CompareOp, Condition, Path, PathRoot, Policy, Rule, RuleVerb, Value};
pub use error::PolicyError;
pub use eval::{Decision, EvalContext, Evaluator};
pub use parse::parse_rules;
pub use registry::PolicyRegistry;
