//! The policy rule AST.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a rule does when its condition fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleVerb {
    /// Deny unless the condition holds.
    Require,
    /// Allow when the condition holds.
    Allow,
    /// Deny when the condition holds.
    Deny,
}

/// The four addressable evaluation documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathRoot {
    /// The caller's context document.
    Context,
    /// The resource being accessed.
    Resource,
    /// The action being taken.
    Action,
    /// Ambient environment facts.
    Environment,
}

/// A dotted path into one of the evaluation documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    /// Which document the path starts in.
    pub root: PathRoot,
    /// Remaining dotted segments.
    pub segments: Vec<String>,
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = match self.root {
            PathRoot::Context => "context",
            PathRoot::Resource => "resource",
            PathRoot::Action => "action",
            PathRoot::Environment => "environment",
        };
        write!(f, "{root}")?;
        for segment in &self.segments {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// A literal in a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// String literal.
    String(String),
    /// Numeric literal.
    Number(f64),
    /// Boolean literal.
    Bool(bool),
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Greater than.
    Gt,
    /// Greater or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less or equal.
    Lte,
}

/// A boolean condition over the evaluation documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Always true (bare `allow` / `deny`).
    True,
    /// `:name` — a truthy context flag or a held role.
    Flag(String),
    /// `role("admin")` — an explicit role check.
    Role(String),
    /// `present(path)` — the path resolves to a non-null value.
    Present(Path),
    /// `blank(path)` — missing, null, empty string, or empty array.
    Blank(Path),
    /// `path op literal`.
    Compare {
        /// Path to the left operand.
        path: Path,
        /// Operator.
        op: CompareOp,
        /// Right operand.
        value: Value,
    },
    /// `path in [v1, v2, ...]`.
    In {
        /// Path to the candidate value.
        path: Path,
        /// Accepted literals.
        values: Vec<Value>,
    },
    /// All sub-conditions hold.
    And(Vec<Condition>),
    /// Any sub-condition holds.
    Or(Vec<Condition>),
    /// The sub-condition does not hold.
    Not(Box<Condition>),
}

/// One ordered rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// What to do when the condition fires.
    pub verb: RuleVerb,
    /// When the rule fires.
    pub condition: Condition,
}

/// A registered policy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Registry id.
    pub id: String,
    /// Monotonic version within the id.
    pub version: u32,
    /// Ordered rules.
    pub rules: Vec<Rule>,
    /// Original DSL text.
    pub source: String,
}
