//! The deterministic policy evaluator.
//!
//! Evaluation is pure: the same policy and context always produce the same
//! decision. Recursion depth is bounded and a wall-clock deadline is
//! checked at every condition node; both bounds surface as errors rather
//! than partial decisions.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::ast::{CompareOp, Condition, Path, PathRoot, Policy, RuleVerb, Value};
use crate::error::PolicyError;

/// The final decision for one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allow,
    /// The request is refused.
    Deny,
}

/// The documents a policy evaluates against.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Caller context document.
    pub context: serde_json::Value,
    /// Resource document.
    pub resource: serde_json::Value,
    /// Action document.
    pub action: serde_json::Value,
    /// Environment document.
    pub environment: serde_json::Value,
    /// Roles held by the caller.
    pub roles: HashSet<String>,
}

impl EvalContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the context document.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Set the resource document.
    #[must_use]
    pub fn with_resource(mut self, resource: serde_json::Value) -> Self {
        self.resource = resource;
        self
    }

    /// Set the action document.
    #[must_use]
    pub fn with_action(mut self, action: serde_json::Value) -> Self {
        self.action = action;
        self
    }

    /// Set the environment document.
    #[must_use]
    pub fn with_environment(mut self, environment: serde_json::Value) -> Self {
        self.environment = environment;
        self
    }

    /// Add a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    fn document(&self, root: PathRoot) -> &serde_json::Value {
        match root {
            PathRoot::Context => &self.context,
            PathRoot::Resource => &self.resource,
            PathRoot::Action => &self.action,
            PathRoot::Environment => &self.environment,
        }
    }

    fn resolve(&self, path: &Path) -> &serde_json::Value {
        let mut current = self.document(path.root);
        for segment in &path.segments {
            current = current.get(segment).unwrap_or(&serde_json::Value::Null);
        }
        current
    }
}

/// Bounded, deadline-checked interpreter.
#[derive(Debug, Clone)]
pub struct Evaluator {
    /// Maximum condition recursion depth.
    pub max_depth: usize,
    /// Wall-clock budget per evaluation.
    pub timeout: Duration,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self {
            max_depth: 100,
            timeout: Duration::from_millis(100),
        }
    }
}

impl Evaluator {
    /// Evaluate a policy's rules in order.
    ///
    /// # Errors
    ///
    /// [`PolicyError::RecursionLimit`] when a condition nests beyond
    /// `max_depth`; [`PolicyError::EvaluationTimeout`] when the wall-clock
    /// budget is exhausted.
    pub fn evaluate(&self, policy: &Policy, ctx: &EvalContext) -> Result<Decision, PolicyError> {
        let deadline = Instant::now() + self.timeout;
        for rule in &policy.rules {
            let holds = self.condition(&rule.condition, ctx, 0, deadline)?;
            match rule.verb {
                RuleVerb::Require => {
                    if !holds {
                        return Ok(Decision::Deny);
                    }
                },
                RuleVerb::Allow => {
                    if holds {
                        return Ok(Decision::Allow);
                    }
                },
                RuleVerb::Deny => {
                    if holds {
                        return Ok(Decision::Deny);
                    }
                },
            }
        }
        Ok(Decision::Deny)
    }

    fn condition(
        &self,
        condition: &Condition,
        ctx: &EvalContext,
        depth: usize,
        deadline: Instant,
    ) -> Result<bool, PolicyError> {
        if depth > self.max_depth {
            return Err(PolicyError::RecursionLimit { depth });
        }
        let now = Instant::now();
        if now > deadline {
            let over = now.duration_since(deadline);
            return Err(PolicyError::EvaluationTimeout {
                elapsed_ms: u64::try_from(self.timeout.as_millis().saturating_add(over.as_millis()))
                    .unwrap_or(u64::MAX),
            });
        }

        let next = depth.saturating_add(1);
        Ok(match condition {
            Condition::True => true,
            Condition::Flag(name) => {
                truthy(ctx.context.get(name).unwrap_or(&serde_json::Value::Null))
                    || ctx.roles.contains(name)
            },
            Condition::Role(name) => ctx.roles.contains(name),
            Condition::Present(path) => !ctx.resolve(path).is_null(),
            Condition::Blank(path) => is_blank(ctx.resolve(path)),
            Condition::Compare { path, op, value } => compare(ctx.resolve(path), *op, value),
            Condition::In { path, values } => {
                let candidate = ctx.resolve(path);
                values.iter().any(|v| value_eq(candidate, v))
            },
            Condition::And(terms) => {
                for term in terms {
                    if !self.condition(term, ctx, next, deadline)? {
                        return Ok(false);
                    }
                }
                true
            },
            Condition::Or(terms) => {
                for term in terms {
                    if self.condition(term, ctx, next, deadline)? {
                        return Ok(true);
                    }
                }
                false
            },
            Condition::Not(inner) => !self.condition(inner, ctx, next, deadline)?,
        })
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(_) => true,
        serde_json::Value::Null => false,
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn value_eq(actual: &serde_json::Value, expected: &Value) -> bool {
    match expected {
        Value::String(s) => actual.as_str() == Some(s.as_str()),
        Value::Number(n) => actual.as_f64() == Some(*n),
        Value::Bool(b) => actual.as_bool() == Some(*b),
    }
}

fn compare(actual: &serde_json::Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => value_eq(actual, expected),
        CompareOp::Neq => !value_eq(actual, expected),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let ordering = match expected {
                Value::Number(n) => actual.as_f64().and_then(|a| a.partial_cmp(n)),
                Value::String(s) => actual.as_str().map(|a| a.cmp(s.as_str())),
                Value::Bool(_) => None,
            };
            ordering.is_some_and(|ordering| match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Gte => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Lte => ordering.is_le(),
                CompareOp::Eq | CompareOp::Neq => false,
            })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_rules;
    use serde_json::json;

    fn policy(source: &str) -> Policy {
        Policy {
            id: "test".to_string(),
            version: 1,
            rules: parse_rules(source).unwrap(),
            source: source.to_string(),
        }
    }

    fn eval(source: &str, ctx: &EvalContext) -> Decision {
        Evaluator::default().evaluate(&policy(source), ctx).unwrap()
    }

    #[test]
    fn test_require_then_allow() {
        let source = "require :authenticated\nallow";
        let authed = EvalContext::new().with_context(json!({"authenticated": true}));
        assert_eq!(eval(source, &authed), Decision::Allow);

        let anon = EvalContext::new();
        assert_eq!(eval(source, &anon), Decision::Deny);
    }

    #[test]
    fn test_empty_rule_list_denies() {
        let p = Policy {
            id: "empty".to_string(),
            version: 1,
            rules: Vec::new(),
            source: String::new(),
        };
        assert_eq!(
            Evaluator::default().evaluate(&p, &EvalContext::new()).unwrap(),
            Decision::Deny
        );
    }

    #[test]
    fn test_deny_rule_short_circuits() {
        let source = "deny context.banned == true\nallow";
        let banned = EvalContext::new().with_context(json!({"banned": true}));
        assert_eq!(eval(source, &banned), Decision::Deny);

        let clean = EvalContext::new().with_context(json!({"banned": false}));
        assert_eq!(eval(source, &clean), Decision::Allow);
    }

    #[test]
    fn test_in_operator_and_roles() {
        let source = "allow context.role in [\"admin\", \"operator\"]\ndeny";
        let admin = EvalContext::new().with_context(json!({"role": "admin"}));
        assert_eq!(eval(source, &admin), Decision::Allow);

        let guest = EvalContext::new().with_context(json!({"role": "guest"}));
        assert_eq!(eval(source, &guest), Decision::Deny);

        let source = "allow role(\"admin\")\ndeny";
        let role_holder = EvalContext::new().with_role("admin");
        assert_eq!(eval(source, &role_holder), Decision::Allow);
    }

    #[test]
    fn test_numeric_ordering() {
        let source = "deny environment.load > 0.9\nallow";
        let hot = EvalContext::new().with_environment(json!({"load": 0.95}));
        assert_eq!(eval(source, &hot), Decision::Deny);

        let cool = EvalContext::new().with_environment(json!({"load": 0.5}));
        assert_eq!(eval(source, &cool), Decision::Allow);

        // Missing path never satisfies an ordering comparison.
        let missing = EvalContext::new();
        assert_eq!(eval(source, &missing), Decision::Allow);
    }

    #[test]
    fn test_present_and_blank() {
        let source = "require present(resource.id)\nrequire blank(resource.lock)\nallow";
        let good = EvalContext::new().with_resource(json!({"id": "r1"}));
        assert_eq!(eval(source, &good), Decision::Allow);

        let locked = EvalContext::new().with_resource(json!({"id": "r1", "lock": "held"}));
        assert_eq!(eval(source, &locked), Decision::Deny);
    }

    #[test]
    fn test_determinism() {
        let source = "allow context.n >= 3 and not (context.m == 1)\ndeny";
        let ctx = EvalContext::new().with_context(json!({"n": 5, "m": 2}));
        let first = eval(source, &ctx);
        for _ in 0..10 {
            assert_eq!(eval(source, &ctx), first);
        }
    }

    #[test]
    fn test_recursion_boundary() {
        // Depth max_depth succeeds; max_depth + 1 errors.
        let evaluator = Evaluator {
            max_depth: 10,
            timeout: Duration::from_secs(1),
        };
        let nest = |n: usize| {
            let mut condition = Condition::True;
            for _ in 0..n {
                condition = Condition::Not(Box::new(condition));
            }
            Policy {
                id: "nest".to_string(),
                version: 1,
                rules: vec![crate::ast::Rule {
                    verb: RuleVerb::Allow,
                    condition,
                }],
                source: String::new(),
            }
        };

        assert!(evaluator.evaluate(&nest(10), &EvalContext::new()).is_ok());
        let err = evaluator.evaluate(&nest(11), &EvalContext::new()).unwrap_err();
        assert_eq!(err.kind(), "recursion_limit");
    }

    #[test]
    fn test_timeout_surfaced() {
        let evaluator = Evaluator {
            max_depth: 100,
            timeout: Duration::ZERO,
        };
        let p = policy("allow :anything\ndeny");
        // A zero budget trips on the first condition node.
        std::thread::sleep(Duration::from_millis(2));
        let err = evaluator.evaluate(&p, &EvalContext::new()).unwrap_err();
        assert_eq!(err.kind(), "evaluation_timeout");
    }
}
