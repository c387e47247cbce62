//! The versioned policy registry.
//!
//! Every registration parses, validates, and stores a new monotonic version
//! and makes it active. The active pointer can be moved to any registered
//! version for zero-downtime rollback; evaluation always runs against the
//! active version unless a version is named explicitly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::ast::Policy;
use crate::error::PolicyError;
use crate::eval::{Decision, EvalContext, Evaluator};
use crate::parse::parse_rules;

struct PolicyVersions {
    /// `versions[i]` holds version `i + 1`.
    versions: Vec<Arc<Policy>>,
    active: u32,
}

/// Registry mapping `id -> version -> policy` with an active pointer per id.
pub struct PolicyRegistry {
    evaluator: Evaluator,
    inner: RwLock<HashMap<String, PolicyVersions>>,
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}

impl PolicyRegistry {
    /// Create a registry with the given evaluator bounds.
    #[must_use]
    pub fn new(evaluator: Evaluator) -> Self {
        Self {
            evaluator,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Parse, validate, and store a new version of `id`; the new version
    /// becomes active. Returns the version number.
    ///
    /// # Errors
    ///
    /// [`PolicyError::Parse`] or [`PolicyError::Validation`]; a rejected
    /// registration leaves the registry untouched.
    pub fn register(&self, id: &str, source: &str) -> Result<u32, PolicyError> {
        let rules = parse_rules(source)?;
        if rules.is_empty() {
            return Err(PolicyError::Validation(
                "policy has no rules".to_string(),
            ));
        }

        let mut inner = self.write();
        let entry = inner.entry(id.to_string()).or_insert(PolicyVersions {
            versions: Vec::new(),
            active: 0,
        });
        let version = u32::try_from(entry.versions.len().saturating_add(1))
            .map_err(|_| PolicyError::Validation("version overflow".to_string()))?;
        entry.versions.push(Arc::new(Policy {
            id: id.to_string(),
            version,
            rules,
            source: source.to_string(),
        }));
        entry.active = version;
        info!(policy = id, version, "policy registered");
        Ok(version)
    }

    /// Point `id` at a previously registered version.
    ///
    /// # Errors
    ///
    /// [`PolicyError::UnknownPolicy`] or [`PolicyError::UnknownVersion`].
    pub fn set_active_version(&self, id: &str, version: u32) -> Result<(), PolicyError> {
        let mut inner = self.write();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| PolicyError::UnknownPolicy(id.to_string()))?;
        if version == 0 || version as usize > entry.versions.len() {
            return Err(PolicyError::UnknownVersion {
                id: id.to_string(),
                version,
            });
        }
        entry.active = version;
        info!(policy = id, version, "active version changed");
        Ok(())
    }

    /// The active version of `id`.
    #[must_use]
    pub fn active(&self, id: &str) -> Option<Arc<Policy>> {
        let inner = self.read();
        let entry = inner.get(id)?;
        entry
            .versions
            .get(entry.active.checked_sub(1)? as usize)
            .cloned()
    }

    /// A specific registered version of `id`.
    #[must_use]
    pub fn version(&self, id: &str, version: u32) -> Option<Arc<Policy>> {
        let inner = self.read();
        inner
            .get(id)?
            .versions
            .get(version.checked_sub(1)? as usize)
            .cloned()
    }

    /// Evaluate the active version of `id`.
    ///
    /// # Errors
    ///
    /// [`PolicyError::UnknownPolicy`] plus any evaluator error.
    pub fn evaluate(&self, id: &str, ctx: &EvalContext) -> Result<Decision, PolicyError> {
        let policy = self
            .active(id)
            .ok_or_else(|| PolicyError::UnknownPolicy(id.to_string()))?;
        self.evaluator.evaluate(&policy, ctx)
    }

    /// Evaluate several policies, short-circuiting on the first deny.
    ///
    /// A policy whose evaluation times out counts as a deny. Returns allow
    /// only when every policy allows.
    ///
    /// # Errors
    ///
    /// Propagates unknown-policy and recursion errors.
    pub fn evaluate_all(&self, ids: &[&str], ctx: &EvalContext) -> Result<Decision, PolicyError> {
        for id in ids {
            match self.evaluate(id, ctx) {
                Ok(Decision::Allow) => {},
                Ok(Decision::Deny) => return Ok(Decision::Deny),
                Err(PolicyError::EvaluationTimeout { elapsed_ms }) => {
                    warn!(policy = id, elapsed_ms, "evaluation timed out, treating as deny");
                    return Ok(Decision::Deny);
                },
                Err(e) => return Err(e),
            }
        }
        Ok(Decision::Allow)
    }

    /// Registered ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PolicyVersions>> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PolicyVersions>> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(Evaluator::default())
    }
}
