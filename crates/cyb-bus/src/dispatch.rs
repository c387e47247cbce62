//! Static message dispatch.
//!
//! Handlers are registered at startup, keyed by exact message type with
//! optional wildcard patterns as fallback. Lookup never touches module
//! names or any other runtime reflection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use cyb_core::Envelope;

use crate::error::HandlerError;
use crate::pattern::TopicPattern;

/// A registered handler for one or more message types.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one verified envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] to trigger the consumer's retry path.
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// The dispatch table built at startup.
#[derive(Default)]
pub struct DispatchTable {
    exact: HashMap<String, Arc<dyn MessageHandler>>,
    patterns: Vec<(TopicPattern, Arc<dyn MessageHandler>)>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field(
                "patterns",
                &self.patterns.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl DispatchTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact message type. Last registration wins.
    #[must_use]
    pub fn on(mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.exact.insert(message_type.into(), handler);
        self
    }

    /// Register a handler for a dot-segmented type pattern (`vsm.s2.*`).
    /// Patterns are tried in registration order after the exact map misses.
    #[must_use]
    pub fn on_pattern(mut self, pattern: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.patterns.push((TopicPattern::parse(pattern), handler));
        self
    }

    /// Resolve the handler for a message type.
    #[must_use]
    pub fn resolve(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        if let Some(handler) = self.exact.get(message_type) {
            return Some(Arc::clone(handler));
        }
        self.patterns
            .iter()
            .find(|(pattern, _)| pattern.matches(message_type))
            .map(|(_, handler)| Arc::clone(handler))
    }

    /// Number of registrations (exact + pattern).
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len().saturating_add(self.patterns.len())
    }

    /// Whether anything is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn envelope(message_type: &str) -> Envelope {
        Envelope::builder("cyb.events", "s1.echo", message_type)
            .source("test")
            .build()
    }

    #[tokio::test]
    async fn test_exact_dispatch() {
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let table = DispatchTable::new().on("vsm.s2.coordinate", Arc::clone(&handler) as _);

        let resolved = table.resolve("vsm.s2.coordinate").unwrap();
        resolved.handle(&envelope("vsm.s2.coordinate")).await.unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);

        assert!(table.resolve("vsm.s2.other").is_none());
    }

    #[test]
    fn test_pattern_fallback() {
        let exact = Arc::new(Counting(AtomicUsize::new(0)));
        let wildcard = Arc::new(Counting(AtomicUsize::new(0)));
        let table = DispatchTable::new()
            .on("vsm.s3.health", Arc::clone(&exact) as _)
            .on_pattern("vsm.s3.*", Arc::clone(&wildcard) as _);

        // Exact wins over the pattern.
        assert!(Arc::ptr_eq(
            &(table.resolve("vsm.s3.health").unwrap()),
            &(exact as Arc<dyn MessageHandler>)
        ));
        // Pattern catches the rest.
        assert!(table.resolve("vsm.s3.ratelimit").is_some());
        assert!(table.resolve("vsm.s4.analyze").is_none());
    }

    #[test]
    fn test_len_and_empty() {
        let table = DispatchTable::new();
        assert!(table.is_empty());
        let table = table.on("a", Arc::new(Counting(AtomicUsize::new(0))) as _);
        assert_eq!(table.len(), 1);
    }
}
