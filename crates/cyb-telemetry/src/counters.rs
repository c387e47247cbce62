//! Named monotonic counters for boundary events.

use dashmap::DashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// A registry of named monotonic counters.
///
/// Names follow `component_event` convention (`replay_rejected`,
/// `coordinator_pressure`, `breaker_opened`). Tests construct their own
/// registry; production code shares [`global_counters`].
#[derive(Debug, Default)]
pub struct Counters {
    values: DashMap<String, AtomicU64>,
}

impl Counters {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one, creating it at zero on first use.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a counter by an arbitrary amount.
    pub fn add(&self, name: &str, amount: u64) {
        if let Some(counter) = self.values.get(name) {
            counter.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        self.values
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value of a counter (0 if never bumped).
    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        self.values
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Render all counters as text exposition, sorted by name.
    ///
    /// One `# TYPE <name> counter` line followed by `<name> <value>` per
    /// counter, which is enough for any text-format scraper.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut entries: Vec<(String, u64)> = self
            .values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::new();
        for (name, value) in entries {
            out.push_str("# TYPE ");
            out.push_str(&name);
            out.push_str(" counter\n");
            out.push_str(&name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }
}

/// The process-wide registry used by production wiring.
pub fn global_counters() -> &'static Counters {
    static GLOBAL: OnceLock<Counters> = OnceLock::new();
    GLOBAL.get_or_init(Counters::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incr_and_get() {
        let counters = Counters::new();
        assert_eq!(counters.get("replay_rejected"), 0);

        counters.incr("replay_rejected");
        counters.incr("replay_rejected");
        counters.add("bus_published", 5);

        assert_eq!(counters.get("replay_rejected"), 2);
        assert_eq!(counters.get("bus_published"), 5);
    }

    #[test]
    fn test_render_text_sorted() {
        let counters = Counters::new();
        counters.incr("zeta");
        counters.incr("alpha");

        let text = counters.render_text();
        let alpha = text.find("alpha 1").unwrap();
        let zeta = text.find("zeta 1").unwrap();
        assert!(alpha < zeta);
        assert!(text.contains("# TYPE alpha counter"));
    }

    #[test]
    fn test_global_is_shared() {
        global_counters().incr("test_global_counter");
        assert!(global_counters().get("test_global_counter") >= 1);
    }
}
