//! The fair-share coordinator (S2).
//!
//! Caps in-flight work per topic proportional to declared priority under a
//! system-wide slot ceiling. A topic blocked on backpressure accrues an
//! aging boost to its effective priority, so its share grows until it is
//! admitted: no topic with declared priority waits forever.
//!
//! Slot math per reservation attempt:
//! `p'(t) = priority(t) + aging_boost * min(age_ms / aging_ms, aging_cap)`,
//! `share(t) = p'(t) / (sum of p'(u) + aging_boost * topic_count)`,
//! `max_slots(t) = max(1, round(share(t) * max_slots))`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};

use cyb_telemetry::Counters;

/// Returned when no slot is currently available for the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("backpressure: no slot available")]
pub struct Backpressure;

/// Coordinator tuning.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// System-wide concurrency ceiling.
    pub max_slots: usize,
    /// Milliseconds of waiting per unit of aging boost.
    pub aging_ms: u64,
    /// Effective-priority boost per aging unit.
    pub aging_boost: f64,
    /// Cap on accrued aging units.
    pub aging_cap: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_slots: 32,
            aging_ms: 5_000,
            aging_boost: 5.0,
            aging_cap: 10.0,
        }
    }
}

#[derive(Debug)]
struct TopicState {
    priority: f64,
    occupied: usize,
    wait_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    topics: HashMap<String, TopicState>,
    total_occupied: usize,
}

/// Per-topic slot reservations with aging.
#[derive(Debug)]
pub struct FairShareCoordinator {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    counters: Arc<Counters>,
}

impl FairShareCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(config: CoordinatorConfig, counters: Arc<Counters>) -> Self {
        Self {
            config,
            state: Mutex::new(CoordinatorState::default()),
            counters,
        }
    }

    /// Declare or update a topic's priority weight.
    pub fn set_priority(&self, topic: &str, weight: f64) {
        let mut state = self.lock();
        let entry = state.topics.entry(topic.to_string()).or_insert(TopicState {
            priority: weight.max(0.0),
            occupied: 0,
            wait_since: None,
        });
        entry.priority = weight.max(0.0);
    }

    /// Try to reserve a slot for the topic.
    ///
    /// Success clears the topic's wait stamp; backpressure stamps it (once)
    /// so aging starts counting.
    ///
    /// # Errors
    ///
    /// Returns [`Backpressure`] when the topic's fair share or the global
    /// ceiling is exhausted.
    pub fn reserve_slot(&self, topic: &str) -> Result<(), Backpressure> {
        let mut state = self.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert(TopicState {
                priority: 1.0,
                occupied: 0,
                wait_since: None,
            });

        let allowed = self.max_slots_locked(&state, topic);
        let total_occupied = state.total_occupied;
        let ceiling = self.config.max_slots;
        let Some(entry) = state.topics.get_mut(topic) else {
            return Err(Backpressure);
        };

        if entry.occupied < allowed && total_occupied < ceiling {
            entry.occupied = entry.occupied.saturating_add(1);
            entry.wait_since = None;
            let occupied = entry.occupied;
            state.total_occupied = state.total_occupied.saturating_add(1);
            drop(state);
            self.counters.incr("coordinator_schedule");
            debug!(topic, occupied, max = allowed, "slot reserved");
            Ok(())
        } else {
            if entry.wait_since.is_none() {
                entry.wait_since = Some(Instant::now());
            }
            let occupied = entry.occupied;
            drop(state);
            self.counters.incr("coordinator_pressure");
            debug!(topic, occupied, max = allowed, "backpressure");
            Err(Backpressure)
        }
    }

    /// Release a previously reserved slot.
    pub fn release_slot(&self, topic: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.topics.get_mut(topic)
            && entry.occupied > 0
        {
            entry.occupied = entry.occupied.saturating_sub(1);
            state.total_occupied = state.total_occupied.saturating_sub(1);
            trace!(topic, occupied = state.topics[topic].occupied, "slot released");
        }
    }

    /// Reserve with an RAII permit that releases on drop, so cancelled
    /// callers always give their slot back.
    ///
    /// # Errors
    ///
    /// Returns [`Backpressure`] as [`Self::reserve_slot`].
    pub fn acquire(self: &Arc<Self>, topic: &str) -> Result<SlotPermit, Backpressure> {
        self.reserve_slot(topic)?;
        Ok(SlotPermit {
            coordinator: Arc::clone(self),
            topic: topic.to_string(),
        })
    }

    /// Current `(occupied, allowed)` for a topic.
    #[must_use]
    pub fn occupancy(&self, topic: &str) -> (usize, usize) {
        let state = self.lock();
        let allowed = self.max_slots_locked(&state, topic);
        let occupied = state.topics.get(topic).map_or(0, |t| t.occupied);
        (occupied, allowed)
    }

    /// Total reserved slots across all topics.
    #[must_use]
    pub fn total_occupied(&self) -> usize {
        self.lock().total_occupied
    }

    /// Effective share math for one topic under the current state.
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn max_slots_locked(&self, state: &CoordinatorState, topic: &str) -> usize {
        let now = Instant::now();
        let effective = |t: &TopicState| -> f64 {
            let age_units = t.wait_since.map_or(0.0, |since| {
                let age_ms = now.duration_since(since).as_millis() as f64;
                (age_ms / self.config.aging_ms.max(1) as f64).min(self.config.aging_cap)
            });
            t.priority + self.config.aging_boost * age_units
        };

        let total: f64 = state.topics.values().map(effective).sum::<f64>()
            + self.config.aging_boost * state.topics.len() as f64;
        let Some(target) = state.topics.get(topic) else {
            return 1;
        };
        if total <= 0.0 {
            return 1;
        }
        let share = effective(target) / total;
        let slots = (share * self.config.max_slots as f64).round() as usize;
        slots.max(1)
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// RAII slot reservation; releases on drop.
#[derive(Debug)]
pub struct SlotPermit {
    coordinator: Arc<FairShareCoordinator>,
    topic: String,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.coordinator.release_slot(&self.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator(max_slots: usize, aging_ms: u64) -> FairShareCoordinator {
        FairShareCoordinator::new(
            CoordinatorConfig {
                max_slots,
                aging_ms,
                aging_boost: 5.0,
                aging_cap: 10.0,
            },
            Arc::new(Counters::new()),
        )
    }

    #[test]
    fn test_priority_skew_with_aging_release() {
        let c = coordinator(4, 50);
        c.set_priority("hi", 100.0);
        c.set_priority("lo", 1.0);

        // The high-priority topic takes the whole ceiling.
        for _ in 0..4 {
            c.reserve_slot("hi").unwrap();
        }
        assert_eq!(c.reserve_slot("lo"), Err(Backpressure));

        // Aging accrues while blocked; once a slot frees, lo is admitted.
        std::thread::sleep(Duration::from_millis(60));
        c.release_slot("hi");
        c.reserve_slot("lo").unwrap();
        assert_eq!(c.occupancy("lo").0, 1);
    }

    #[test]
    fn test_global_ceiling_bounds_total() {
        let c = coordinator(2, 1000);
        c.set_priority("a", 1.0);
        c.set_priority("b", 1.0);

        c.reserve_slot("a").unwrap();
        c.reserve_slot("b").unwrap();
        assert_eq!(c.reserve_slot("a"), Err(Backpressure));
        assert_eq!(c.total_occupied(), 2);
    }

    #[test]
    fn test_release_frees_slot() {
        let c = coordinator(1, 1000);
        c.set_priority("only", 1.0);
        c.reserve_slot("only").unwrap();
        assert_eq!(c.reserve_slot("only"), Err(Backpressure));
        c.release_slot("only");
        c.reserve_slot("only").unwrap();
    }

    #[test]
    fn test_undeclared_topic_is_auto_declared() {
        let c = coordinator(4, 1000);
        c.reserve_slot("surprise").unwrap();
        assert_eq!(c.occupancy("surprise").0, 1);
    }

    #[test]
    fn test_every_topic_allowed_at_least_one_slot() {
        let c = coordinator(4, 1000);
        c.set_priority("whale", 1_000.0);
        c.set_priority("shrimp", 0.001);
        let (_, allowed) = c.occupancy("shrimp");
        assert!(allowed >= 1);
    }

    #[test]
    fn test_steady_state_share_tracks_priority_ratio() {
        let c = coordinator(8, 1000);
        c.set_priority("a", 3.0);
        c.set_priority("b", 1.0);
        // Shares include the aging smoothing term, but a must be allowed
        // roughly three times b's slots.
        let (_, allowed_a) = c.occupancy("a");
        let (_, allowed_b) = c.occupancy("b");
        assert!(allowed_a > allowed_b);
        assert!(allowed_b >= 1);
    }

    #[test]
    fn test_aging_grows_blocked_topic_share() {
        let c = coordinator(4, 20);
        c.set_priority("hi", 100.0);
        c.set_priority("lo", 1.0);
        for _ in 0..4 {
            c.reserve_slot("hi").unwrap();
        }
        let (_, before) = c.occupancy("lo");
        let _ = c.reserve_slot("lo"); // stamps wait_since
        std::thread::sleep(Duration::from_millis(100));
        let (_, after) = c.occupancy("lo");
        assert!(after >= before, "aging must not shrink the share");
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let c = Arc::new(coordinator(1, 1000));
        c.set_priority("t", 1.0);
        let permit = c.acquire("t").unwrap();
        assert_eq!(c.reserve_slot("t"), Err(Backpressure));
        drop(permit);
        assert_eq!(c.total_occupied(), 0);
        c.reserve_slot("t").unwrap();
    }

    #[test]
    fn test_schedule_and_pressure_counters() {
        let counters = Arc::new(Counters::new());
        let c = FairShareCoordinator::new(
            CoordinatorConfig {
                max_slots: 1,
                ..CoordinatorConfig::default()
            },
            Arc::clone(&counters),
        );
        c.set_priority("t", 1.0);
        c.reserve_slot("t").unwrap();
        let _ = c.reserve_slot("t");
        assert_eq!(counters.get("coordinator_schedule"), 1);
        assert_eq!(counters.get("coordinator_pressure"), 1);
    }
}
