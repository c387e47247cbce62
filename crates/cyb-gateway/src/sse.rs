//! Server-sent-event fan-out.
//!
//! Topics are per-tenant (`events:tenant:<id>:<base>`), so the pub-sub can
//! never deliver one tenant's events to another. Each topic keeps a ring
//! buffer of recent events so a reconnecting client can resume from its
//! `Last-Event-ID`; when the buffer no longer holds that id the stream
//! resumes from current. Idle streams carry `: heartbeat <iso8601>`
//! comment frames.

use axum::response::sse::Event;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use cyb_core::{TenantId, now_ms};
use cyb_telemetry::Counters;

use crate::error::AdmissionError;

/// Fan-out tuning.
#[derive(Debug, Clone, Copy)]
pub struct SseConfig {
    /// Idle interval before a heartbeat comment.
    pub heartbeat: Duration,
    /// Events retained per topic for resumption.
    pub history: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            history: 256,
        }
    }
}

/// One framed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Server-generated monotone-random id.
    pub id: String,
    /// Event type, e.g. `episode.created`.
    pub event: String,
    /// JSON payload.
    pub data: String,
}

struct Topic {
    tx: broadcast::Sender<SseEvent>,
    history: VecDeque<SseEvent>,
}

/// The in-process pub-sub behind `/v1/events`.
pub struct SseBroker {
    config: SseConfig,
    topics: Mutex<HashMap<String, Topic>>,
    seq: AtomicU64,
}

impl std::fmt::Debug for SseBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseBroker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The pub-sub topic for a tenant and base topic name.
#[must_use]
pub fn tenant_topic(tenant: &TenantId, base: &str) -> String {
    format!("events:tenant:{tenant}:{base}")
}

/// Validate `topics=` patterns (`^[a-z0-9_]+\.(\*|[a-z0-9_]+)$`, comma
/// separated) and return `(base, pattern)` pairs.
///
/// # Errors
///
/// Returns [`AdmissionError::BadRequest`] on an empty list or a malformed
/// pattern.
pub fn parse_topic_patterns(raw: &str) -> Result<Vec<(String, String)>, AdmissionError> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9_]+\.(\*|[a-z0-9_]+)$").unwrap_or_else(|_| unreachable!())
    });

    let mut out = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if !re.is_match(item) {
            return Err(AdmissionError::BadRequest(format!(
                "invalid topic pattern: {item}"
            )));
        }
        let base = item
            .split_once('.')
            .map_or(item, |(base, _)| base)
            .to_string();
        out.push((base, item.to_string()));
    }
    if out.is_empty() {
        return Err(AdmissionError::BadRequest("no topic patterns".to_string()));
    }
    Ok(out)
}

/// Whether a two-segment pattern matches an event type.
#[must_use]
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    let Some((p_base, p_rest)) = pattern.split_once('.') else {
        return false;
    };
    let Some((e_base, e_rest)) = event_type.split_once('.') else {
        return pattern == event_type;
    };
    p_base == e_base && (p_rest == "*" || p_rest == e_rest)
}

impl SseBroker {
    /// Create a broker.
    #[must_use]
    pub fn new(config: SseConfig) -> Self {
        Self {
            config,
            topics: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Publish onto an explicit topic.
    pub fn publish(&self, topic: &str, event_type: &str, data: &serde_json::Value) -> SseEvent {
        let event = SseEvent {
            id: self.event_id(),
            event: event_type.to_string(),
            data: data.to_string(),
        };
        let mut topics = self.lock();
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                tx: broadcast::channel(self.config.history.max(16)).0,
                history: VecDeque::new(),
            });
        entry.history.push_back(event.clone());
        while entry.history.len() > self.config.history {
            entry.history.pop_front();
        }
        let _ = entry.tx.send(event.clone());
        trace!(topic, event = %event.event, id = %event.id, "sse published");
        event
    }

    /// Publish an event on the owning tenant's topic; the base topic is the
    /// event type's first segment.
    pub fn publish_for_tenant(
        &self,
        tenant: &TenantId,
        event_type: &str,
        data: &serde_json::Value,
    ) -> SseEvent {
        let base = event_type.split('.').next().unwrap_or(event_type);
        self.publish(&tenant_topic(tenant, base), event_type, data)
    }

    /// Subscribe to a topic, replaying history after `last_event_id` when
    /// it is still retained.
    pub fn subscribe(
        &self,
        topic: &str,
        last_event_id: Option<&str>,
    ) -> (Vec<SseEvent>, broadcast::Receiver<SseEvent>) {
        let mut topics = self.lock();
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                tx: broadcast::channel(self.config.history.max(16)).0,
                history: VecDeque::new(),
            });
        let receiver = entry.tx.subscribe();
        let backlog = match last_event_id {
            Some(resume_id) => {
                match entry.history.iter().position(|e| e.id == resume_id) {
                    Some(pos) => entry.history.iter().skip(pos.saturating_add(1)).cloned().collect(),
                    None => Vec::new(),
                }
            },
            None => Vec::new(),
        };
        (backlog, receiver)
    }

    /// Monotone-random event id: millis, process sequence, random tail.
    fn event_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let tail: u16 = rand::random();
        format!("{:012x}-{:06x}-{:04x}", now_ms(), seq & 0xff_ffff, tail)
    }
}

impl Default for SseBroker {
    fn default() -> Self {
        Self::new(SseConfig::default())
    }
}

impl SseBroker {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Topic>> {
        self.topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Build the live stream for one subscription: the initial `connected`
/// event, any resumed backlog, live events filtered by the patterns, and
/// heartbeat comments while idle. The subscription ends when the client
/// disconnects.
pub(crate) fn spawn_subscription(
    broker: &Arc<SseBroker>,
    counters: Arc<Counters>,
    tenant: &TenantId,
    patterns: Vec<(String, String)>,
    last_event_id: Option<String>,
    heartbeat: Duration,
) -> ReceiverStream<Result<Event, Infallible>> {
    let (out, rx) = mpsc::channel::<Result<Event, Infallible>>(64);

    // Fan all subscribed topics into one channel.
    let (merged_tx, mut merged) = mpsc::unbounded_channel::<SseEvent>();
    let mut backlogs: Vec<SseEvent> = Vec::new();
    let pattern_list: Vec<String> = patterns.iter().map(|(_, p)| p.clone()).collect();
    for (base, _) in &patterns {
        let topic = tenant_topic(tenant, base);
        let (backlog, mut receiver) = broker.subscribe(&topic, last_event_id.as_deref());
        backlogs.extend(backlog);
        let merged_tx = merged_tx.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if merged_tx.send(event).is_err() {
                            break;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => {},
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    drop(merged_tx);

    let tenant = tenant.clone();
    counters.incr("sse_connected");
    tokio::spawn(async move {
        let connected = Event::default()
            .event("connected")
            .data(
                serde_json::json!({
                    "tenant": tenant.as_str(),
                    "topics": pattern_list,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })
                .to_string(),
            );
        if out.send(Ok(connected)).await.is_err() {
            counters.incr("sse_disconnected");
            return;
        }

        for event in backlogs {
            if matches_any(&pattern_list, &event.event)
                && out.send(Ok(frame(&event))).await.is_err()
            {
                counters.incr("sse_disconnected");
                return;
            }
        }

        let mut idle = tokio::time::interval(heartbeat);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        idle.reset();
        loop {
            tokio::select! {
                event = merged.recv() => {
                    let Some(event) = event else { break };
                    if !matches_any(&pattern_list, &event.event) {
                        continue;
                    }
                    idle.reset();
                    if out.send(Ok(frame(&event))).await.is_err() {
                        break;
                    }
                    counters.incr("sse_delivered");
                },
                _ = idle.tick() => {
                    let comment = format!("heartbeat {}", chrono::Utc::now().to_rfc3339());
                    if out.send(Ok(Event::default().comment(comment))).await.is_err() {
                        break;
                    }
                },
            }
        }
        counters.incr("sse_disconnected");
        debug!(tenant = %tenant, "sse subscription closed");
    });

    ReceiverStream::new(rx)
}

fn matches_any(patterns: &[String], event_type: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, event_type))
}

fn frame(event: &SseEvent) -> Event {
    Event::default()
        .id(event.id.clone())
        .event(event.event.clone())
        .data(event.data.clone())
}
