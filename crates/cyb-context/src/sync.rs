//! Replica tasks, delta shipping, and membership wiring.
//!
//! Each node runs one [`ContextGraph`] task that owns its [`GraphReplica`]
//! (single writer). Peers hold an unbounded delta channel into the task;
//! a ship timer drains pending mutations to every peer, skipping a tick
//! while writes are still arriving (debounce). [`GraphNetwork`] listens on
//! a membership source and wires newly joined replicas to the existing
//! ones, bootstrapping them with full state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cyb_core::SiteId;

use crate::replica::{Delta, GraphReplica};
use crate::triple::{Triple, TripleValue};

/// Delta shipping cadence.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Interval between ship attempts.
    pub ship_interval: Duration,
    /// Hold shipping while writes arrived this recently.
    pub debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ship_interval: Duration::from_millis(200),
            debounce: Duration::from_millis(20),
        }
    }
}

/// Membership change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node appeared.
    NodeJoined(SiteId),
    /// A node went away.
    NodeLeft(SiteId),
}

/// A pluggable membership source.
pub trait Membership: Send + Sync {
    /// Subscribe to membership events.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// In-process membership driven by explicit announcements.
#[derive(Debug)]
pub struct StaticMembership {
    tx: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    /// Create an empty membership source.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Announce a node joining.
    pub fn announce_join(&self, site: SiteId) {
        let _ = self.tx.send(MembershipEvent::NodeJoined(site));
    }

    /// Announce a node leaving.
    pub fn announce_leave(&self, site: SiteId) {
        let _ = self.tx.send(MembershipEvent::NodeLeft(site));
    }
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl Membership for StaticMembership {
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.tx.subscribe()
    }
}

enum Command {
    Put {
        triple: Triple,
        fields: BTreeMap<String, serde_json::Value>,
        timestamp_ms: Option<u64>,
        reply: oneshot::Sender<()>,
    },
    Remove {
        triple: Triple,
        reply: oneshot::Sender<()>,
    },
    Read {
        reply: oneshot::Sender<Vec<TripleValue>>,
    },
    Get {
        triple: Triple,
        reply: oneshot::Sender<Option<TripleValue>>,
    },
    AddPeer {
        site: SiteId,
        deltas: mpsc::UnboundedSender<Vec<Delta>>,
        bootstrap: bool,
    },
    RemovePeer {
        site: SiteId,
    },
}

/// Handle to one node's replica task.
#[derive(Debug, Clone)]
pub struct ContextGraph {
    site: SiteId,
    commands: mpsc::Sender<Command>,
    inbound: mpsc::UnboundedSender<Vec<Delta>>,
}

impl ContextGraph {
    /// Spawn the replica task for `site`.
    #[must_use]
    pub fn spawn(site: SiteId, config: SyncConfig, cancel: CancellationToken) -> Self {
        let (commands, command_rx) = mpsc::channel(256);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let graph = Self {
            site: site.clone(),
            commands,
            inbound,
        };
        tokio::spawn(run(site, config, command_rx, inbound_rx, cancel));
        graph
    }

    /// This node's site.
    #[must_use]
    pub fn site(&self) -> &SiteId {
        &self.site
    }

    /// Record a triple.
    pub async fn put_triple(
        &self,
        triple: Triple,
        fields: BTreeMap<String, serde_json::Value>,
    ) {
        self.send_put(triple, fields, None).await;
    }

    /// Record a triple at an explicit timestamp.
    pub async fn put_triple_at(
        &self,
        triple: Triple,
        fields: BTreeMap<String, serde_json::Value>,
        timestamp_ms: u64,
    ) {
        self.send_put(triple, fields, Some(timestamp_ms)).await;
    }

    async fn send_put(
        &self,
        triple: Triple,
        fields: BTreeMap<String, serde_json::Value>,
        timestamp_ms: Option<u64>,
    ) {
        let (reply, wait) = oneshot::channel();
        if self
            .commands
            .send(Command::Put {
                triple,
                fields,
                timestamp_ms,
                reply,
            })
            .await
            .is_ok()
        {
            let _ = wait.await;
        }
    }

    /// Remove a triple.
    pub async fn remove_triple(&self, triple: Triple) {
        let (reply, wait) = oneshot::channel();
        if self
            .commands
            .send(Command::Remove { triple, reply })
            .await
            .is_ok()
        {
            let _ = wait.await;
        }
    }

    /// Snapshot of the live triples.
    pub async fn read(&self) -> Vec<TripleValue> {
        let (reply, wait) = oneshot::channel();
        if self.commands.send(Command::Read { reply }).await.is_err() {
            return Vec::new();
        }
        wait.await.unwrap_or_default()
    }

    /// Look up one triple.
    pub async fn get(&self, triple: Triple) -> Option<TripleValue> {
        let (reply, wait) = oneshot::channel();
        if self
            .commands
            .send(Command::Get { triple, reply })
            .await
            .is_err()
        {
            return None;
        }
        wait.await.ok().flatten()
    }

    /// Register a neighbour; `bootstrap` ships full state immediately.
    pub async fn add_peer(&self, site: SiteId, deltas: mpsc::UnboundedSender<Vec<Delta>>, bootstrap: bool) {
        let _ = self
            .commands
            .send(Command::AddPeer {
                site,
                deltas,
                bootstrap,
            })
            .await;
    }

    /// Drop a neighbour.
    pub async fn remove_peer(&self, site: SiteId) {
        let _ = self.commands.send(Command::RemovePeer { site }).await;
    }

    /// The inbound delta channel peers ship into.
    #[must_use]
    pub fn delta_channel(&self) -> mpsc::UnboundedSender<Vec<Delta>> {
        self.inbound.clone()
    }

    /// Wire two replicas as mutual neighbours with state bootstrap.
    pub async fn connect(a: &Self, b: &Self) {
        a.add_peer(b.site.clone(), b.delta_channel(), true).await;
        b.add_peer(a.site.clone(), a.delta_channel(), true).await;
    }
}

async fn run(
    site: SiteId,
    config: SyncConfig,
    mut commands: mpsc::Receiver<Command>,
    mut inbound: mpsc::UnboundedReceiver<Vec<Delta>>,
    cancel: CancellationToken,
) {
    let mut replica = GraphReplica::new(site.clone());
    let mut peers: HashMap<SiteId, mpsc::UnboundedSender<Vec<Delta>>> = HashMap::new();
    let mut last_write = Instant::now();
    let mut ship = tokio::time::interval(config.ship_interval);
    ship.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Put { triple, fields, timestamp_ms, reply } => {
                        match timestamp_ms {
                            Some(ts) => { replica.put_triple_at(triple, fields, ts); },
                            None => { replica.put_triple(triple, fields); },
                        }
                        last_write = Instant::now();
                        let _ = reply.send(());
                    },
                    Command::Remove { triple, reply } => {
                        replica.remove_triple(&triple);
                        last_write = Instant::now();
                        let _ = reply.send(());
                    },
                    Command::Read { reply } => {
                        let _ = reply.send(replica.read());
                    },
                    Command::Get { triple, reply } => {
                        let _ = reply.send(replica.get(&triple));
                    },
                    Command::AddPeer { site: peer, deltas, bootstrap } => {
                        info!(node = %site, peer = %peer, "neighbour registered");
                        if bootstrap {
                            let state = replica.full_state();
                            if !state.is_empty() {
                                let _ = deltas.send(state);
                            }
                        }
                        peers.insert(peer, deltas);
                    },
                    Command::RemovePeer { site: peer } => {
                        peers.remove(&peer);
                    },
                }
            },
            batch = inbound.recv() => {
                if let Some(batch) = batch {
                    debug!(node = %site, deltas = batch.len(), "merging remote deltas");
                    replica.merge_all(batch);
                }
            },
            _ = ship.tick() => {
                if replica.has_pending() && last_write.elapsed() >= config.debounce {
                    let deltas = replica.take_pending();
                    peers.retain(|peer, tx| {
                        if tx.send(deltas.clone()).is_err() {
                            warn!(node = %site, peer = %peer, "peer channel closed");
                            false
                        } else {
                            true
                        }
                    });
                }
            },
        }
    }
    debug!(node = %site, "replica task stopped");
}

/// Membership-driven full-mesh wiring of replicas.
pub struct GraphNetwork {
    membership: Arc<StaticMembership>,
    directory: Arc<Mutex<HashMap<SiteId, ContextGraph>>>,
}

impl std::fmt::Debug for GraphNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNetwork").finish_non_exhaustive()
    }
}

impl GraphNetwork {
    /// Create a network and start the wiring listener.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        let membership = Arc::new(StaticMembership::new());
        let directory: Arc<Mutex<HashMap<SiteId, ContextGraph>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut events = membership.subscribe();
        let wiring_directory = Arc::clone(&directory);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => {
                        match event {
                            Ok(MembershipEvent::NodeJoined(site)) => {
                                let (joined, others) = {
                                    let directory = wiring_directory
                                        .lock()
                                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                                    let joined = directory.get(&site).cloned();
                                    let others: Vec<ContextGraph> = directory
                                        .values()
                                        .filter(|g| g.site() != &site)
                                        .cloned()
                                        .collect();
                                    (joined, others)
                                };
                                if let Some(joined) = joined {
                                    for other in others {
                                        ContextGraph::connect(&joined, &other).await;
                                    }
                                }
                            },
                            Ok(MembershipEvent::NodeLeft(site)) => {
                                let others: Vec<ContextGraph> = {
                                    let directory = wiring_directory
                                        .lock()
                                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                                    directory.values().cloned().collect()
                                };
                                for graph in others {
                                    graph.remove_peer(site.clone()).await;
                                }
                            },
                            Err(broadcast::error::RecvError::Lagged(_)) => {},
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    },
                }
            }
        });

        Self {
            membership,
            directory,
        }
    }

    /// The membership source, for other listeners.
    #[must_use]
    pub fn membership(&self) -> Arc<StaticMembership> {
        Arc::clone(&self.membership)
    }

    /// Register a replica and announce its join; the wiring listener
    /// connects it to every existing replica.
    pub fn register(&self, graph: &ContextGraph) {
        let site = graph.site().clone();
        {
            let mut directory = self
                .directory
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            directory.insert(site.clone(), graph.clone());
        }
        self.membership.announce_join(site);
    }

    /// Deregister a replica and announce its departure.
    pub fn deregister(&self, site: &SiteId) {
        {
            let mut directory = self
                .directory
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            directory.remove(site);
        }
        self.membership.announce_leave(site.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }

    fn fast() -> SyncConfig {
        SyncConfig {
            ship_interval: Duration::from_millis(30),
            debounce: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_two_connected_replicas_converge() {
        let cancel = CancellationToken::new();
        let a = ContextGraph::spawn(SiteId::new("a"), fast(), cancel.clone());
        let b = ContextGraph::spawn(SiteId::new("b"), fast(), cancel.clone());
        ContextGraph::connect(&a, &b).await;

        let triple = Triple::new("alice", "knows", "bob");
        a.put_triple_at(triple.clone(), fields(), 1).await;
        b.put_triple_at(triple.clone(), fields(), 2).await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let read_a = a.read().await;
        let read_b = b.read().await;
        assert_eq!(read_a, read_b);
        assert_eq!(read_a.len(), 1);
        assert_eq!(read_a[0].meta.timestamp_ms, 2);
        assert_eq!(read_a[0].meta.site, "b");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bootstrap_ships_existing_state() {
        let cancel = CancellationToken::new();
        let a = ContextGraph::spawn(SiteId::new("a"), fast(), cancel.clone());
        a.put_triple(Triple::new("x", "p", "1"), fields()).await;
        a.put_triple(Triple::new("y", "p", "2"), fields()).await;

        let b = ContextGraph::spawn(SiteId::new("b"), fast(), cancel.clone());
        ContextGraph::connect(&a, &b).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(b.read().await.len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_network_wires_joined_nodes() {
        let cancel = CancellationToken::new();
        let network = GraphNetwork::new(cancel.clone());

        let a = ContextGraph::spawn(SiteId::new("a"), fast(), cancel.clone());
        let b = ContextGraph::spawn(SiteId::new("b"), fast(), cancel.clone());
        network.register(&a);
        network.register(&b);
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.put_triple(Triple::new("seen", "by", "everyone"), fields()).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(b.read().await.len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_remove_propagates() {
        let cancel = CancellationToken::new();
        let a = ContextGraph::spawn(SiteId::new("a"), fast(), cancel.clone());
        let b = ContextGraph::spawn(SiteId::new("b"), fast(), cancel.clone());
        ContextGraph::connect(&a, &b).await;

        let triple = Triple::new("alice", "knows", "bob");
        a.put_triple(triple.clone(), fields()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.read().await.len(), 1);

        a.remove_triple(triple).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.read().await.is_empty());
        cancel.cancel();
    }
}
