//! WebSocket hub.
//!
//! One task owns every connected client: its subscriptions and the sending
//! half of its frame queue. Sessions talk to it through [`HubHandle`].
//! Broadcasts update the latest-value cache, then enqueue the delta JSON on
//! every matching client. A client whose queue is full is dropped rather
//! than slowing the hub down.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use signalk_core::{Delta, LatestValueCache};
use signalk_protocol::codec::encode_server_message;
use signalk_protocol::{HelloMessage, ServerMessage, SubscribeMode, SubscribeRequest, UnsubscribeRequest};

use crate::subscription::SubscriptionManager;

pub type ClientId = u64;

/// Frames queued per client before it is considered stalled.
pub const CLIENT_QUEUE: usize = 256;

const COMMAND_QUEUE: usize = 1024;

/// What the hub announces in its hello frame.
#[derive(Debug, Clone)]
pub struct HubIdentity {
    pub name: String,
    pub version: String,
    pub self_context: String,
}

#[derive(Debug)]
pub enum HubCommand {
    Register {
        mode: SubscribeMode,
        send_cached: bool,
        reply: oneshot::Sender<Registration>,
    },
    Unregister(ClientId),
    Subscribe {
        id: ClientId,
        request: SubscribeRequest,
    },
    Unsubscribe {
        id: ClientId,
        request: UnsubscribeRequest,
    },
    Broadcast(Delta),
    Shutdown,
}

/// A registered client's id and the frames the hub queues for it. The
/// queue ends when the hub drops the client.
#[derive(Debug)]
pub struct Registration {
    pub id: ClientId,
    pub frames: mpsc::Receiver<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub registered: u64,
    pub broadcasts: u64,
    pub frames: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Register a client. `None` once the hub has stopped.
    pub async fn register(&self, mode: SubscribeMode, send_cached: bool) -> Option<Registration> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Register {
                mode,
                send_cached,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn unregister(&self, id: ClientId) {
        let _ = self.tx.send(HubCommand::Unregister(id)).await;
    }

    pub async fn subscribe(&self, id: ClientId, request: SubscribeRequest) {
        let _ = self.tx.send(HubCommand::Subscribe { id, request }).await;
    }

    pub async fn unsubscribe(&self, id: ClientId, request: UnsubscribeRequest) {
        let _ = self.tx.send(HubCommand::Unsubscribe { id, request }).await;
    }

    /// Hand a delta to the hub. Returns false once the hub has stopped.
    pub async fn broadcast(&self, delta: Delta) -> bool {
        self.tx.send(HubCommand::Broadcast(delta)).await.is_ok()
    }

    /// Drop every client and stop the hub.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(HubCommand::Shutdown).await;
    }
}

struct Client {
    subscriptions: SubscriptionManager,
    frames: mpsc::Sender<String>,
}

pub struct Hub {
    identity: HubIdentity,
    cache: Arc<RwLock<LatestValueCache>>,
    clients: HashMap<ClientId, Client>,
    next_id: ClientId,
    stats: HubStats,
}

/// Start the hub task.
pub fn spawn(
    identity: HubIdentity,
    cache: Arc<RwLock<LatestValueCache>>,
) -> (HubHandle, JoinHandle<HubStats>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let hub = Hub {
        identity,
        cache,
        clients: HashMap::new(),
        next_id: 1,
        stats: HubStats::default(),
    };
    (HubHandle { tx }, tokio::spawn(hub.run(rx)))
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) -> HubStats {
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Register {
                    mode,
                    send_cached,
                    reply,
                } => self.register(mode, send_cached, reply),
                HubCommand::Unregister(id) => {
                    if self.clients.remove(&id).is_some() {
                        debug!(client = id, "client unregistered");
                    }
                }
                HubCommand::Subscribe { id, request } => {
                    if let Some(client) = self.clients.get_mut(&id) {
                        for e in client.subscriptions.add(&request.context, &request.subscribe) {
                            warn!(client = id, error = %e, "ignoring subscription");
                        }
                        debug!(client = id, context = %request.context, total = client.subscriptions.len(), "subscribed");
                    }
                }
                HubCommand::Unsubscribe { id, request } => {
                    if let Some(client) = self.clients.get_mut(&id) {
                        for spec in &request.unsubscribe {
                            let removed = client.subscriptions.remove(&request.context, &spec.path);
                            debug!(client = id, context = %request.context, path = %spec.path, removed, "unsubscribed");
                        }
                    }
                }
                HubCommand::Broadcast(delta) => self.broadcast(&delta),
                HubCommand::Shutdown => break,
            }
        }
        self.clients.clear();
        info!(
            registered = self.stats.registered,
            broadcasts = self.stats.broadcasts,
            frames = self.stats.frames,
            evicted = self.stats.evicted,
            "hub stopped"
        );
        self.stats
    }

    fn register(
        &mut self,
        mode: SubscribeMode,
        send_cached: bool,
        reply: oneshot::Sender<Registration>,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        let subscriptions = SubscriptionManager::with_mode(&self.identity.self_context, mode);

        let hello = ServerMessage::Hello(HelloMessage::new(
            &self.identity.name,
            &self.identity.version,
            &self.identity.self_context,
        ));
        let mut initial = Vec::new();
        match encode_server_message(&hello) {
            Ok(text) => initial.push(text),
            Err(e) => warn!(client = id, error = %e, "failed to encode hello"),
        }
        if send_cached {
            let cached = self
                .cache
                .read()
                .deltas_matching(|ctx, path| subscriptions.matches(ctx, path));
            for delta in cached {
                match encode_server_message(&ServerMessage::Delta(delta)) {
                    Ok(text) => initial.push(text),
                    Err(e) => warn!(client = id, error = %e, "failed to encode cached delta"),
                }
            }
        }

        let (frames_tx, frames) = mpsc::channel(CLIENT_QUEUE.max(initial.len() + 1));
        for text in initial {
            // capacity covers the initial frames
            let _ = frames_tx.try_send(text);
            self.stats.frames += 1;
        }

        if reply.send(Registration { id, frames }).is_err() {
            return;
        }
        self.stats.registered += 1;
        self.clients.insert(
            id,
            Client {
                subscriptions,
                frames: frames_tx,
            },
        );
        info!(client = id, ?mode, clients = self.clients.len(), "client registered");
    }

    fn broadcast(&mut self, delta: &Delta) {
        self.stats.broadcasts += 1;
        self.cache.write().apply_delta(delta);

        let targets: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.subscriptions.matches_delta(delta))
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            return;
        }
        let frame = match serde_json::to_string(delta) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(context = %delta.context, error = %e, "failed to encode delta");
                None
            }
        };
        self.deliver(&targets, frame.as_deref());
    }

    /// Queue `frame` for each target. Clients with a full queue are evicted;
    /// closed ones are removed even when there is no frame.
    fn deliver(&mut self, targets: &[ClientId], frame: Option<&str>) {
        let mut dropped = Vec::new();
        for id in targets {
            let Some(client) = self.clients.get(id) else {
                continue;
            };
            let Some(frame) = frame else {
                if client.frames.is_closed() {
                    dropped.push(*id);
                }
                continue;
            };
            match client.frames.try_send(frame.to_string()) {
                Ok(()) => self.stats.frames += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = id, "client queue full, disconnecting");
                    self.stats.evicted += 1;
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            self.clients.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalk_core::{PathValue, Source, Update};
    use signalk_protocol::{Subscription, UnsubscribeSpec};

    const SELF: &str = "vessels.urn:mrn:imo:mmsi:230099999";

    fn start() -> (HubHandle, JoinHandle<HubStats>, Arc<RwLock<LatestValueCache>>) {
        let cache = Arc::new(RwLock::new(LatestValueCache::new()));
        let (hub, task) = spawn(
            HubIdentity {
                name: "test".to_string(),
                version: "1.7.0".to_string(),
                self_context: SELF.to_string(),
            },
            cache.clone(),
        );
        (hub, task, cache)
    }

    fn delta(context: &str, path: &str, value: f64) -> Delta {
        Delta::single(
            context,
            Update {
                source: Source::new("gps", "nmea0183"),
                timestamp: chrono::Utc::now(),
                values: vec![PathValue {
                    path: path.to_string(),
                    value: serde_json::json!(value),
                }],
            },
        )
    }

    async fn next(reg: &mut Registration) -> serde_json::Value {
        let text = tokio::time::timeout(std::time::Duration::from_secs(1), reg.frames.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_hello_then_cached_values() {
        let (hub, _task, _cache) = start();
        hub.broadcast(delta(SELF, "navigation.speedOverGround", 3.5)).await;
        hub.broadcast(delta("vessels.other", "navigation.speedOverGround", 1.0)).await;

        let mut reg = hub.register(SubscribeMode::SelfOnly, true).await.unwrap();
        let hello = next(&mut reg).await;
        assert_eq!(hello["self"], SELF);
        assert_eq!(hello["roles"], serde_json::json!(["main", "master"]));

        let cached = next(&mut reg).await;
        assert_eq!(cached["context"], SELF);
        assert_eq!(cached["updates"][0]["values"][0]["value"], 3.5);
        assert!(reg.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_over_commands() {
        let (hub, _task, _cache) = start();
        let mut reg = hub.register(SubscribeMode::None, false).await.unwrap();
        next(&mut reg).await;

        hub.subscribe(
            reg.id,
            SubscribeRequest {
                context: "vessels.self".to_string(),
                subscribe: vec![Subscription::path("environment.*")],
            },
        )
        .await;
        hub.broadcast(delta(SELF, "navigation.headingTrue", 1.0)).await;
        hub.broadcast(delta(SELF, "environment.depth.belowKeel", 4.2)).await;
        let frame = next(&mut reg).await;
        assert_eq!(frame["updates"][0]["values"][0]["path"], "environment.depth.belowKeel");

        hub.unsubscribe(
            reg.id,
            UnsubscribeRequest {
                context: "vessels.self".to_string(),
                unsubscribe: vec![UnsubscribeSpec {
                    path: "*".to_string(),
                }],
            },
        )
        .await;
        hub.broadcast(delta(SELF, "environment.depth.belowKeel", 4.3)).await;
        hub.shutdown().await;
        assert!(reg.frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_client_is_evicted() {
        let (hub, task, cache) = start();
        let mut reg = hub.register(SubscribeMode::All, false).await.unwrap();
        for i in 0..(CLIENT_QUEUE + 5) {
            hub.broadcast(delta(SELF, "navigation.headingTrue", i as f64)).await;
        }
        hub.shutdown().await;
        let stats = task.await.unwrap();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.broadcasts, (CLIENT_QUEUE + 5) as u64);

        // the queued frames still drain, then the queue ends
        let mut received = 0;
        while reg.frames.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, CLIENT_QUEUE);
        assert_eq!(cache.read().len(), 1);
    }

    #[test]
    fn test_closed_clients_removed_without_a_frame() {
        let mut hub = Hub {
            identity: HubIdentity {
                name: "test".to_string(),
                version: "1.7.0".to_string(),
                self_context: SELF.to_string(),
            },
            cache: Arc::new(RwLock::new(LatestValueCache::new())),
            clients: HashMap::new(),
            next_id: 1,
            stats: HubStats::default(),
        };
        let register = |hub: &mut Hub| {
            let (reply, mut rx) = oneshot::channel();
            hub.register(SubscribeMode::All, false, reply);
            rx.try_recv().unwrap()
        };
        let gone = register(&mut hub);
        let mut kept = register(&mut hub);
        drop(gone.frames);

        hub.deliver(&[gone.id, kept.id], None);
        assert_eq!(hub.clients.len(), 1);
        assert!(hub.clients.contains_key(&kept.id));

        hub.deliver(&[kept.id], Some("{}"));
        assert!(kept.frames.try_recv().is_ok()); // hello
        assert_eq!(kept.frames.try_recv().unwrap(), "{}");
        assert_eq!(hub.stats.frames, 3);
    }
}
