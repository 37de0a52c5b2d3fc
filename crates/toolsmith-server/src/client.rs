use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use toolsmith_core::{ConnectionId, UserId};
use toolsmith_engine::{ConnectionDirectory, DeliveryError, PushTransport};

/// A connection is dead once it has not answered a ping for this long.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// One open WebSocket.
pub struct Client {
    pub id: ConnectionId,
    user_id: RwLock<Option<UserId>>,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ConnectionId, user_id: Option<UserId>, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            user_id: RwLock::new(user_id),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Open connections and the user each one belongs to.
///
/// Serves as the connection directory and push transport of the progress hub.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Arc<Client>>,
    max_send_queue: usize,
    push_enabled: AtomicBool,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            push_enabled: AtomicBool::new(true),
        }
    }

    pub fn register(&self, user_id: Option<UserId>) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients.insert(id.clone(), Arc::new(Client::new(id.clone(), user_id, tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Bind a connection to a user. Returns false for an unknown connection.
    pub fn identify(&self, id: &ConnectionId, user_id: UserId) -> bool {
        match self.clients.get(id) {
            Some(client) => {
                *client.user_id.write() = Some(user_id);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Queue a message for one connection. Full queues drop the message.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> Result<(), DeliveryError> {
        let Some(client) = self.get(id) else {
            return Err(DeliveryError::Gone(id.clone()));
        };
        if !client.connected.load(Ordering::Relaxed) {
            return Err(DeliveryError::Gone(id.clone()));
        }
        match client.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(connection = %id, msg_len = msg.len(), "send queue full, dropping message");
                Err(DeliveryError::Failed("send queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Gone(id.clone())),
        }
    }

    pub fn set_push_enabled(&self, enabled: bool) {
        self.push_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn user_connections(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.clients
            .iter()
            .filter(|entry| entry.value().user_id.read().as_ref() == Some(user_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove connections that stopped answering pings or whose writer went away.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive() || !entry.value().is_connected())
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection = %id, "cleaned up dead connection");
        }
        dead.len()
    }
}

#[async_trait]
impl ConnectionDirectory for ClientRegistry {
    async fn connections_for_user(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.user_connections(user_id)
    }
}

#[async_trait]
impl PushTransport for ClientRegistry {
    fn is_available(&self) -> bool {
        self.push_enabled.load(Ordering::Relaxed)
    }

    async fn send(&self, connection: &ConnectionId, message: &serde_json::Value) -> Result<(), DeliveryError> {
        let text = serde_json::to_string(message).map_err(|e| DeliveryError::Failed(e.to_string()))?;
        let result = self.send_to(connection, text);
        if let Err(DeliveryError::Gone(id)) = &result {
            self.unregister(id);
        }
        result
    }
}

/// Pump one socket: writer forwards queued messages and pings, reader hands
/// text frames to `on_message` and records pongs. Returns when either side ends.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection = %writer_id, "sent ping");
                }
            }
        }
    });

    let reader_id = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send((reader_id.clone(), text.to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.get(&reader_id) {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&connection_id);
    tracing::info!(connection = %connection_id, "connection closed");
}

pub fn start_cleanup_task(registry: Arc<ClientRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed, "dead connection cleanup");
            }
        }
    })
}
