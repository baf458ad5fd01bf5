use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::Message;
use relay_core::types::Timestamp;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

/// Frames buffered per dashboard before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::Sender<Message>;

/// A single dashboard connection.
pub struct WsConnection {
    /// Channel sender for outbound messages to this connection.
    pub sender: WsSender,
    pub connected_at: Timestamp,
}

/// Manages all active dashboard WebSocket connections.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application. Each connection has a bounded queue;
/// a browser that stops reading loses frames instead of growing memory.
pub struct WsManager {
    connections: RwLock<HashMap<String, WsConnection>>,
    queue_capacity: usize,
}

impl WsManager {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the receiver half of the message channel so the caller can
    /// forward messages to the WebSocket sink.
    pub async fn add(&self, conn_id: String) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let conn = WsConnection {
            sender: tx,
            connected_at: chrono::Utc::now(),
        };
        self.connections.write().await.insert(conn_id, conn);
        rx
    }

    pub async fn remove(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    /// Queue a message for one connection. Returns `false` if it is gone
    /// or its queue is full.
    pub async fn send_to(&self, conn_id: &str, message: Message) -> bool {
        match self.connections.read().await.get(conn_id) {
            Some(conn) => enqueue(conn_id, conn, message),
            None => false,
        }
    }

    /// Broadcast a message to all connected clients.
    ///
    /// Connections whose send channels are closed are skipped (they are
    /// cleaned up when their receive loop ends); connections whose queue
    /// is full drop this message. Returns the number of connections the
    /// message was queued for.
    pub async fn broadcast(&self, message: Message) -> usize {
        let conns = self.connections.read().await;
        conns
            .iter()
            .filter(|(conn_id, conn)| enqueue(conn_id, conn, message.clone()))
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a Close frame to every connection, then clear the map.
    ///
    /// Used during graceful shutdown to notify all clients before the
    /// server stops. A connection with a full queue still ends once its
    /// sender is dropped here.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.try_send(Message::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all dashboard WebSocket connections");
    }

    /// Send a Ping frame to every connected client.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for (conn_id, conn) in conns.iter() {
            enqueue(conn_id, conn, Message::Ping(Bytes::new()));
        }
    }
}

fn enqueue(conn_id: &str, conn: &WsConnection, message: Message) -> bool {
    match conn.sender.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(conn_id, "Dashboard queue full, dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
