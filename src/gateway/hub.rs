use crate::token::{Claims, IssuedToken};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Server → client frames, serialized as `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// First frame on every connection: the id clients post in their comment.
    Connected { id: String },
    Authenticated(IssuedToken),
    TokenValid(Claims),
    TokenError { kind: String, message: String },
}

/// Delivery side of the realtime transport, as seen by the correlation engine
#[async_trait]
pub trait RealtimeGateway: Send + Sync {
    /// Push `token` to the client whose id is `token.correlation_id`.
    /// `Ok(false)` means no such client is connected.
    async fn deliver(&self, token: &IssuedToken) -> anyhow::Result<bool>;
}

/// Live WebSocket connections keyed by correlation id.
#[derive(Debug, Default)]
pub struct ClientHub {
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<ServerEvent>>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a fresh correlation id and return the connection's outbound queue.
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.lock().insert(id.clone(), tx);
        (id, rx)
    }

    pub fn unregister(&self, id: &str) {
        self.clients.lock().remove(id);
    }

    /// Queue `event` for client `id`. Returns false if the client is gone.
    pub fn send(&self, id: &str, event: ServerEvent) -> bool {
        let mut clients = self.clients.lock();
        let Some(tx) = clients.get(id) else {
            return false;
        };
        if tx.send(event).is_ok() {
            return true;
        }
        clients.remove(id);
        false
    }

    pub fn connected(&self) -> usize {
        self.clients.lock().len()
    }
}

#[async_trait]
impl RealtimeGateway for ClientHub {
    async fn deliver(&self, token: &IssuedToken) -> anyhow::Result<bool> {
        Ok(self.send(
            &token.correlation_id,
            ServerEvent::Authenticated(token.clone()),
        ))
    }
}
