//! Connected client tracking — one entry per live WebSocket

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A single connected client
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub request_count: u64,
}

#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, ClientInfo>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its client ID
    pub async fn connect(&self, addr: SocketAddr) -> ClientInfo {
        let now = Utc::now();
        let client = ClientInfo {
            id: uuid::Uuid::new_v4().to_string(),
            addr,
            connected_at: now,
            last_activity: now,
            request_count: 0,
        };
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        info!("Client {} connected from {}", client.id, addr);
        client
    }

    pub async fn disconnect(&self, client_id: &str) -> Option<ClientInfo> {
        let removed = self.clients.write().await.remove(client_id);
        if let Some(client) = &removed {
            info!(
                "Client {} disconnected after {} requests",
                client.id, client.request_count
            );
        }
        removed
    }

    /// Record a request from a client (updates last_activity and request_count)
    pub async fn record_activity(&self, client_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(client_id) {
            client.last_activity = Utc::now();
            client.request_count += 1;
            debug!("Client {} activity (count: {})", client_id, client.request_count);
        }
    }

    pub async fn get(&self, client_id: &str) -> Option<ClientInfo> {
        self.clients.read().await.get(client_id).cloned()
    }

    /// Most recently active first
    pub async fn list(&self) -> Vec<ClientInfo> {
        let clients = self.clients.read().await;
        let mut list: Vec<ClientInfo> = clients.values().cloned().collect();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        list
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}
