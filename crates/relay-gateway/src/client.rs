//! Directory of connected consumer clients.
//!
//! Each client owns a bounded outbound queue; the socket task drains it. The
//! directory is the single owner of client records — removal hands back the
//! client's subscription keys so the registry can be purged in the same step.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use relay_core::ids::ClientId;
use relay_core::key::SubscriptionKey;

/// Metadata supplied by a client at registration time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Metadata held for a registered client.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMeta {
    pub agent_id: String,
    pub agent_name: String,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

impl ClientMeta {
    fn from_registration(registration: Registration, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: registration.agent_id.unwrap_or_else(|| "unknown".into()),
            agent_name: registration
                .agent_name
                .unwrap_or_else(|| "Unknown Agent".into()),
            capabilities: registration.capabilities,
            registered_at: now,
        }
    }
}

/// Snapshot of one connected client.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: ClientId,
    #[serde(flatten)]
    pub meta: ClientMeta,
    pub subscriptions: Vec<String>,
}

struct ClientEntry {
    meta: ClientMeta,
    tx: mpsc::Sender<String>,
    subscriptions: Mutex<HashSet<SubscriptionKey>>,
}

pub struct ClientDirectory {
    clients: DashMap<ClientId, Arc<ClientEntry>>,
    queue_size: usize,
}

impl ClientDirectory {
    pub fn new(queue_size: usize) -> Self {
        Self {
            clients: DashMap::new(),
            queue_size,
        }
    }

    /// Register a new client. Returns its id and the receiving half of its
    /// outbound queue.
    pub fn register(&self, registration: Registration) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.queue_size);
        let entry = Arc::new(ClientEntry {
            meta: ClientMeta::from_registration(registration, Utc::now()),
            tx,
            subscriptions: Mutex::new(HashSet::new()),
        });
        self.clients.insert(id.clone(), entry);
        (id, rx)
    }

    /// Remove a client, returning the subscription keys it held so the caller
    /// can purge the registry.
    pub fn remove(&self, id: &ClientId) -> Option<Vec<SubscriptionKey>> {
        self.clients.remove(id).map(|(_, entry)| {
            entry.subscriptions.lock().iter().cloned().collect()
        })
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Queue a message for a client. Returns false for unknown clients,
    /// closed queues, or a full queue (the message is dropped, not awaited).
    pub fn send_to(&self, id: &ClientId, message: String) -> bool {
        let Some(entry) = self.clients.get(id) else {
            return false;
        };
        match entry.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Record a key on the client's subscription set. False if unknown.
    pub fn track_subscription(&self, id: &ClientId, key: SubscriptionKey) -> bool {
        match self.clients.get(id) {
            Some(entry) => {
                entry.subscriptions.lock().insert(key);
                true
            }
            None => false,
        }
    }

    pub fn untrack_subscription(&self, id: &ClientId, key: &SubscriptionKey) {
        if let Some(entry) = self.clients.get(id) {
            entry.subscriptions.lock().remove(key);
        }
    }

    pub fn subscription_keys(&self, id: &ClientId) -> Vec<SubscriptionKey> {
        self.clients
            .get(id)
            .map(|entry| entry.subscriptions.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Connected-clients snapshot for diagnostics.
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.clients
            .iter()
            .map(|entry| ClientInfo {
                client_id: entry.key().clone(),
                meta: entry.value().meta.clone(),
                subscriptions: entry
                    .value()
                    .subscriptions
                    .lock()
                    .iter()
                    .map(|key| key.to_string())
                    .collect(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
