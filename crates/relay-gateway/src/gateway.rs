//! The gateway façade: one explicitly constructed instance owning the client
//! directory, subscription registry, and run tracker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use relay_core::errors::GatewayError;
use relay_core::event::{Event, EventType};
use relay_core::ids::{ClientId, RunId, ThreadId};
use relay_core::key::SubscriptionKey;

use crate::client::{ClientDirectory, ClientInfo, Registration};
use crate::frames::ServerFrame;
use crate::runs::{Run, RunTracker, RunTransition};
use crate::subscription::SubscriptionRegistry;

/// Gateway tuning knobs.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Events retained per run.
    pub max_history_size: usize,
    /// Age past which runs and their history are purged.
    pub retention_window: Duration,
    /// Per-client outbound queue depth.
    pub client_queue_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_history_size: 1000,
            retention_window: Duration::from_millis(86_400_000),
            client_queue_size: 64,
        }
    }
}

pub struct Gateway {
    directory: ClientDirectory,
    subscriptions: SubscriptionRegistry,
    runs: RunTracker,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            directory: ClientDirectory::new(config.client_queue_size),
            subscriptions: SubscriptionRegistry::new(),
            runs: RunTracker::new(config.max_history_size, config.retention_window),
        }
    }

    /// Register a consumer. The registration confirmation is the first frame
    /// queued on the returned receiver.
    pub fn register_client(
        &self,
        registration: Registration,
    ) -> (ClientId, mpsc::Receiver<String>) {
        let (id, rx) = self.directory.register(registration);
        tracing::info!(client_id = %id, "client registered");

        self.send_frame(
            &id,
            &ServerFrame::RegistrationConfirmation {
                client_id: id.clone(),
                message: "Registered for events".into(),
                timestamp: Utc::now(),
            },
        );
        (id, rx)
    }

    /// Remove a client and purge it from every subscription bucket.
    pub fn unregister_client(&self, id: &ClientId) {
        if let Some(keys) = self.directory.remove(id) {
            self.subscriptions.purge_client(&keys, id);
            tracing::info!(client_id = %id, subscriptions = keys.len(), "client unregistered");
        }
    }

    /// Subscribe a client under the composite key for the given filters.
    /// Always answers with a confirmation frame.
    pub fn subscribe(
        &self,
        id: &ClientId,
        run_id: Option<RunId>,
        thread_id: Option<ThreadId>,
        event_type: Option<EventType>,
    ) -> Result<SubscriptionKey, GatewayError> {
        if !self.directory.contains(id) {
            return Err(GatewayError::UnknownClient(id.clone()));
        }

        let key = SubscriptionKey::compose(run_id.as_ref(), thread_id.as_ref(), event_type.as_ref());
        tracing::debug!(client_id = %id, key = %key, "subscribe");

        self.directory.track_subscription(id, key.clone());
        self.subscriptions.add(key.clone(), id.clone());

        self.send_frame(
            id,
            &ServerFrame::SubscriptionConfirmation {
                subscription_key: key.clone(),
                run_id,
                thread_id,
                event_type,
                timestamp: Utc::now(),
            },
        );
        Ok(key)
    }

    /// Remove a subscription. A no-op for pairs that were never subscribed.
    pub fn unsubscribe(
        &self,
        id: &ClientId,
        run_id: Option<RunId>,
        thread_id: Option<ThreadId>,
        event_type: Option<EventType>,
    ) {
        let key = SubscriptionKey::compose(run_id.as_ref(), thread_id.as_ref(), event_type.as_ref());
        tracing::debug!(client_id = %id, key = %key, "unsubscribe");
        self.directory.untrack_subscription(id, &key);
        self.subscriptions.remove(&key, id);
    }

    /// Emit an event to every matching subscriber. Returns the number of
    /// clients the event was queued for.
    pub fn emit(&self, event: Event) -> usize {
        self.emit_with_metadata(event, &Map::new())
    }

    /// Emit with extra enrichment metadata merged into the event.
    ///
    /// A malformed event is converted into a synthesized `RunError` describing
    /// the failure rather than surfaced to the producer.
    pub fn emit_with_metadata(&self, event: Event, enrichment: &Map<String, Value>) -> usize {
        match self.dispatch(event.clone(), enrichment) {
            Ok(delivered) => delivered,
            Err(error) => {
                tracing::error!(
                    error = %error,
                    event_type = %event.event_type,
                    "event emission failed"
                );
                let synthesized = emission_failure_event(&event, &error);
                match self.dispatch(synthesized, &Map::new()) {
                    Ok(delivered) => delivered,
                    Err(inner) => {
                        tracing::error!(error = %inner, "synthesized error event also failed");
                        0
                    }
                }
            }
        }
    }

    fn dispatch(
        &self,
        mut event: Event,
        enrichment: &Map<String, Value>,
    ) -> Result<usize, GatewayError> {
        event.validate()?;
        event.enrich(enrichment, Utc::now());

        self.runs.record(&event);
        match self.runs.observe(&event) {
            RunTransition::Created => {
                tracing::info!(run_id = ?event.run_id, "run started");
            }
            RunTransition::Updated(status) => {
                tracing::info!(run_id = ?event.run_id, status = ?status, "run status changed");
            }
            RunTransition::None => {}
        }

        let targets = self.subscriptions.resolve(&event);
        if targets.is_empty() {
            return Ok(0);
        }

        let Ok(frame) = serde_json::to_string(&event) else {
            tracing::error!(event_type = %event.event_type, "event not serializable");
            return Ok(0);
        };

        let mut delivered = 0;
        for client_id in targets {
            if self.directory.send_to(&client_id, frame.clone()) {
                delivered += 1;
            } else {
                tracing::warn!(client_id = %client_id, "skipping undeliverable client");
            }
        }
        tracing::debug!(
            event_type = %event.event_type,
            delivered,
            "event fanned out"
        );
        Ok(delivered)
    }

    /// Queue a server frame for one client.
    pub fn send_frame(&self, id: &ClientId, frame: &ServerFrame) -> bool {
        match frame.encode() {
            Some(text) => self.directory.send_to(id, text),
            None => false,
        }
    }

    pub fn run_status(&self, run_id: &RunId) -> Option<Run> {
        self.runs.run(run_id)
    }

    pub fn run_history(&self, run_id: &RunId) -> Vec<Event> {
        self.runs.history(run_id)
    }

    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.directory.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.directory.len()
    }

    /// Purge expired runs and history.
    pub fn sweep(&self) -> usize {
        let removed = self.runs.sweep();
        if removed > 0 {
            tracing::info!(removed, "run retention sweep");
        }
        removed
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

fn emission_failure_event(source: &Event, error: &GatewayError) -> Event {
    let mut event = Event::new(EventType::RunError);
    event.run_id = Some(source.run_id.clone().unwrap_or_default());
    event.thread_id = source.thread_id.clone();
    event.payload.insert(
        "message".into(),
        Value::String(format!("event emission error: {error}")),
    );
    event
        .payload
        .insert("code".into(), Value::String("EVENT_EMISSION_ERROR".into()));
    event
}

/// Periodically sweep expired runs.
pub fn start_sweep_task(
    gateway: Arc<Gateway>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate tick
        loop {
            ticker.tick().await;
            gateway.sweep();
        }
    })
}
