//! Subscription registry: key -> set of client ids.
//!
//! Buckets are garbage-collected on the last removal so steady-state memory
//! tracks active subscriptions, not churn.

use std::collections::HashSet;

use dashmap::DashMap;

use relay_core::event::Event;
use relay_core::ids::ClientId;
use relay_core::key::SubscriptionKey;

pub struct SubscriptionRegistry {
    buckets: DashMap<SubscriptionKey, HashSet<ClientId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    pub fn add(&self, key: SubscriptionKey, client: ClientId) {
        self.buckets.entry(key).or_default().insert(client);
    }

    /// Remove a client from a bucket; a no-op when not subscribed. The bucket
    /// itself is dropped once empty.
    pub fn remove(&self, key: &SubscriptionKey, client: &ClientId) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.remove(client);
        }
        self.buckets.remove_if(key, |_, bucket| bucket.is_empty());
    }

    /// Drop a client from every bucket it was subscribed under.
    pub fn purge_client(&self, keys: &[SubscriptionKey], client: &ClientId) {
        for key in keys {
            self.remove(key, client);
        }
    }

    /// Compute the delivery set for an event: the union of subscribers under
    /// every candidate key, deduplicated by client id.
    pub fn resolve(&self, event: &Event) -> HashSet<ClientId> {
        let mut targets = HashSet::new();
        for key in candidate_keys(event) {
            if let Some(bucket) = self.buckets.get(&key) {
                targets.extend(bucket.iter().cloned());
            }
        }
        targets
    }

    pub fn contains_key(&self, key: &SubscriptionKey) -> bool {
        self.buckets.contains_key(key)
    }

    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.buckets.get(key).map(|bucket| bucket.len()).unwrap_or(0)
    }

    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The candidate keys an event can match: run, thread, type, run+thread, and
/// the wildcard. Absent components simply contribute no key.
fn candidate_keys(event: &Event) -> Vec<SubscriptionKey> {
    let mut keys = Vec::with_capacity(5);
    if let Some(run) = &event.run_id {
        keys.push(SubscriptionKey::compose(Some(run), None, None));
    }
    if let Some(thread) = &event.thread_id {
        keys.push(SubscriptionKey::compose(None, Some(thread), None));
    }
    keys.push(SubscriptionKey::compose(
        None,
        None,
        Some(&event.event_type),
    ));
    if let (Some(run), Some(thread)) = (&event.run_id, &event.thread_id) {
        keys.push(SubscriptionKey::compose(Some(run), Some(thread), None));
    }
    keys.push(SubscriptionKey::all());
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::event::EventType;
    use relay_core::ids::{RunId, ThreadId};

    fn event(run: Option<&str>, thread: Option<&str>, event_type: EventType) -> Event {
        Event {
            run_id: run.map(RunId::from_raw),
            thread_id: thread.map(ThreadId::from_raw),
            ..Event::new(event_type)
        }
    }

    fn run_key(run: &str) -> SubscriptionKey {
        SubscriptionKey::compose(Some(&RunId::from_raw(run)), None, None)
    }

    fn type_key(event_type: &EventType) -> SubscriptionKey {
        SubscriptionKey::compose(None, None, Some(event_type))
    }

    #[test]
    fn empty_buckets_do_not_persist() {
        let registry = SubscriptionRegistry::new();
        let client = ClientId::new();
        let key = run_key("r1");

        registry.add(key.clone(), client.clone());
        assert!(registry.contains_key(&key));

        registry.remove(&key, &client);
        assert!(!registry.contains_key(&key));
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn remove_is_noop_when_not_subscribed() {
        let registry = SubscriptionRegistry::new();
        registry.remove(&run_key("r1"), &ClientId::new());
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn bucket_survives_while_other_subscribers_remain() {
        let registry = SubscriptionRegistry::new();
        let a = ClientId::new();
        let b = ClientId::new();
        let key = run_key("r1");

        registry.add(key.clone(), a.clone());
        registry.add(key.clone(), b);
        registry.remove(&key, &a);

        assert!(registry.contains_key(&key));
        assert_eq!(registry.subscriber_count(&key), 1);
    }

    #[test]
    fn type_subscription_matches_any_run() {
        let registry = SubscriptionRegistry::new();
        let by_type = ClientId::new();
        let by_other_run = ClientId::new();

        registry.add(type_key(&EventType::RunFinished), by_type.clone());
        registry.add(run_key("r2"), by_other_run.clone());

        let targets = registry.resolve(&event(Some("r1"), None, EventType::RunFinished));
        assert!(targets.contains(&by_type));
        assert!(!targets.contains(&by_other_run));
    }

    #[test]
    fn wildcard_matches_everything() {
        let registry = SubscriptionRegistry::new();
        let watcher = ClientId::new();
        registry.add(SubscriptionKey::all(), watcher.clone());

        let targets = registry.resolve(&event(None, None, EventType::TextMessageContent));
        assert!(targets.contains(&watcher));
    }

    #[test]
    fn overlapping_subscriptions_deliver_once() {
        let registry = SubscriptionRegistry::new();
        let client = ClientId::new();

        // Same client under both a run key and a type key that both match.
        registry.add(run_key("r1"), client.clone());
        registry.add(type_key(&EventType::RunError), client.clone());

        let targets = registry.resolve(&event(Some("r1"), None, EventType::RunError));
        assert_eq!(targets.len(), 1);
        assert!(targets.contains(&client));
    }

    #[test]
    fn run_thread_combination_key_matches() {
        let registry = SubscriptionRegistry::new();
        let client = ClientId::new();
        let key = SubscriptionKey::compose(
            Some(&RunId::from_raw("r1")),
            Some(&ThreadId::from_raw("t1")),
            None,
        );
        registry.add(key, client.clone());

        let targets = registry.resolve(&event(Some("r1"), Some("t1"), EventType::StateDelta));
        assert!(targets.contains(&client));

        // Thread mismatch: the combined key does not fire.
        let targets = registry.resolve(&event(Some("r1"), Some("t2"), EventType::StateDelta));
        assert!(!targets.contains(&client));
    }

    #[test]
    fn purge_client_clears_all_buckets() {
        let registry = SubscriptionRegistry::new();
        let client = ClientId::new();
        let keys = vec![run_key("r1"), type_key(&EventType::RunError), SubscriptionKey::all()];

        for key in &keys {
            registry.add(key.clone(), client.clone());
        }
        registry.purge_client(&keys, &client);
        assert_eq!(registry.key_count(), 0);
    }
}
