//! Change notifications for grants, keyed by grant id

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantEventKind {
    Updated,
    Revoked,
}

/// Something happened to a grant. Subscribers re-fetch the grant for details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantEvent {
    pub grant_id: String,
    pub kind: GrantEventKind,
}

pub trait GrantListener: Send + Sync {
    fn on_grant_event(&self, event: &GrantEvent);
}

impl<F> GrantListener for F
where
    F: Fn(&GrantEvent) + Send + Sync,
{
    fn on_grant_event(&self, event: &GrantEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listeners = HashMap<String, Vec<(SubscriptionId, Arc<dyn GrantListener>)>>;

#[derive(Clone, Default)]
pub struct GrantEvents {
    listeners: Arc<RwLock<Listeners>>,
    next_id: Arc<AtomicU64>,
}

impl GrantEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, grant_id: &str, listener: Arc<dyn GrantListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(grant_id.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Returns false when the subscription was already gone
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        listeners.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|(id, _)| *id != subscription);
            removed |= subscribers.len() != before;
            !subscribers.is_empty()
        });
        removed
    }

    /// Deliver `event` to the grant's subscribers.
    ///
    /// Listeners run after the registry lock is released, so they may
    /// subscribe or unsubscribe from inside the callback.
    pub fn publish(&self, event: &GrantEvent) {
        let subscribers: Vec<Arc<dyn GrantListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.grant_id)
            .map(|subscribers| subscribers.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in subscribers {
            listener.on_grant_event(event);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, grant_id: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(grant_id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<GrantEvent>>>, Arc<dyn GrantListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn GrantListener> = Arc::new(move |event: &GrantEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        (seen, listener)
    }

    fn event(grant_id: &str, kind: GrantEventKind) -> GrantEvent {
        GrantEvent {
            grant_id: grant_id.to_string(),
            kind,
        }
    }

    #[test]
    fn test_publish_reaches_only_matching_grant() {
        let events = GrantEvents::new();
        let (seen_a, listener_a) = recorder();
        let (seen_b, listener_b) = recorder();
        events.subscribe("a", listener_a);
        events.subscribe("b", listener_b);

        events.publish(&event("a", GrantEventKind::Updated));

        assert_eq!(*seen_a.lock().unwrap(), vec![event("a", GrantEventKind::Updated)]);
        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let events = GrantEvents::new();
        let (seen, listener) = recorder();
        let id = events.subscribe("a", listener);

        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        assert_eq!(events.subscriber_count("a"), 0);

        events.publish(&event("a", GrantEventKind::Revoked));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let events = GrantEvents::new();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let registry = events.clone();
        let own_id = Arc::clone(&slot);
        let id = events.subscribe(
            "a",
            Arc::new(move |_: &GrantEvent| {
                if let Some(id) = own_id.lock().unwrap().take() {
                    registry.unsubscribe(id);
                }
            }),
        );
        *slot.lock().unwrap() = Some(id);

        events.publish(&event("a", GrantEventKind::Updated));
        assert_eq!(events.subscriber_count("a"), 0);
    }
}
