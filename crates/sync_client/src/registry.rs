//! Listener registry.
//!
//! Subscriptions made before the channel is authenticated are held as
//! pending and become live when the session is accepted. Events that arrive
//! before that point are buffered and released in arrival order once the
//! listeners are in place.

use crate::config::RegistryConfig;
use common::Event;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Subscription to every event type.
pub const WILDCARD: &str = "*";

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a listener. Two clones of a [`Listener`] share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Event callback with a stable identity.
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    callback: Callback,
}

impl Listener {
    pub fn new(callback: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self {
            id: ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)),
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    fn call(&self, event: &Event) {
        (self.callback)(event)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}

/// Registration phase of the registry as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No authenticated session; subscriptions and events are held.
    Pending,
    /// Session authenticated; events dispatch immediately.
    Live,
}

type ListenerMap = HashMap<String, Vec<Listener>>;

#[derive(Debug)]
struct State {
    phase: Phase,
    active: ListenerMap,
    pending: ListenerMap,
    buffered: VecDeque<Event>,
}

fn insert_unique(map: &mut ListenerMap, event_type: &str, listener: Listener) -> bool {
    let listeners = map.entry(event_type.to_string()).or_default();
    if listeners.iter().any(|l| l.id == listener.id) {
        return false;
    }
    listeners.push(listener);
    true
}

fn remove_listener(map: &mut ListenerMap, event_type: &str, id: ListenerId) -> bool {
    let Some(listeners) = map.get_mut(event_type) else {
        return false;
    };
    let before = listeners.len();
    listeners.retain(|l| l.id != id);
    let removed = listeners.len() != before;
    if listeners.is_empty() {
        map.remove(event_type);
    }
    removed
}

fn merge_into(target: &mut ListenerMap, source: ListenerMap) {
    for (event_type, listeners) in source {
        for listener in listeners {
            insert_unique(target, &event_type, listener);
        }
    }
}

/// Two-phase registry of event listeners.
#[derive(Debug)]
pub struct ListenerRegistry {
    state: Mutex<State>,
    max_buffered: usize,
}

impl ListenerRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Pending,
                active: HashMap::new(),
                pending: HashMap::new(),
                buffered: VecDeque::new(),
            }),
            max_buffered: config.max_buffered_events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` for `event_type` (or [`WILDCARD`]). Registering the
    /// same listener twice for a type keeps one entry.
    pub fn subscribe(&self, event_type: &str, listener: Listener) {
        let mut state = self.lock();
        let phase = state.phase;
        let map = match phase {
            Phase::Live => &mut state.active,
            Phase::Pending => &mut state.pending,
        };
        if insert_unique(map, event_type, listener) {
            debug!(event_type, ?phase, "Listener subscribed");
        }
    }

    /// Remove `id` from `event_type`, wherever it is held. Returns whether a
    /// listener was removed.
    pub fn unsubscribe(&self, event_type: &str, id: ListenerId) -> bool {
        let mut state = self.lock();
        let removed_active = remove_listener(&mut state.active, event_type, id);
        let removed_pending = remove_listener(&mut state.pending, event_type, id);
        removed_active || removed_pending
    }

    /// Session authenticated: make pending listeners live and return the
    /// events buffered in the meantime, oldest first.
    pub fn activate(&self) -> Vec<Event> {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);
        merge_into(&mut state.active, pending);
        state.phase = Phase::Live;
        let released: Vec<Event> = state.buffered.drain(..).collect();
        info!(
            listeners = count(&state.active),
            released = released.len(),
            "Listener registry live"
        );
        released
    }

    /// Session lost: move live listeners back to pending.
    pub fn deactivate(&self) {
        let mut state = self.lock();
        if state.phase == Phase::Pending {
            return;
        }
        let active = std::mem::take(&mut state.active);
        merge_into(&mut state.pending, active);
        state.phase = Phase::Pending;
        debug!(listeners = count(&state.pending), "Listener registry pending");
    }

    /// Pass an inbound event through the phase gate. Live sessions get the
    /// event back for processing; otherwise it is buffered.
    pub fn admit(&self, event: Event) -> Option<Event> {
        let mut state = self.lock();
        if state.phase == Phase::Live {
            return Some(event);
        }
        if self.max_buffered == 0 {
            warn!(sequence = event.sequence, "Pre-auth buffer disabled, dropping event");
            return None;
        }
        if state.buffered.len() >= self.max_buffered {
            if let Some(dropped) = state.buffered.pop_front() {
                warn!(
                    sequence = dropped.sequence,
                    event_type = %dropped.event_type,
                    "Pre-auth buffer full, dropping oldest event"
                );
            }
        }
        state.buffered.push_back(event);
        None
    }

    /// Call every live listener for the event's type and every wildcard
    /// listener. Returns the number of listeners called.
    pub fn dispatch(&self, event: &Event) -> usize {
        let listeners: Vec<Listener> = {
            let state = self.lock();
            let exact = state.active.get(&event.event_type).into_iter().flatten();
            let wildcard = state.active.get(WILDCARD).into_iter().flatten();
            exact.chain(wildcard).cloned().collect()
        };

        for listener in &listeners {
            listener.call(event);
        }
        listeners.len()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn active_count(&self) -> usize {
        count(&self.lock().active)
    }

    pub fn pending_count(&self) -> usize {
        count(&self.lock().pending)
    }

    pub fn buffered_len(&self) -> usize {
        self.lock().buffered.len()
    }
}

fn count(map: &ListenerMap) -> usize {
    map.values().map(Vec::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn registry(max_buffered_events: usize) -> ListenerRegistry {
        ListenerRegistry::new(&RegistryConfig {
            max_buffered_events,
        })
    }

    fn event(event_type: &str, sequence: u64) -> Event {
        Event::new(event_type, sequence, json!({}), 0)
    }

    fn counting() -> (Listener, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let listener = Listener::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (listener, calls)
    }

    #[test]
    fn test_subscribe_before_auth_is_pending() {
        let registry = registry(10);
        let (listener, calls) = counting();
        registry.subscribe("balance-changed", listener);

        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.dispatch(&event("balance-changed", 1)), 0);

        registry.activate();
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.dispatch(&event("balance-changed", 1)), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_subscribe_installs_once() {
        let registry = registry(10);
        let (listener, calls) = counting();
        registry.subscribe("status-changed", listener.clone());
        registry.activate();
        registry.subscribe("status-changed", listener);

        registry.dispatch(&event("status-changed", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_from_either_map() {
        let registry = registry(10);
        let (pending, _) = counting();
        registry.subscribe("balance-changed", pending.clone());
        assert!(registry.unsubscribe("balance-changed", pending.id()));
        assert!(!registry.unsubscribe("balance-changed", pending.id()));

        registry.activate();
        let (live, _) = counting();
        registry.subscribe("balance-changed", live.clone());
        assert!(registry.unsubscribe("balance-changed", live.id()));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_deactivate_returns_listeners_to_pending() {
        let registry = registry(10);
        let (listener, _) = counting();
        registry.activate();
        registry.subscribe("betting-updated", listener);

        registry.deactivate();
        assert_eq!(registry.phase(), Phase::Pending);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.pending_count(), 1);

        registry.activate();
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_events_buffered_until_activation() {
        let registry = registry(10);
        assert!(registry.admit(event("balance-changed", 1)).is_none());
        assert!(registry.admit(event("balance-changed", 2)).is_none());

        let released = registry.activate();
        assert_eq!(
            released.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(registry.admit(event("balance-changed", 3)).is_some());
        assert_eq!(registry.buffered_len(), 0);
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let registry = registry(2);
        for sequence in 1..=3 {
            registry.admit(event("balance-changed", sequence));
        }
        let released = registry.activate();
        assert_eq!(
            released.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn test_wildcard_receives_all_types() {
        let registry = registry(10);
        let (listener, calls) = counting();
        registry.subscribe(WILDCARD, listener);
        registry.activate();

        registry.dispatch(&event("balance-changed", 1));
        registry.dispatch(&event("agent-created", 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
