//! In-process event hub
//!
//! Listener registry shared by the JSON-RPC client and test doubles.
//! Listeners run synchronously inside `emit`, in registration order, and the
//! registry lock is released before any listener runs so listeners may
//! re-enter the hub or the cache.

use super::{EventFilter, Listener, ListenerId};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

struct Registration {
    id: ListenerId,
    filter: EventFilter,
    listener: Listener,
}

/// Listener registry with id-based removal
#[derive(Default)]
pub struct EventHub {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener
    pub fn on(&self, filter: EventFilter, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(event = filter.name(), listener = id.0, "Listener attached");
        self.registrations.lock().push(Registration {
            id,
            filter,
            listener,
        });
        id
    }

    /// Remove one listener
    pub fn off(&self, filter: &EventFilter, id: ListenerId) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| !(r.id == id && &r.filter == filter));
        before != registrations.len()
    }

    /// Remove every listener attached to a filter
    pub fn remove_all_listeners(&self, filter: &EventFilter) {
        self.registrations.lock().retain(|r| &r.filter != filter);
    }

    /// Remove all listeners
    pub fn clear(&self) {
        self.registrations.lock().clear();
    }

    /// Number of listeners attached to a filter
    pub fn listener_count(&self, filter: &EventFilter) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| &r.filter == filter)
            .count()
    }

    /// Number of listeners attached to any filter with this event name
    pub fn listener_count_by_name(&self, name: &str) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.filter.name() == name)
            .count()
    }

    /// Total number of listeners
    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit a node-level event; returns how many listeners ran
    pub fn emit(&self, name: &str, args: &[Value]) -> usize {
        self.dispatch(None, name, args)
    }

    /// Emit a contract event; returns how many listeners ran
    pub fn emit_from(&self, address: &str, name: &str, args: &[Value]) -> usize {
        self.dispatch(Some(address), name, args)
    }

    fn dispatch(&self, address: Option<&str>, name: &str, args: &[Value]) -> usize {
        let listeners: Vec<Listener> = self
            .registrations
            .lock()
            .iter()
            .filter(|r| r.filter.matches(address, name, args))
            .map(|r| r.listener.clone())
            .collect();

        for listener in &listeners {
            listener(args);
        }
        listeners.len()
    }
}
