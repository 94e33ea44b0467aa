//! Event subscriptions that keep cache entries fresh
//!
//! A request may carry subscription descriptors. When it mounts, one listener
//! per descriptor is attached, either on the ledger client (the target is a
//! method name) or on the contract handle (the target is an address). A
//! firing listener takes one of two paths:
//! - Optimistic: the descriptor's `on_event` handler receives the current
//!   value, the event arguments and a mutator bound to the request's key
//! - Pessimistic: without a handler, the key is re-fetched
//!
//! Batches attach nothing.

use crate::abi::resolve_abi;
use crate::cache::SwrCache;
use crate::config::SwrConfig;
use crate::error::{SwrError, SwrResult};
use crate::key::{CacheKey, RequestKey};
use crate::ledger::{Contract, EventFilter, LedgerClient, Listener, ListenerId};
use crate::metrics::SwrMetrics;
use crate::store::ContractStore;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Optimistic update callback
pub type EventHandler = Arc<dyn Fn(EventContext) + Send + Sync>;

/// Everything an `on_event` handler gets when its event fires
pub struct EventContext {
    /// Cached value for the request's key at the time of the event
    pub current: Option<Value>,
    /// Event arguments as emitted
    pub args: Vec<Value>,
    /// Writes to the request's key
    pub mutator: Mutator,
}

/// Cache writer bound to one key
#[derive(Clone)]
pub struct Mutator {
    cache: SwrCache,
    key: CacheKey,
}

impl Mutator {
    pub fn new(cache: SwrCache, key: CacheKey) -> Self {
        Self { cache, key }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn current(&self) -> Option<Value> {
        self.cache.get(&self.key)
    }

    /// Write `data` (or invalidate when `None`), optionally re-fetching afterwards
    pub fn mutate(&self, data: Option<Value>, revalidate: bool) {
        self.cache.mutate(&self.key, data, revalidate);
    }
}

/// Subscription descriptor
#[derive(Clone)]
pub enum Subscription {
    /// Event by name, no topic filter, re-fetch on fire
    Event(String),
    /// Event with topic filters and/or an optimistic handler
    Filter(EventSubscription),
}

/// Event name with positional topic filters and an optional handler
#[derive(Clone)]
pub struct EventSubscription {
    name: String,
    topics: Vec<Option<Value>>,
    on_event: Option<EventHandler>,
}

impl Subscription {
    pub fn event(name: impl Into<String>) -> Self {
        Self::Event(name.into())
    }

    /// Start a descriptor with topics or a handler
    pub fn filter(name: impl Into<String>) -> EventSubscription {
        EventSubscription {
            name: name.into(),
            topics: Vec::new(),
            on_event: None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Event(name) => name,
            Self::Filter(filter) => &filter.name,
        }
    }

    pub fn topics(&self) -> &[Option<Value>] {
        match self {
            Self::Event(_) => &[],
            Self::Filter(filter) => &filter.topics,
        }
    }

    pub fn handler(&self) -> Option<&EventHandler> {
        match self {
            Self::Event(_) => None,
            Self::Filter(filter) => filter.on_event.as_ref(),
        }
    }
}

impl EventSubscription {
    /// Positional topic filters; `None` matches anything
    pub fn topics(mut self, topics: Vec<Option<Value>>) -> Self {
        self.topics = topics;
        self
    }

    /// Handle the event optimistically instead of re-fetching
    pub fn on_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(EventContext) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(handler));
        self
    }
}

impl From<EventSubscription> for Subscription {
    fn from(filter: EventSubscription) -> Self {
        Self::Filter(filter)
    }
}

impl From<&str> for Subscription {
    fn from(name: &str) -> Self {
        Self::Event(name.to_string())
    }
}

impl From<String> for Subscription {
    fn from(name: String) -> Self {
        Self::Event(name)
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        let same_handler = match (self.handler(), other.handler()) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.name() == other.name() && self.topics() == other.topics() && same_handler
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(name) => f.debug_tuple("Event").field(name).finish(),
            Self::Filter(filter) => f
                .debug_struct("Filter")
                .field("name", &filter.name)
                .field("topics", &filter.topics)
                .field("on_event", &filter.on_event.is_some())
                .finish(),
        }
    }
}

enum Attached {
    Ledger {
        ledger: Arc<dyn LedgerClient>,
        filter: EventFilter,
        id: ListenerId,
    },
    Contract {
        handle: Arc<dyn Contract>,
        filter: EventFilter,
        id: ListenerId,
    },
}

/// Listeners attached for one request; detached on drop
#[derive(Default)]
pub struct SubscriptionSet {
    attached: Vec<Attached>,
    held: Option<(Arc<ContractStore>, String)>,
    metrics: Option<Arc<SwrMetrics>>,
}

impl SubscriptionSet {
    /// Attach listeners for a request's subscription descriptors
    pub fn setup(
        key: &RequestKey,
        config: &SwrConfig,
        cache: &SwrCache,
        store: &Arc<ContractStore>,
        metrics: Option<Arc<SwrMetrics>>,
    ) -> SwrResult<Self> {
        let mut set = Self {
            attached: Vec::new(),
            held: None,
            metrics,
        };
        let subscriptions = config.subscriptions();
        if subscriptions.is_empty() || key.is_batch() {
            return Ok(set);
        }
        let cache_key = key.cache_key();

        if let Some(address) = key.contract_target() {
            let abi = resolve_abi(config.abis.as_deref(), address)?;
            if abi.events().next().is_some() {
                if let Some(unknown) = subscriptions.iter().find(|s| !abi.has_event(s.name())) {
                    return Err(SwrError::InvalidRequest(format!(
                        "event {} is not declared for {}",
                        unknown.name(),
                        address
                    )));
                }
            }
            let factory = config
                .contracts
                .as_ref()
                .ok_or(SwrError::MissingCollaborator("contract factory"))?;
            let signer = config.ledger.as_ref().and_then(|l| l.signer_address());

            let handle = store.acquire(address, abi, signer.as_deref(), factory.as_ref());
            set.held = Some((store.clone(), address.to_string()));

            for subscription in subscriptions {
                let filter = handle.filter(subscription.name(), subscription.topics());
                let listener = set.listener(subscription, cache, &cache_key);
                let id = handle.on(filter.clone(), listener);
                set.attach(Attached::Contract {
                    handle: handle.clone(),
                    filter,
                    id,
                });
            }
        } else {
            let Some(ledger) = config.ledger.as_ref() else {
                tracing::debug!(key = %cache_key, "No ledger client, subscriptions skipped");
                return Ok(set);
            };
            for subscription in subscriptions {
                let filter = EventFilter::named(subscription.name());
                let listener = set.listener(subscription, cache, &cache_key);
                let id = ledger.on(filter.clone(), listener);
                set.attach(Attached::Ledger {
                    ledger: ledger.clone(),
                    filter,
                    id,
                });
            }
        }

        tracing::debug!(key = %cache_key, listeners = set.len(), "Subscriptions attached");
        Ok(set)
    }

    /// Number of attached listeners
    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }

    /// Detach every listener and release the contract handle
    pub fn teardown(&mut self) {
        let detached = self.attached.len();
        for attached in self.attached.drain(..) {
            match attached {
                Attached::Ledger { ledger, filter, id } => {
                    ledger.off(&filter, id);
                }
                Attached::Contract { handle, filter, id } => {
                    handle.off(&filter, id);
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.active_listeners.sub(detached as i64);
        }
        if let Some((store, address)) = self.held.take() {
            store.release(&address);
        }
        if detached > 0 {
            tracing::debug!(listeners = detached, "Subscriptions detached");
        }
    }

    fn attach(&mut self, attached: Attached) {
        if let Some(metrics) = &self.metrics {
            metrics.active_listeners.inc();
        }
        self.attached.push(attached);
    }

    fn listener(&self, subscription: &Subscription, cache: &SwrCache, key: &CacheKey) -> Listener {
        let cache = cache.clone();
        let key = key.clone();
        let metrics = self.metrics.clone();
        let event = subscription.name().to_string();

        match subscription.handler().cloned() {
            Some(handler) => Arc::new(move |args: &[Value]| {
                tracing::trace!(key = %key, event = %event, "Optimistic update");
                if let Some(metrics) = &metrics {
                    metrics.event_triggers.with_label_values(&["optimistic"]).inc();
                }
                let mutator = Mutator::new(cache.clone(), key.clone());
                handler(EventContext {
                    current: mutator.current(),
                    args: args.to_vec(),
                    mutator,
                });
            }),
            None => Arc::new(move |_args: &[Value]| {
                tracing::trace!(key = %key, event = %event, "Event refresh");
                if let Some(metrics) = &metrics {
                    metrics.event_triggers.with_label_values(&["pessimistic"]).inc();
                }
                cache.invalidate(&key, true);
            }),
        }
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.teardown();
    }
}
