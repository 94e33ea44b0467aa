//! Prometheus metrics for chain_swr
//!
//! - Fetches by request kind
//! - Cache hits and deduplicated revalidations
//! - Event triggers by update path (optimistic / pessimistic)
//! - Active listener and contract handle gauges

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics state
pub struct SwrMetrics {
    /// Prometheus registry
    registry: Registry,
    /// Fetches dispatched, by request kind (base, contract, batch)
    pub fetches: IntCounterVec,
    /// Mount-time reads served from a fresh entry
    pub cache_hits: IntCounter,
    /// Revalidations that joined an in-flight fetch
    pub deduplicated: IntCounter,
    /// Subscription events, by path (optimistic, pessimistic)
    pub event_triggers: IntCounterVec,
    /// Listeners currently attached by subscriptions
    pub active_listeners: IntGauge,
    /// Contract handles currently held in the store
    pub contract_handles: IntGauge,
}

impl SwrMetrics {
    /// Create a new metrics state with all metrics registered
    pub fn new() -> Self {
        let registry = Registry::new();

        let fetches = IntCounterVec::new(
            Opts::new("chain_swr_fetches_total", "Fetches dispatched by request kind"),
            &["kind"],
        )
        .expect("Failed to create fetches counter");
        registry
            .register(Box::new(fetches.clone()))
            .expect("Failed to register fetches");

        let cache_hits = IntCounter::with_opts(Opts::new(
            "chain_swr_cache_hits_total",
            "Mount-time reads served from a fresh entry",
        ))
        .expect("Failed to create cache_hits counter");
        registry
            .register(Box::new(cache_hits.clone()))
            .expect("Failed to register cache_hits");

        let deduplicated = IntCounter::with_opts(Opts::new(
            "chain_swr_deduplicated_total",
            "Revalidations joined to an in-flight fetch",
        ))
        .expect("Failed to create deduplicated counter");
        registry
            .register(Box::new(deduplicated.clone()))
            .expect("Failed to register deduplicated");

        let event_triggers = IntCounterVec::new(
            Opts::new(
                "chain_swr_event_triggers_total",
                "Subscription events by update path",
            ),
            &["path"],
        )
        .expect("Failed to create event_triggers counter");
        registry
            .register(Box::new(event_triggers.clone()))
            .expect("Failed to register event_triggers");

        let active_listeners = IntGauge::with_opts(Opts::new(
            "chain_swr_active_listeners",
            "Listeners attached by subscriptions",
        ))
        .expect("Failed to create active_listeners gauge");
        registry
            .register(Box::new(active_listeners.clone()))
            .expect("Failed to register active_listeners");

        let contract_handles = IntGauge::with_opts(Opts::new(
            "chain_swr_contract_handles",
            "Contract handles held in the store",
        ))
        .expect("Failed to create contract_handles gauge");
        registry
            .register(Box::new(contract_handles.clone()))
            .expect("Failed to register contract_handles");

        Self {
            registry,
            fetches,
            cache_hits,
            deduplicated,
            event_triggers,
            active_listeners,
            contract_handles,
        }
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for SwrMetrics {
    fn default() -> Self {
        Self::new()
    }
}
