//! Reactive request adapter
//!
//! `SwrScope` carries the ambient configuration together with the shared
//! cache, contract handle store and metrics. `SwrScope::request` binds a
//! descriptor to the cache: it derives the key, attaches subscriptions,
//! mounts the fetch and returns a `Resource` exposing the live snapshot.
//!
//! Re-evaluating a resource with an unchanged key, unchanged subscription
//! descriptors and the same collaborators leaves its listeners alone. Any
//! change tears the old listeners down before new ones are attached. The
//! mounted fetch is rebuilt from the effective configuration on every
//! re-evaluation. Dropping a resource detaches everything.

use crate::abi::{resolve_abi, AbiRegistry};
use crate::cache::{FetchFn, FetchOutcome, Snapshot, SwrCache};
use crate::config::{CacheSettings, Settings, SwrConfig};
use crate::error::{SwrError, SwrResult};
use crate::fetcher::{FetchStrategy, LedgerFetcher};
use crate::key::{CacheKey, RequestKey};
use crate::ledger::{ContractFactory, LedgerClient};
use crate::metrics::SwrMetrics;
use crate::store::ContractStore;
use crate::subscription::{Subscription, SubscriptionSet};
use futures_util::future::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

/// Where a request's descriptor comes from
#[derive(Clone)]
pub enum KeySource {
    Key(RequestKey),
    /// Evaluated on every `request` / `reconfigure`; `None` means inactive
    Lazy(Arc<dyn Fn() -> Option<RequestKey> + Send + Sync>),
    /// Inactive request: no fetch, no subscriptions
    None,
}

impl KeySource {
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn() -> Option<RequestKey> + Send + Sync + 'static,
    {
        Self::Lazy(Arc::new(f))
    }

    pub fn evaluate(&self) -> Option<RequestKey> {
        match self {
            Self::Key(key) => Some(key.clone()),
            Self::Lazy(f) => f(),
            Self::None => None,
        }
    }
}

impl From<RequestKey> for KeySource {
    fn from(key: RequestKey) -> Self {
        Self::Key(key)
    }
}

impl From<Option<RequestKey>> for KeySource {
    fn from(key: Option<RequestKey>) -> Self {
        key.map(Self::Key).unwrap_or(Self::None)
    }
}

impl From<Vec<Value>> for KeySource {
    fn from(parts: Vec<Value>) -> Self {
        Self::Key(RequestKey::new(parts))
    }
}

/// Ambient configuration scope
#[derive(Clone)]
pub struct SwrScope {
    config: SwrConfig,
    defaults: CacheSettings,
    cache: SwrCache,
    store: Arc<ContractStore>,
    metrics: Option<Arc<SwrMetrics>>,
}

impl SwrScope {
    pub fn new(config: SwrConfig) -> Self {
        let defaults = CacheSettings::default();
        Self {
            config,
            cache: SwrCache::new(defaults.capacity),
            defaults,
            store: Arc::new(ContractStore::new()),
            metrics: None,
        }
    }

    /// Scope sized and defaulted from loaded settings
    pub fn from_settings(settings: &Settings, config: SwrConfig) -> Self {
        Self {
            config,
            cache: SwrCache::new(settings.cache.capacity),
            defaults: settings.cache.clone(),
            store: Arc::new(ContractStore::new()),
            metrics: None,
        }
    }

    /// Record metrics for this scope's cache, handle store and fetches
    pub fn with_metrics(mut self, metrics: Arc<SwrMetrics>) -> Self {
        self.cache.attach_metrics(metrics.clone());
        self.store.attach_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Share an existing cache
    pub fn with_cache(mut self, cache: SwrCache) -> Self {
        if let Some(metrics) = &self.metrics {
            cache.attach_metrics(metrics.clone());
        }
        self.cache = cache;
        self
    }

    /// Child scope whose configuration overrides this one field by field
    pub fn nested(&self, overrides: SwrConfig) -> Self {
        Self {
            config: self.config.merge(&overrides),
            ..self.clone()
        }
    }

    pub fn config(&self) -> &SwrConfig {
        &self.config
    }

    pub fn cache(&self) -> &SwrCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<ContractStore> {
        &self.store
    }

    /// Bind a descriptor to the cache
    ///
    /// Setup errors (missing ABI, missing collaborator) are returned here and
    /// leave nothing mounted. Fetch errors surface on the snapshot.
    pub fn request(
        &self,
        source: impl Into<KeySource>,
        overrides: Option<SwrConfig>,
    ) -> SwrResult<Resource> {
        let mut resource = Resource {
            scope: self.clone(),
            binding: None,
        };
        resource.reconfigure(source, overrides)?;
        Ok(resource)
    }

    fn effective(&self, overrides: Option<&SwrConfig>) -> SwrConfig {
        match overrides {
            Some(overrides) => self.config.merge(overrides),
            None => self.config.clone(),
        }
    }

    fn fetch_fn(&self, key: &RequestKey, config: &SwrConfig) -> FetchFn {
        let strategy: Arc<dyn FetchStrategy> = match &config.fetch_strategy {
            Some(strategy) => strategy.clone(),
            None => {
                let fetcher = LedgerFetcher::from_config(config, self.store.clone());
                match &self.metrics {
                    Some(metrics) => Arc::new(fetcher.with_metrics(metrics.clone())),
                    None => Arc::new(fetcher),
                }
            }
        };
        let key = key.clone();
        Arc::new(move || {
            let strategy = strategy.clone();
            let key = key.clone();
            async move { strategy.resolve(&key).await }.boxed()
        })
    }

    /// Hold the contract handles a key reads through
    ///
    /// Targets without a resolvable ABI or factory are skipped; the fetch
    /// reports those errors.
    fn hold_contracts(&self, key: &RequestKey, config: &SwrConfig) -> Vec<String> {
        let Some(factory) = config.contracts.as_ref() else {
            return Vec::new();
        };
        let signer = config.ledger.as_ref().and_then(|l| l.signer_address());

        let mut held = Vec::new();
        for address in contract_targets(key, config) {
            match resolve_abi(config.abis.as_deref(), &address) {
                Ok(abi) => {
                    self.store
                        .acquire(&address, abi, signer.as_deref(), factory.as_ref());
                    held.push(address);
                }
                Err(error) => {
                    tracing::trace!(address = %address, error = %error, "Contract handle not held");
                }
            }
        }
        held
    }

    fn release_contracts(&self, held: &[String]) {
        for address in held {
            self.store.release(address);
        }
    }
}

/// Addresses whose handles a fetch for `key` goes through
fn contract_targets(key: &RequestKey, config: &SwrConfig) -> Vec<String> {
    if !key.is_batch() {
        return key.contract_target().map(str::to_string).into_iter().collect();
    }
    if config.multicall.is_some() {
        return Vec::new();
    }
    key.entries()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.contract_target().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn same_arc<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Collaborators that listeners and held handles were set up with
#[derive(Clone, Default)]
struct Collaborators {
    ledger: Option<Arc<dyn LedgerClient>>,
    contracts: Option<Arc<dyn ContractFactory>>,
    abis: Option<Arc<AbiRegistry>>,
}

impl Collaborators {
    fn of(config: &SwrConfig) -> Self {
        Self {
            ledger: config.ledger.clone(),
            contracts: config.contracts.clone(),
            abis: config.abis.clone(),
        }
    }

    fn same(&self, other: &Self) -> bool {
        same_arc(&self.ledger, &other.ledger)
            && same_arc(&self.contracts, &other.contracts)
            && same_arc(&self.abis, &other.abis)
    }
}

struct Binding {
    key: RequestKey,
    cache_key: CacheKey,
    /// Descriptors of the attached set; `None` after a failed setup
    descriptors: Option<Vec<Subscription>>,
    collaborators: Collaborators,
    contracts: Vec<String>,
    fetch: FetchFn,
    rx: watch::Receiver<Snapshot>,
    subscriptions: SubscriptionSet,
}

/// A descriptor bound to the cache
pub struct Resource {
    scope: SwrScope,
    binding: Option<Binding>,
}

impl Resource {
    /// Re-evaluate with a (possibly) new descriptor and overrides
    ///
    /// Keeps listeners in place when the key, the subscription descriptors
    /// and the collaborators are unchanged. The fetch always follows the
    /// latest configuration.
    pub fn reconfigure(
        &mut self,
        source: impl Into<KeySource>,
        overrides: Option<SwrConfig>,
    ) -> SwrResult<()> {
        let source: KeySource = source.into();
        let Some(key) = source.evaluate() else {
            self.unbind();
            return Ok(());
        };
        let config = self.scope.effective(overrides.as_ref());
        let cache_key = key.cache_key();

        if let Some(binding) = self.binding.as_mut() {
            if binding.cache_key == cache_key {
                let fetch = self.scope.fetch_fn(&key, &config);
                self.scope.cache.replace_fetch(&cache_key, fetch.clone());
                binding.fetch = fetch;

                let collaborators = Collaborators::of(&config);
                let unchanged = binding.collaborators.same(&collaborators)
                    && binding.descriptors.as_deref() == Some(config.subscriptions());
                if unchanged {
                    tracing::trace!(key = %cache_key, "Request unchanged");
                    return Ok(());
                }

                binding.subscriptions.teardown();
                binding.descriptors = None;
                if !binding.collaborators.same(&collaborators) {
                    let previous = std::mem::take(&mut binding.contracts);
                    binding.contracts = self.scope.hold_contracts(&key, &config);
                    self.scope.release_contracts(&previous);
                    binding.collaborators = collaborators;
                }
                binding.subscriptions = SubscriptionSet::setup(
                    &key,
                    &config,
                    &self.scope.cache,
                    &self.scope.store,
                    self.scope.metrics.clone(),
                )?;
                binding.descriptors = Some(config.subscriptions().to_vec());
                tracing::debug!(
                    key = %cache_key,
                    listeners = binding.subscriptions.len(),
                    "Subscriptions replaced"
                );
                return Ok(());
            }
        }

        self.unbind();
        let subscriptions = SubscriptionSet::setup(
            &key,
            &config,
            &self.scope.cache,
            &self.scope.store,
            self.scope.metrics.clone(),
        )?;
        let contracts = self.scope.hold_contracts(&key, &config);
        let fetch = self.scope.fetch_fn(&key, &config);
        let rx = self.scope.cache.mount(
            &cache_key,
            fetch.clone(),
            config
                .revalidate_on_mount
                .unwrap_or(self.scope.defaults.revalidate_on_mount),
            config
                .dedupe_interval
                .unwrap_or_else(|| self.scope.defaults.dedupe_interval()),
        );
        tracing::debug!(key = %cache_key, listeners = subscriptions.len(), "Request mounted");

        self.binding = Some(Binding {
            key,
            cache_key,
            descriptors: Some(config.subscriptions().to_vec()),
            collaborators: Collaborators::of(&config),
            contracts,
            fetch,
            rx,
            subscriptions,
        });
        Ok(())
    }

    /// Whether a descriptor is bound
    pub fn is_active(&self) -> bool {
        self.binding.is_some()
    }

    pub fn key(&self) -> Option<&RequestKey> {
        self.binding.as_ref().map(|b| &b.key)
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.binding.as_ref().map(|b| &b.cache_key)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.binding
            .as_ref()
            .map(|b| b.rx.borrow().clone())
            .unwrap_or_default()
    }

    pub fn data(&self) -> Option<Value> {
        self.binding
            .as_ref()
            .and_then(|b| b.rx.borrow().data.clone())
    }

    pub fn error(&self) -> Option<Arc<SwrError>> {
        self.binding
            .as_ref()
            .and_then(|b| b.rx.borrow().error.clone())
    }

    pub fn is_validating(&self) -> bool {
        self.binding
            .as_ref()
            .map(|b| b.rx.borrow().is_validating)
            .unwrap_or(false)
    }

    /// Listeners attached for this request
    pub fn listener_count(&self) -> usize {
        self.binding
            .as_ref()
            .map(|b| b.subscriptions.len())
            .unwrap_or(0)
    }

    /// Write to this request's key; no-op when inactive
    pub fn mutate(&self, data: Option<Value>, revalidate: bool) {
        if let Some(binding) = &self.binding {
            self.scope.cache.mutate(&binding.cache_key, data, revalidate);
        }
    }

    /// Fetch now (joining any fetch in flight); `Ok(None)` when inactive
    pub async fn revalidate(&self) -> Result<Option<Value>, Arc<SwrError>> {
        let Some(binding) = &self.binding else {
            return Ok(None);
        };
        let outcome: FetchOutcome = self
            .scope
            .cache
            .revalidate(&binding.cache_key, binding.fetch.clone())
            .await;
        outcome.map(Some)
    }

    /// Wait for the next snapshot; `false` when inactive
    pub async fn changed(&mut self) -> bool {
        match self.binding.as_mut() {
            Some(binding) => binding.rx.changed().await.is_ok(),
            None => false,
        }
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for<F>(&mut self, predicate: F) -> Option<Snapshot>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let binding = self.binding.as_mut()?;
        binding
            .rx
            .wait_for(predicate)
            .await
            .ok()
            .map(|snapshot| snapshot.clone())
    }

    fn unbind(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        let Binding {
            cache_key,
            contracts,
            rx,
            mut subscriptions,
            ..
        } = binding;
        subscriptions.teardown();
        self.scope.release_contracts(&contracts);
        drop(rx);
        self.scope.cache.unmount(&cache_key);
        tracing::debug!(key = %cache_key, "Request unmounted");
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        self.unbind();
    }
}
