//! Configuration management for chain_swr
//!
//! Two layers:
//! - `Settings`: loaded from YAML files and environment variables
//!   (environment variables override YAML values)
//! - `SwrConfig`: runtime request configuration, ambient on a scope and
//!   overridden field-by-field per request

use crate::abi::AbiRegistry;
use crate::fetcher::FetchStrategy;
use crate::ledger::{ContractFactory, LedgerClient, MulticallProvider};
use crate::subscription::Subscription;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Root settings structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Reactive cache settings
    #[serde(default)]
    pub cache: CacheSettings,
    /// JSON-RPC endpoint settings
    #[serde(default)]
    pub rpc: RpcSettings,
}

/// Reactive cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Maximum number of cached keys
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Window in which a fresh entry is served without refetching on mount
    #[serde(default = "default_dedupe_interval")]
    pub dedupe_interval_ms: u64,
    /// Fetch when a request mounts and the entry is not fresh
    #[serde(default = "default_true")]
    pub revalidate_on_mount: bool,
}

fn default_capacity() -> usize {
    1000
}

fn default_dedupe_interval() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            dedupe_interval_ms: default_dedupe_interval(),
            revalidate_on_mount: default_true(),
        }
    }
}

impl CacheSettings {
    pub fn dedupe_interval(&self) -> Duration {
        Duration::from_millis(self.dedupe_interval_ms)
    }
}

/// JSON-RPC endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    /// Node endpoint URL
    #[serde(default = "default_rpc_url")]
    pub url: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_rpc_timeout")]
    pub timeout_ms: u64,
    /// Block polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Address used for self-referential queries
    #[serde(default)]
    pub signer: Option<String>,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_rpc_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    4_000
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            timeout_ms: default_rpc_timeout(),
            poll_interval_ms: default_poll_interval(),
            signer: None,
        }
    }
}

impl Settings {
    /// Load settings from files and environment
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (CHAIN_SWR__*)
    /// 2. config/swr.yaml (if exists)
    /// 3. swr.yaml (if exists)
    /// 4. Default values
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("swr").required(false))
            .add_source(File::with_name("config/swr").required(false))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    /// Load settings from an explicit file, still honoring the environment
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    // CHAIN_SWR__RPC__URL=http://node:8545 -> rpc.url
    fn environment() -> Environment {
        Environment::with_prefix("CHAIN_SWR")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Message(
                "cache.capacity must be greater than 0".to_string(),
            ));
        }

        if self.rpc.url.is_empty() {
            return Err(ConfigError::Message("rpc.url must be set".to_string()));
        }

        if self.rpc.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "rpc.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(signer) = &self.rpc.signer {
            if !crate::abi::is_address(signer) {
                return Err(ConfigError::Message(format!(
                    "rpc.signer is not an address: {}",
                    signer
                )));
            }
        }

        Ok(())
    }
}

/// Request configuration
///
/// Set on a [`SwrScope`](crate::SwrScope) as ambient configuration and passed
/// per request as overrides. Every field left `None` inherits the ambient value.
#[derive(Clone, Default)]
pub struct SwrConfig {
    /// Contract interface descriptors
    pub abis: Option<Arc<AbiRegistry>>,
    /// Node connection for base queries and node-level events
    pub ledger: Option<Arc<dyn LedgerClient>>,
    /// Contract handle constructor
    pub contracts: Option<Arc<dyn ContractFactory>>,
    /// Aggregation capability for batches
    pub multicall: Option<Arc<dyn MulticallProvider>>,
    /// Replaces the default ledger fetcher
    pub fetch_strategy: Option<Arc<dyn FetchStrategy>>,
    /// Events that keep the entry fresh
    pub subscribe: Option<Vec<Subscription>>,
    /// Passed through to the cache
    pub dedupe_interval: Option<Duration>,
    /// Passed through to the cache
    pub revalidate_on_mount: Option<bool>,
}

impl SwrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_abis(mut self, abis: AbiRegistry) -> Self {
        self.abis = Some(Arc::new(abis));
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_contracts(mut self, contracts: Arc<dyn ContractFactory>) -> Self {
        self.contracts = Some(contracts);
        self
    }

    pub fn with_multicall(mut self, multicall: Arc<dyn MulticallProvider>) -> Self {
        self.multicall = Some(multicall);
        self
    }

    pub fn with_fetch_strategy(mut self, strategy: Arc<dyn FetchStrategy>) -> Self {
        self.fetch_strategy = Some(strategy);
        self
    }

    /// Add one subscription descriptor
    pub fn subscribe(mut self, subscription: impl Into<Subscription>) -> Self {
        self.subscribe
            .get_or_insert_with(Vec::new)
            .push(subscription.into());
        self
    }

    pub fn with_dedupe_interval(mut self, interval: Duration) -> Self {
        self.dedupe_interval = Some(interval);
        self
    }

    pub fn with_revalidate_on_mount(mut self, revalidate: bool) -> Self {
        self.revalidate_on_mount = Some(revalidate);
        self
    }

    /// Apply per-request overrides on top of this configuration
    pub fn merge(&self, overrides: &SwrConfig) -> SwrConfig {
        SwrConfig {
            abis: overrides.abis.clone().or_else(|| self.abis.clone()),
            ledger: overrides.ledger.clone().or_else(|| self.ledger.clone()),
            contracts: overrides.contracts.clone().or_else(|| self.contracts.clone()),
            multicall: overrides.multicall.clone().or_else(|| self.multicall.clone()),
            fetch_strategy: overrides
                .fetch_strategy
                .clone()
                .or_else(|| self.fetch_strategy.clone()),
            subscribe: overrides.subscribe.clone().or_else(|| self.subscribe.clone()),
            dedupe_interval: overrides.dedupe_interval.or(self.dedupe_interval),
            revalidate_on_mount: overrides.revalidate_on_mount.or(self.revalidate_on_mount),
        }
    }

    /// Subscription descriptors, empty when none are configured
    pub fn subscriptions(&self) -> &[Subscription] {
        self.subscribe.as_deref().unwrap_or(&[])
    }
}

impl fmt::Debug for SwrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwrConfig")
            .field("abis", &self.abis.as_ref().map(|a| a.len()))
            .field("ledger", &self.ledger.is_some())
            .field("contracts", &self.contracts.is_some())
            .field("multicall", &self.multicall.is_some())
            .field("fetch_strategy", &self.fetch_strategy.is_some())
            .field("subscribe", &self.subscribe)
            .field("dedupe_interval", &self.dedupe_interval)
            .field("revalidate_on_mount", &self.revalidate_on_mount)
            .finish()
    }
}
