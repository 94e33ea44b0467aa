//! chain_swr
//!
//! Stale-while-revalidate cache for ledger reads. Requests are described as
//! ordered lists of JSON values, fetched through a ledger client or contract
//! handles, cached under a canonical key and kept fresh by ledger events.

pub mod abi;
pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod hooks;
pub mod key;
pub mod ledger;
pub mod metrics;
pub mod request;
pub mod store;
pub mod subscription;

pub use abi::{is_address, resolve_abi, AbiRegistry, InterfaceDescriptor};
pub use adapter::{KeySource, Resource, SwrScope};
pub use cache::{FetchFn, FetchOutcome, Snapshot, SwrCache};
pub use config::{CacheSettings, RpcSettings, Settings, SwrConfig};
pub use error::{LedgerError, SwrError, SwrResult};
pub use fetcher::{FetchStrategy, LedgerFetcher};
pub use hooks::{use_balance, use_balance_of, use_balances, Addresses};
pub use key::{normalize, CacheKey, RequestKey};
pub use ledger::{
    AggregateCall, Contract, ContractFactory, EventFilter, EventHub, JsonRpcLedgerClient,
    LedgerClient, Listener, ListenerId, MulticallProvider,
};
pub use metrics::SwrMetrics;
pub use request::{BlockTag, CallOverrides, Request};
pub use store::ContractStore;
pub use subscription::{EventContext, EventHandler, EventSubscription, Mutator, Subscription};
