//! Ledger-side collaborators
//!
//! The core never talks to a node directly. It goes through these traits:
//! - `LedgerClient` - base queries and node-level events
//! - `ContractFactory` / `Contract` - contract handles, calls and event filters
//! - `MulticallProvider` - several reads in one round trip

mod emitter;
mod rpc;

pub use emitter::*;
pub use rpc::*;

use crate::abi::InterfaceDescriptor;
use crate::error::LedgerError;
use crate::key::canonical_json;
use crate::request::{BlockTag, CallOverrides};
use serde_json::Value;
use std::sync::Arc;

/// Event callback; receives the event arguments
pub type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Identifier returned by `on`, used to remove exactly that listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// What a listener is attached to
///
/// Node-level events carry no address. Contract events carry the contract
/// address and positional topic filters (`None` matches anything); topics are
/// stored in canonical JSON so filters compare and hash by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventFilter {
    address: Option<String>,
    name: String,
    topics: Vec<Option<String>>,
}

impl EventFilter {
    /// Node-level event such as `"block"`
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            address: None,
            name: name.into(),
            topics: Vec::new(),
        }
    }

    /// Contract event with positional topic filters
    pub fn contract(address: &str, name: impl Into<String>, topics: &[Option<Value>]) -> Self {
        Self {
            address: Some(address.to_ascii_lowercase()),
            name: name.into(),
            topics: topics
                .iter()
                .map(|topic| topic.as_ref().map(canonical_json))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Whether an emitted event satisfies this filter
    pub fn matches(&self, address: Option<&str>, name: &str, args: &[Value]) -> bool {
        let same_source = match (&self.address, address) {
            (None, None) => true,
            (Some(own), Some(other)) => own.eq_ignore_ascii_case(other),
            _ => false,
        };
        if !same_source || self.name != name {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, topic)| match topic {
            None => true,
            Some(expected) => args
                .get(i)
                .map(|arg| canonical_json(arg).eq_ignore_ascii_case(expected))
                .unwrap_or(false),
        })
    }
}

/// Node connection used for base queries and node-level events
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    /// Run a base query by ledger method name with positional params
    async fn query(&self, method: &str, params: &[Value]) -> Result<Value, LedgerError>;

    /// Address of the signer bound to this session, if any
    fn signer_address(&self) -> Option<String> {
        None
    }

    /// Attach a listener
    fn on(&self, filter: EventFilter, listener: Listener) -> ListenerId;

    /// Remove one listener; returns whether it was attached
    fn off(&self, filter: &EventFilter, id: ListenerId) -> bool;

    /// Remove every listener attached to a filter
    fn remove_all_listeners(&self, filter: &EventFilter);
}

/// Callable contract bound to an address
#[async_trait::async_trait]
pub trait Contract: Send + Sync {
    fn address(&self) -> &str;

    /// Invoke a read method
    async fn call(
        &self,
        method: &str,
        params: &[Value],
        overrides: &CallOverrides,
    ) -> Result<Value, LedgerError>;

    /// Build an event filter from an event name and positional topics
    fn filter(&self, event: &str, topics: &[Option<Value>]) -> EventFilter {
        EventFilter::contract(self.address(), event, topics)
    }

    fn on(&self, filter: EventFilter, listener: Listener) -> ListenerId;

    fn off(&self, filter: &EventFilter, id: ListenerId) -> bool;

    fn remove_all_listeners(&self, filter: &EventFilter);
}

/// Builds contract handles
pub trait ContractFactory: Send + Sync {
    fn connect(
        &self,
        address: &str,
        abi: Arc<InterfaceDescriptor>,
        signer: Option<&str>,
    ) -> Arc<dyn Contract>;
}

/// One read inside an aggregated round trip
#[derive(Debug, Clone)]
pub enum AggregateCall {
    Base {
        method: String,
        params: Vec<Value>,
    },
    Contract {
        address: String,
        abi: Arc<InterfaceDescriptor>,
        method: String,
        params: Vec<Value>,
    },
}

/// Executes several reads in a single round trip at one block
#[async_trait::async_trait]
pub trait MulticallProvider: Send + Sync {
    async fn aggregate(
        &self,
        calls: Vec<AggregateCall>,
        block: &BlockTag,
    ) -> Result<Vec<Value>, LedgerError>;
}
