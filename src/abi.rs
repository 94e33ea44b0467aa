//! ABI registry
//!
//! Maps contract addresses to their interface descriptors. The address
//! predicate defined here is the only place deciding "contract call" versus
//! "base ledger query".

use crate::error::{SwrError, SwrResult};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Length of an address in bytes
const ADDRESS_BYTES: usize = 20;

/// Whether a string is shaped like a contract address (`0x` + 40 hex digits, any case)
pub fn is_address(candidate: &str) -> bool {
    let Some(digits) = candidate
        .strip_prefix("0x")
        .or_else(|| candidate.strip_prefix("0X"))
    else {
        return false;
    };
    digits.len() == ADDRESS_BYTES * 2
        && hex::decode(digits)
            .map(|bytes| bytes.len() == ADDRESS_BYTES)
            .unwrap_or(false)
}

/// Method and event names exposed by a contract
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    methods: BTreeSet<String>,
    events: BTreeSet<String>,
    /// Raw JSON ABI, kept for collaborators that encode calls
    raw: Option<Value>,
}

impl InterfaceDescriptor {
    /// Build a descriptor from method and event names
    pub fn new<M, E>(methods: M, events: E) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
            events: events.into_iter().map(Into::into).collect(),
            raw: None,
        }
    }

    /// Build a descriptor from a standard JSON ABI document
    pub fn from_json_abi(abi: &Value) -> SwrResult<Self> {
        let items = abi
            .as_array()
            .ok_or_else(|| SwrError::Abi("JSON ABI must be an array".to_string()))?;

        let mut methods = BTreeSet::new();
        let mut events = BTreeSet::new();
        for item in items {
            let name = item.get("name").and_then(Value::as_str);
            match (item.get("type").and_then(Value::as_str), name) {
                (Some("function"), Some(name)) => {
                    methods.insert(name.to_string());
                }
                (Some("event"), Some(name)) => {
                    events.insert(name.to_string());
                }
                _ => {}
            }
        }

        Ok(Self {
            methods,
            events,
            raw: Some(abi.clone()),
        })
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.contains(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(String::as_str)
    }

    pub fn raw(&self) -> Option<&Value> {
        self.raw.as_ref()
    }
}

/// Address → interface descriptor mapping
///
/// Addresses are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct AbiRegistry {
    entries: HashMap<String, Arc<InterfaceDescriptor>>,
}

impl AbiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the descriptor for an address
    pub fn insert(&mut self, address: &str, abi: InterfaceDescriptor) {
        self.entries.insert(address.to_ascii_lowercase(), Arc::new(abi));
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn with(mut self, address: &str, abi: InterfaceDescriptor) -> Self {
        self.insert(address, abi);
        self
    }

    /// Descriptor for an address, if registered
    pub fn lookup(&self, address: &str) -> Option<Arc<InterfaceDescriptor>> {
        self.entries.get(&address.to_ascii_lowercase()).cloned()
    }

    /// Descriptor for an address, failing with `AbiNotFound`
    pub fn require(&self, address: &str) -> SwrResult<Arc<InterfaceDescriptor>> {
        self.lookup(address)
            .ok_or_else(|| SwrError::AbiNotFound(address.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve the descriptor for a contract-targeted request
///
/// A missing registry is a wiring defect (`Abi`); a missing entry is a lookup
/// failure (`AbiNotFound`).
pub fn resolve_abi(
    registry: Option<&AbiRegistry>,
    address: &str,
) -> SwrResult<Arc<InterfaceDescriptor>> {
    let registry = registry.ok_or_else(|| SwrError::Abi("ABI repo not found".to_string()))?;
    registry.require(address)
}
