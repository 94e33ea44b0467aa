//! Contract handle store
//!
//! Holds at most one handle per address (case-insensitive). Mounted requests
//! and subscriptions hold counted references; the handle is evicted when the
//! last one is released. The fetch path reuses held handles and connects a
//! transient one for addresses nobody holds.

use crate::abi::InterfaceDescriptor;
use crate::ledger::{Contract, ContractFactory};
use crate::metrics::SwrMetrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

struct StoredHandle {
    handle: Arc<dyn Contract>,
    holders: usize,
}

/// Address-keyed contract handle store
#[derive(Default)]
pub struct ContractStore {
    handles: Mutex<HashMap<String, StoredHandle>>,
    metrics: OnceLock<Arc<SwrMetrics>>,
}

impl ContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<SwrMetrics>) -> Self {
        let store = Self::default();
        store.attach_metrics(metrics);
        store
    }

    /// Start recording metrics; the first registry attached is kept
    pub fn attach_metrics(&self, metrics: Arc<SwrMetrics>) {
        if self.metrics.set(metrics).is_ok() {
            self.update_gauge(self.len());
        }
    }

    /// Held handle for an address, or a transient one that is not stored
    pub fn get_or_connect(
        &self,
        address: &str,
        abi: Arc<InterfaceDescriptor>,
        signer: Option<&str>,
        factory: &dyn ContractFactory,
    ) -> Arc<dyn Contract> {
        if let Some(handle) = self.get(address) {
            return handle;
        }
        tracing::trace!(address = %address, "Transient contract handle");
        factory.connect(address, abi, signer)
    }

    /// Existing or freshly connected handle, held until `release`
    pub fn acquire(
        &self,
        address: &str,
        abi: Arc<InterfaceDescriptor>,
        signer: Option<&str>,
        factory: &dyn ContractFactory,
    ) -> Arc<dyn Contract> {
        let mut handles = self.handles.lock();
        let stored = self.entry(&mut handles, address, abi, signer, factory);
        stored.holders += 1;
        stored.handle.clone()
    }

    /// Drop one reference; returns whether the handle was evicted
    pub fn release(&self, address: &str) -> bool {
        let key = address.to_ascii_lowercase();
        let mut handles = self.handles.lock();
        let Some(stored) = handles.get_mut(&key) else {
            return false;
        };
        stored.holders = stored.holders.saturating_sub(1);
        if stored.holders > 0 {
            return false;
        }
        handles.remove(&key);
        tracing::debug!(address = %key, "Contract handle evicted");
        self.update_gauge(handles.len());
        true
    }

    pub fn get(&self, address: &str) -> Option<Arc<dyn Contract>> {
        self.handles
            .lock()
            .get(&address.to_ascii_lowercase())
            .map(|stored| stored.handle.clone())
    }

    /// References held by mounted requests and subscriptions for an address
    pub fn holder_count(&self, address: &str) -> usize {
        self.handles
            .lock()
            .get(&address.to_ascii_lowercase())
            .map(|stored| stored.holders)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry<'a>(
        &self,
        handles: &'a mut HashMap<String, StoredHandle>,
        address: &str,
        abi: Arc<InterfaceDescriptor>,
        signer: Option<&str>,
        factory: &dyn ContractFactory,
    ) -> &'a mut StoredHandle {
        let held = handles.len();
        let mut constructed = false;
        let stored = handles
            .entry(address.to_ascii_lowercase())
            .or_insert_with_key(|key| {
                tracing::debug!(address = %key, "Contract handle constructed");
                constructed = true;
                StoredHandle {
                    handle: factory.connect(address, abi, signer),
                    holders: 0,
                }
            });
        if constructed {
            self.update_gauge(held + 1);
        }
        stored
    }

    fn update_gauge(&self, len: usize) {
        if let Some(metrics) = self.metrics.get() {
            metrics.contract_handles.set(len as i64);
        }
    }
}
