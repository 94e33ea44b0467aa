//! Fetch strategy resolver
//!
//! Turns a request descriptor into a value by classifying it once and
//! dispatching on the result:
//! - Base queries go to the ledger client
//! - Contract calls go through the ABI registry and the contract handle store
//! - Batches run as independent concurrent calls, or as one aggregated round
//!   trip when a multicall provider is configured
//!
//! No retries happen here; failures propagate to the cache unchanged.

use crate::abi::{is_address, resolve_abi, AbiRegistry};
use crate::config::SwrConfig;
use crate::error::{LedgerError, SwrError, SwrResult};
use crate::key::RequestKey;
use crate::ledger::{AggregateCall, Contract, ContractFactory, LedgerClient, MulticallProvider};
use crate::metrics::SwrMetrics;
use crate::request::{BaseQuery, BlockTag, ContractCall, Request};
use crate::store::ContractStore;
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::Arc;

/// Resolves a descriptor into a value
#[async_trait::async_trait]
pub trait FetchStrategy: Send + Sync {
    async fn resolve(&self, key: &RequestKey) -> SwrResult<Value>;
}

/// Default strategy built from the ledger-side collaborators of a configuration
pub struct LedgerFetcher {
    ledger: Option<Arc<dyn LedgerClient>>,
    abis: Option<Arc<AbiRegistry>>,
    contracts: Option<Arc<dyn ContractFactory>>,
    multicall: Option<Arc<dyn MulticallProvider>>,
    store: Arc<ContractStore>,
    metrics: Option<Arc<SwrMetrics>>,
}

impl LedgerFetcher {
    pub fn from_config(config: &SwrConfig, store: Arc<ContractStore>) -> Self {
        Self {
            ledger: config.ledger.clone(),
            abis: config.abis.clone(),
            contracts: config.contracts.clone(),
            multicall: config.multicall.clone(),
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SwrMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn signer(&self) -> Option<String> {
        self.ledger.as_ref().and_then(|ledger| ledger.signer_address())
    }

    async fn resolve_single(&self, request: &Request) -> SwrResult<Value> {
        match request {
            Request::Base(query) => self.resolve_base(query).await,
            Request::Contract(call) => self.resolve_contract(call).await,
            Request::Batch(_) => Err(SwrError::InvalidRequest(
                "nested batches are not supported".to_string(),
            )),
        }
    }

    async fn resolve_base(&self, query: &BaseQuery) -> SwrResult<Value> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or(SwrError::MissingCollaborator("ledger client"))?;
        let params = fill_signer(query, self.signer().as_deref());
        Ok(ledger.query(&query.method, &params).await?)
    }

    async fn resolve_contract(&self, call: &ContractCall) -> SwrResult<Value> {
        let handle = self.contract_handle(&call.address)?;
        Ok(handle
            .call(&call.method, &call.params, &call.overrides)
            .await?)
    }

    fn contract_handle(&self, address: &str) -> SwrResult<Arc<dyn Contract>> {
        let abi = resolve_abi(self.abis.as_deref(), address)?;
        let factory = self
            .contracts
            .as_ref()
            .ok_or(SwrError::MissingCollaborator("contract factory"))?;
        Ok(self
            .store
            .get_or_connect(address, abi, self.signer().as_deref(), factory.as_ref()))
    }

    async fn resolve_batch(&self, entries: &[Request]) -> SwrResult<Value> {
        match &self.multicall {
            Some(multicall) => self.resolve_aggregated(multicall.as_ref(), entries).await,
            None => self.resolve_independent(entries).await,
        }
    }

    async fn resolve_independent(&self, entries: &[Request]) -> SwrResult<Value> {
        let results = join_all(entries.iter().map(|entry| self.resolve_single(entry))).await;
        // first failure in input order wins, after every call has settled
        let values = results.into_iter().collect::<SwrResult<Vec<_>>>()?;
        Ok(Value::Array(values))
    }

    async fn resolve_aggregated(
        &self,
        multicall: &dyn MulticallProvider,
        entries: &[Request],
    ) -> SwrResult<Value> {
        let signer = self.signer();

        let mut calls = Vec::with_capacity(entries.len());
        let mut tags = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Request::Base(query) => {
                    // block position is read after the signer shifts params
                    let filled = BaseQuery {
                        method: query.method.clone(),
                        params: fill_signer(query, signer.as_deref()),
                    };
                    tags.push(filled.block_tag());
                    calls.push(AggregateCall::Base {
                        method: filled.method,
                        params: filled.params,
                    });
                }
                Request::Contract(call) => {
                    tags.push(call.block_tag());
                    calls.push(AggregateCall::Contract {
                        address: call.address.clone(),
                        abi: resolve_abi(self.abis.as_deref(), &call.address)?,
                        method: call.method.clone(),
                        params: call.params.clone(),
                    });
                }
                Request::Batch(_) => {
                    return Err(SwrError::InvalidRequest(
                        "nested batches are not supported".to_string(),
                    ))
                }
            }
        }
        let block = common_block_tag(tags)?;

        let expected = calls.len();
        tracing::debug!(calls = expected, block = %block, "Dispatching aggregated batch");
        let values = multicall.aggregate(calls, &block).await?;
        if values.len() != expected {
            return Err(LedgerError::Decode(format!(
                "aggregated batch returned {} results for {} calls",
                values.len(),
                expected
            ))
            .into());
        }
        Ok(Value::Array(values))
    }
}

#[async_trait::async_trait]
impl FetchStrategy for LedgerFetcher {
    async fn resolve(&self, key: &RequestKey) -> SwrResult<Value> {
        let request = Request::classify(key)?;
        tracing::debug!(key = %key.cache_key(), kind = request.kind(), "Dispatching fetch");
        if let Some(metrics) = &self.metrics {
            metrics.fetches.with_label_values(&[request.kind()]).inc();
        }

        match &request {
            Request::Batch(entries) => self.resolve_batch(entries).await,
            single => self.resolve_single(single).await,
        }
    }
}

/// Block reference shared by every entry of an aggregated batch
fn common_block_tag(tags: impl IntoIterator<Item = BlockTag>) -> SwrResult<BlockTag> {
    let mut tags = tags.into_iter();
    let first = tags.next().unwrap_or_default();
    for tag in tags {
        if tag != first {
            return Err(SwrError::MixedBlockTags {
                first: first.to_string(),
                second: tag.to_string(),
            });
        }
    }
    Ok(first)
}

/// Positional params for a base query, with the signer filling a missing account
///
/// Applies to address-first methods only. A null first param is replaced; a
/// block reference in first position is shifted right; any other string is
/// treated as the caller's account and kept.
pub fn fill_signer(query: &BaseQuery, signer: Option<&str>) -> Vec<Value> {
    let Some(signer) = signer else {
        return query.params.clone();
    };
    if !query.takes_address_first() {
        return query.params.clone();
    }

    let mut params = query.params.clone();
    match params.first() {
        None => params.push(Value::String(signer.to_string())),
        Some(Value::Null) => params[0] = Value::String(signer.to_string()),
        Some(Value::String(s)) if is_address(s) || s.starts_with("0x") => {}
        Some(first) if BlockTag::is_placeholder(first) => {
            params.insert(0, Value::String(signer.to_string()))
        }
        Some(_) => {}
    }
    params
}
