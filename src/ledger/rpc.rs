//! JSON-RPC ledger client
//!
//! Maps ledger method names onto `eth_*` calls over HTTP and provides the
//! `"block"` event by polling `eth_blockNumber`. The poller starts with the
//! first block listener and stops when the last one is removed.

use super::{EventFilter, EventHub, LedgerClient, Listener, ListenerId};
use crate::config::RpcSettings;
use crate::error::LedgerError;
use crate::request::BlockTag;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Node-level event emitted on every new block
pub const BLOCK_EVENT: &str = "block";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Ledger client backed by a JSON-RPC HTTP endpoint
pub struct JsonRpcLedgerClient {
    inner: Arc<RpcInner>,
    signer: Option<String>,
}

struct RpcInner {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    hub: EventHub,
    poll_interval: Duration,
    poller: Mutex<Option<CancellationToken>>,
}

impl JsonRpcLedgerClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_settings(&RpcSettings {
            url: url.into(),
            ..RpcSettings::default()
        })
    }

    pub fn from_settings(settings: &RpcSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            inner: Arc::new(RpcInner {
                http,
                url: settings.url.clone(),
                next_id: AtomicU64::new(1),
                hub: EventHub::new(),
                poll_interval: Duration::from_millis(settings.poll_interval_ms),
                poller: Mutex::new(None),
            }),
            signer: settings.signer.clone(),
        }
    }

    /// Bind a signer address used for self-referential queries
    pub fn with_signer(mut self, signer: impl Into<String>) -> Self {
        self.signer = Some(signer.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Whether the block poller is running
    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .as_ref()
            .map(|token| !token.is_cancelled())
            .unwrap_or(false)
    }

    /// Emit an event to local listeners as if the node had produced it
    pub fn emit(&self, name: &str, args: &[Value]) -> usize {
        self.inner.hub.emit(name, args)
    }

    fn ensure_poller(&self) {
        let mut poller = self.inner.poller.lock();
        if poller.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No tokio runtime available, block events will not be polled");
                return;
            }
        };

        let token = CancellationToken::new();
        runtime.spawn(poll_blocks(self.inner.clone(), token.clone()));
        *poller = Some(token);
    }

    fn stop_poller_if_idle(&self) {
        if self.inner.hub.listener_count_by_name(BLOCK_EVENT) > 0 {
            return;
        }
        if let Some(token) = self.inner.poller.lock().take() {
            token.cancel();
        }
    }
}

impl RpcInner {
    async fn send(&self, method: &str, params: &[Value]) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, method, "JSON-RPC request");

        let response = self
            .http
            .post(&self.url)
            .json(&RpcRequest {
                jsonrpc: "2.0",
                id,
                method,
                params,
            })
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Transport(format!("HTTP {} from {}", status, self.url)));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))?;

        decode_response(body)
    }
}

async fn poll_blocks(inner: Arc<RpcInner>, cancel_token: CancellationToken) {
    tracing::info!(
        url = %inner.url,
        interval_ms = inner.poll_interval.as_millis() as u64,
        "Starting block poller"
    );

    let mut interval = tokio::time::interval(inner.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_seen: Option<u64> = None;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::info!("Block poller shutting down");
                break;
            }
            _ = interval.tick() => {
                let number = match inner.send("eth_blockNumber", &[]).await.and_then(|v| parse_quantity(&v)) {
                    Ok(number) => number,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to poll block number");
                        continue;
                    }
                };

                match last_seen {
                    Some(previous) if number <= previous => {
                        tracing::trace!(block = number, "No new block");
                    }
                    Some(_) => {
                        last_seen = Some(number);
                        let listeners = inner.hub.emit(BLOCK_EVENT, &[json!(number)]);
                        tracing::debug!(block = number, listeners, "New block");
                    }
                    None => {
                        last_seen = Some(number);
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn query(&self, method: &str, params: &[Value]) -> Result<Value, LedgerError> {
        let (rpc_method, rpc_params) = encode_query(method, params)?;
        self.inner.send(rpc_method, &rpc_params).await
    }

    fn signer_address(&self) -> Option<String> {
        self.signer.clone()
    }

    fn on(&self, filter: EventFilter, listener: Listener) -> ListenerId {
        let is_block = filter.address().is_none() && filter.name() == BLOCK_EVENT;
        let id = self.inner.hub.on(filter, listener);
        if is_block {
            self.ensure_poller();
        }
        id
    }

    fn off(&self, filter: &EventFilter, id: ListenerId) -> bool {
        let removed = self.inner.hub.off(filter, id);
        self.stop_poller_if_idle();
        removed
    }

    fn remove_all_listeners(&self, filter: &EventFilter) {
        self.inner.hub.remove_all_listeners(filter);
        self.stop_poller_if_idle();
    }
}

impl Drop for JsonRpcLedgerClient {
    fn drop(&mut self) {
        if let Some(token) = self.inner.poller.lock().take() {
            token.cancel();
        }
    }
}

/// Translate a ledger method and positional params into a JSON-RPC call
pub fn encode_query(method: &str, params: &[Value]) -> Result<(&'static str, Vec<Value>), LedgerError> {
    let encoded = match method {
        "getBalance" => ("eth_getBalance", vec![param(params, 0), block_param(params, 1)]),
        "getTransactionCount" => (
            "eth_getTransactionCount",
            vec![param(params, 0), block_param(params, 1)],
        ),
        "getCode" => ("eth_getCode", vec![param(params, 0), block_param(params, 1)]),
        "getStorageAt" => (
            "eth_getStorageAt",
            vec![param(params, 0), quantity_param(params, 1), block_param(params, 2)],
        ),
        "call" => ("eth_call", vec![param(params, 0), block_param(params, 1)]),
        "getBlockNumber" => ("eth_blockNumber", Vec::new()),
        "getGasPrice" => ("eth_gasPrice", Vec::new()),
        "getChainId" => ("eth_chainId", Vec::new()),
        "getBlock" => match params.first().and_then(BlockTag::from_value) {
            Some(BlockTag::Hash(hash)) => ("eth_getBlockByHash", vec![json!(hash), json!(false)]),
            _ => ("eth_getBlockByNumber", vec![block_param(params, 0), json!(false)]),
        },
        "getTransaction" => ("eth_getTransactionByHash", vec![param(params, 0)]),
        "getTransactionReceipt" => ("eth_getTransactionReceipt", vec![param(params, 0)]),
        other => return Err(LedgerError::Unsupported(other.to_string())),
    };
    Ok(encoded)
}

fn param(params: &[Value], position: usize) -> Value {
    params.get(position).cloned().unwrap_or(Value::Null)
}

fn block_param(params: &[Value], position: usize) -> Value {
    params
        .get(position)
        .and_then(BlockTag::from_value)
        .unwrap_or_default()
        .to_rpc()
}

fn quantity_param(params: &[Value], position: usize) -> Value {
    match params.get(position) {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| json!(format!("0x{:x}", n)))
            .unwrap_or_else(|| Value::Number(n.clone())),
        Some(other) => other.clone(),
        None => json!("0x0"),
    }
}

fn decode_response(body: RpcResponse) -> Result<Value, LedgerError> {
    if let Some(error) = body.error {
        // code 3 carries revert data
        if error.code == 3 || error.message.contains("revert") {
            return Err(LedgerError::Revert(error.message));
        }
        return Err(LedgerError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    Ok(body.result.unwrap_or(Value::Null))
}

/// Parse a hex quantity such as `"0x1b4"`
pub fn parse_quantity(value: &Value) -> Result<u64, LedgerError> {
    let text = value
        .as_str()
        .ok_or_else(|| LedgerError::Decode(format!("expected hex quantity, got {}", value)))?;
    let digits = text
        .strip_prefix("0x")
        .ok_or_else(|| LedgerError::Decode(format!("missing 0x prefix: {}", text)))?;
    u64::from_str_radix(digits, 16).map_err(|e| LedgerError::Decode(format!("{}: {}", text, e)))
}
