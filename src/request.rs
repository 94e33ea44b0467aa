//! Request classification
//!
//! Turns a raw descriptor into a tagged union once, so every later stage
//! matches on `Request` instead of re-inspecting the descriptor's shape.

use crate::abi::is_address;
use crate::error::{SwrError, SwrResult};
use crate::key::{RequestKey, MAX_KEY_PARTS};
use serde_json::Value;
use std::fmt;

/// Base methods whose first parameter is an account address
pub const ADDRESS_FIRST_METHODS: &[&str] =
    &["getBalance", "getTransactionCount", "getCode", "getStorageAt"];

/// Block reference used as call context
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BlockTag {
    #[default]
    Latest,
    Pending,
    Earliest,
    Safe,
    Finalized,
    Number(u64),
    Hash(String),
}

impl BlockTag {
    /// Parse a block reference from a descriptor value
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self::Number),
            Value::String(s) => match s.as_str() {
                "latest" => Some(Self::Latest),
                "pending" => Some(Self::Pending),
                "earliest" => Some(Self::Earliest),
                "safe" => Some(Self::Safe),
                "finalized" => Some(Self::Finalized),
                hex if hex.starts_with("0x") && hex.len() == 66 => {
                    Some(Self::Hash(hex.to_ascii_lowercase()))
                }
                hex if hex.starts_with("0x") && !is_address(hex) => {
                    u64::from_str_radix(&hex[2..], 16).ok().map(Self::Number)
                }
                decimal => decimal.parse().ok().map(Self::Number),
            },
            _ => None,
        }
    }

    /// Whether a value is a block reference rather than an account (named tag or number)
    pub fn is_placeholder(value: &Value) -> bool {
        match value {
            Value::Null | Value::Number(_) => true,
            Value::String(s) => matches!(
                s.as_str(),
                "latest" | "pending" | "earliest" | "safe" | "finalized"
            ),
            _ => false,
        }
    }

    /// JSON-RPC encoding
    pub fn to_rpc(&self) -> Value {
        match self {
            Self::Number(n) => Value::String(format!("0x{:x}", n)),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Pending => write!(f, "pending"),
            Self::Earliest => write!(f, "earliest"),
            Self::Safe => write!(f, "safe"),
            Self::Finalized => write!(f, "finalized"),
            Self::Number(n) => write!(f, "{}", n),
            Self::Hash(h) => write!(f, "{}", h),
        }
    }
}

/// Call context taken from a contract call's trailing options object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOverrides {
    pub block_tag: Option<BlockTag>,
    pub from: Option<String>,
}

impl CallOverrides {
    fn from_object(options: &serde_json::Map<String, Value>) -> SwrResult<Self> {
        let block_tag = match options.get("blockTag") {
            None | Some(Value::Null) => None,
            Some(value) => Some(BlockTag::from_value(value).ok_or_else(|| {
                SwrError::InvalidRequest(format!("unrecognized blockTag {}", value))
            })?),
        };
        let from = options.get("from").and_then(Value::as_str).map(str::to_string);
        Ok(Self { block_tag, from })
    }
}

/// Base ledger query
#[derive(Debug, Clone, PartialEq)]
pub struct BaseQuery {
    pub method: String,
    pub params: Vec<Value>,
}

impl BaseQuery {
    /// Positional block reference for methods that take one
    pub fn block_tag(&self) -> BlockTag {
        let position = match self.method.as_str() {
            "getBalance" | "getTransactionCount" | "getCode" | "call" => 1,
            "getStorageAt" => 2,
            _ => return BlockTag::Latest,
        };
        self.params
            .get(position)
            .and_then(BlockTag::from_value)
            .unwrap_or_default()
    }

    pub fn takes_address_first(&self) -> bool {
        ADDRESS_FIRST_METHODS.contains(&self.method.as_str())
    }
}

/// Named method call on a contract
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCall {
    pub address: String,
    pub method: String,
    pub params: Vec<Value>,
    pub overrides: CallOverrides,
}

impl ContractCall {
    pub fn block_tag(&self) -> BlockTag {
        self.overrides.block_tag.clone().unwrap_or_default()
    }
}

/// Classified request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Base(BaseQuery),
    Contract(ContractCall),
    Batch(Vec<Request>),
}

impl Request {
    /// Classify a descriptor
    pub fn classify(key: &RequestKey) -> SwrResult<Self> {
        if key.is_batch() {
            let entries = key
                .entries()?
                .iter()
                .map(|entry| {
                    if entry.is_batch() {
                        return Err(SwrError::InvalidRequest(
                            "nested batches are not supported".to_string(),
                        ));
                    }
                    Self::classify_single(entry.parts())
                })
                .collect::<SwrResult<Vec<_>>>()?;
            return Ok(Self::Batch(entries));
        }
        Self::classify_single(key.parts())
    }

    fn classify_single(parts: &[Value]) -> SwrResult<Self> {
        if parts.is_empty() {
            return Err(SwrError::InvalidRequest("empty descriptor".to_string()));
        }
        if parts.len() > MAX_KEY_PARTS {
            return Err(SwrError::InvalidRequest(format!(
                "descriptor has {} elements, at most {} allowed",
                parts.len(),
                MAX_KEY_PARTS
            )));
        }

        let target = parts[0].as_str().ok_or_else(|| {
            SwrError::InvalidRequest(format!("target must be a string, got {}", parts[0]))
        })?;

        if !is_address(target) {
            return Ok(Self::Base(BaseQuery {
                method: target.to_string(),
                params: parts[1..].to_vec(),
            }));
        }

        let method = parts
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SwrError::InvalidRequest(format!("contract call on {} needs a method name", target))
            })?
            .to_string();

        let mut params = parts[2..].to_vec();
        let overrides = match params.last() {
            Some(Value::Object(options)) => {
                let overrides = CallOverrides::from_object(options)?;
                params.pop();
                overrides
            }
            _ => CallOverrides::default(),
        };

        Ok(Self::Contract(ContractCall {
            address: target.to_string(),
            method,
            params,
            overrides,
        }))
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Base(_) => "base",
            Self::Contract(_) => "contract",
            Self::Batch(_) => "batch",
        }
    }

    /// Block reference this request reads at
    pub fn block_tag(&self) -> BlockTag {
        match self {
            Self::Base(query) => query.block_tag(),
            Self::Contract(call) => call.block_tag(),
            Self::Batch(_) => BlockTag::Latest,
        }
    }
}
