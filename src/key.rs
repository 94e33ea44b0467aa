//! Request descriptors and cache keys
//!
//! A request descriptor is an ordered list of JSON values:
//! - `["getBalance", "0x…", "latest"]` - base ledger query
//! - `["0x…contract", "balanceOf", "0x…owner"]` - contract call
//! - `[["getBalance", "0x01"], ["getBalance", "0x02"]]` - batch
//!
//! Every cache key is produced by [`normalize`], so code that needs to peek
//! or invalidate an entry recomputes exactly the key the fetch was stored under.

use crate::error::{SwrError, SwrResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Maximum number of elements in a single (non-batch) descriptor
pub const MAX_KEY_PARTS: usize = 5;

/// Separator between encoded elements of a single descriptor
const KEY_SEPARATOR: char = '|';

/// Ordered request descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(Vec<Value>);

impl RequestKey {
    /// Create a descriptor from its elements
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    /// Create a batch descriptor from sub-descriptors
    pub fn batch(entries: Vec<RequestKey>) -> Self {
        Self(entries.into_iter().map(|e| Value::Array(e.0)).collect())
    }

    /// Parse a descriptor from a JSON array
    pub fn parse(value: Value) -> SwrResult<Self> {
        match value {
            Value::Array(parts) if !parts.is_empty() => Ok(Self(parts)),
            Value::Array(_) => Err(SwrError::InvalidRequest("empty descriptor".to_string())),
            other => Err(SwrError::InvalidRequest(format!(
                "descriptor must be an array, got {}",
                other
            ))),
        }
    }

    /// Elements of the descriptor
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// First element, used for dispatch and subscription keying
    pub fn target(&self) -> Option<&Value> {
        self.0.first()
    }

    /// Whether the first element is itself a descriptor
    pub fn is_batch(&self) -> bool {
        matches!(self.0.first(), Some(Value::Array(_)))
    }

    /// Contract address target, if the first element is address-shaped
    pub fn contract_target(&self) -> Option<&str> {
        self.target()
            .and_then(Value::as_str)
            .filter(|target| crate::abi::is_address(target))
    }

    /// Sub-descriptors of a batch
    pub fn entries(&self) -> SwrResult<Vec<RequestKey>> {
        self.0
            .iter()
            .map(|entry| match entry {
                Value::Array(parts) => Ok(RequestKey(parts.clone())),
                other => Err(SwrError::InvalidRequest(format!(
                    "batch entry must be an array, got {}",
                    other
                ))),
            })
            .collect()
    }

    /// Cache key for this descriptor
    pub fn cache_key(&self) -> CacheKey {
        normalize(self)
    }
}

impl From<Vec<Value>> for RequestKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

/// Canonical, string-comparable cache key
///
/// Cloning shares the underlying string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a descriptor into its cache key
///
/// Batches serialize their whole nested structure as canonical JSON. Single
/// descriptors join the canonical JSON of each element with `|`. Every
/// encoded element is self-delimiting (a `|` can only occur inside a quoted
/// string), so distinct descriptors cannot collide.
pub fn normalize(key: &RequestKey) -> CacheKey {
    let mut out = String::new();
    if key.is_batch() {
        write_canonical(&Value::Array(key.0.clone()), &mut out);
    } else {
        for (i, part) in key.0.iter().enumerate() {
            if i > 0 {
                out.push(KEY_SEPARATOR);
            }
            write_canonical(part, &mut out);
        }
    }
    CacheKey(Arc::from(out))
}

/// Encode a value as JSON with object keys in sorted order
pub(crate) fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
