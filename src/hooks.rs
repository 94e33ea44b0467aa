//! Balance helpers
//!
//! Thin wrappers that build the usual balance descriptors and bind them
//! through [`SwrScope::request`].

use crate::adapter::{KeySource, Resource, SwrScope};
use crate::config::SwrConfig;
use crate::error::{SwrError, SwrResult};
use crate::key::RequestKey;
use serde_json::{json, Value};

/// One address or a list of them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addresses {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for Addresses {
    fn from(address: &str) -> Self {
        Self::One(address.to_string())
    }
}

impl From<String> for Addresses {
    fn from(address: String) -> Self {
        Self::One(address)
    }
}

impl From<Vec<String>> for Addresses {
    fn from(addresses: Vec<String>) -> Self {
        Self::Many(addresses)
    }
}

impl From<Vec<&str>> for Addresses {
    fn from(addresses: Vec<&str>) -> Self {
        Self::Many(addresses.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Addresses {
    fn from(addresses: &[&str]) -> Self {
        Self::Many(addresses.iter().map(|a| a.to_string()).collect())
    }
}

/// `["getBalance", address, block]`
pub fn balance_key(address: &str, block: impl Into<Value>) -> RequestKey {
    RequestKey::new(vec![json!("getBalance"), json!(address), block.into()])
}

/// Batch of balance descriptors at one block
pub fn balances_key(addresses: &[String], block: impl Into<Value>) -> RequestKey {
    let block = block.into();
    RequestKey::batch(
        addresses
            .iter()
            .map(|address| balance_key(address, block.clone()))
            .collect(),
    )
}

/// Token balance descriptor(s)
///
/// One contract and one owner give a single call. A list on exactly one side
/// gives a batch over that list; an empty list gives no descriptor. Lists on
/// both sides are rejected.
pub fn balance_of_key(contracts: &Addresses, owners: &Addresses) -> SwrResult<Option<RequestKey>> {
    let call = |contract: &str, owner: &str| {
        RequestKey::new(vec![json!(contract), json!("balanceOf"), json!(owner)])
    };

    let key = match (contracts, owners) {
        (Addresses::Many(_), Addresses::Many(_)) => {
            return Err(SwrError::InvalidRequest(
                "either pass multiple contracts or multiple owners".to_string(),
            ))
        }
        (Addresses::One(contract), Addresses::One(owner)) => Some(call(contract, owner)),
        (Addresses::One(contract), Addresses::Many(owners)) => (!owners.is_empty())
            .then(|| RequestKey::batch(owners.iter().map(|owner| call(contract, owner)).collect())),
        (Addresses::Many(contracts), Addresses::One(owner)) => (!contracts.is_empty()).then(|| {
            RequestKey::batch(
                contracts
                    .iter()
                    .map(|contract| call(contract, owner))
                    .collect(),
            )
        }),
    };
    Ok(key)
}

/// Native balance of one account
pub fn use_balance(
    scope: &SwrScope,
    address: &str,
    block: impl Into<Value>,
    config: Option<SwrConfig>,
) -> SwrResult<Resource> {
    scope.request(balance_key(address, block), config)
}

/// Native balances of several accounts, in input order
pub fn use_balances(
    scope: &SwrScope,
    addresses: &[String],
    block: impl Into<Value>,
    config: Option<SwrConfig>,
) -> SwrResult<Resource> {
    if addresses.is_empty() {
        return scope.request(KeySource::None, config);
    }
    scope.request(balances_key(addresses, block), config)
}

/// Token balance(s) through `balanceOf`
pub fn use_balance_of(
    scope: &SwrScope,
    contracts: impl Into<Addresses>,
    owners: impl Into<Addresses>,
    config: Option<SwrConfig>,
) -> SwrResult<Resource> {
    let key = balance_of_key(&contracts.into(), &owners.into())?;
    scope.request(key, config)
}
