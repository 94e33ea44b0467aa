//! Scope and Helper Tests
//!
//! Tests the consumer-facing surface:
//! - Nested scopes and per-request overrides
//! - Balance helpers
//! - Explicit revalidation, deduplication and metrics

use crate::support::*;
use chain_swr::{
    use_balance, use_balance_of, use_balances, KeySource, RequestKey, Settings, SwrConfig,
    SwrError, SwrMetrics, SwrScope,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_nested_scope_overrides_ledger() {
    let outer = Arc::new(MockLedger::new());
    outer.respond("getChainId", json!("0x1"));
    let inner = Arc::new(MockLedger::new());
    inner.respond("getChainId", json!("0x89"));

    let root = SwrScope::new(SwrConfig::new().with_ledger(outer.clone()));
    let child = root.nested(SwrConfig::new().with_ledger(inner.clone()));

    let mut chain = child.request(vec![json!("getChainId")], None).unwrap();
    let snapshot = chain.wait_for(|s| s.data.is_some()).await.unwrap();

    assert_eq!(snapshot.data, Some(json!("0x89")));
    assert_eq!(outer.call_count(), 0);
    assert_eq!(inner.call_count(), 1);
}

#[tokio::test]
async fn test_nested_scope_shares_cache() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBlockNumber", json!("0x10"));
    let root = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));
    let child = root.nested(SwrConfig::new());

    let mut a = root.request(vec![json!("getBlockNumber")], None).unwrap();
    a.wait_for(|s| s.data.is_some()).await.unwrap();
    let b = child.request(vec![json!("getBlockNumber")], None).unwrap();

    // fresh within the dedupe interval
    assert_eq!(b.data(), Some(json!("0x10")));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ledger.call_count(), 1);
}

#[tokio::test]
async fn test_dedupe_interval_override() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBlockNumber", json!("0x10"));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));

    let mut a = scope.request(vec![json!("getBlockNumber")], None).unwrap();
    a.wait_for(|s| s.data.is_some() && !s.is_validating).await.unwrap();
    let mut b = scope
        .request(
            vec![json!("getBlockNumber")],
            Some(SwrConfig::new().with_dedupe_interval(Duration::ZERO)),
        )
        .unwrap();
    b.wait_for(|s| !s.is_validating).await.unwrap();

    assert_eq!(ledger.call_count(), 2);
}

#[tokio::test]
async fn test_revalidate_on_mount_disabled() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getGasPrice", json!("0x1"));
    let scope = SwrScope::new(
        SwrConfig::new()
            .with_ledger(ledger.clone())
            .with_revalidate_on_mount(false),
    );

    let gas = scope.request(vec![json!("getGasPrice")], None).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gas.data(), None);
    assert_eq!(ledger.call_count(), 0);

    assert_eq!(gas.revalidate().await.unwrap(), Some(json!("0x1")));
    assert_eq!(gas.data(), Some(json!("0x1")));
}

#[tokio::test]
async fn test_concurrent_revalidations_deduplicated() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond_to("getBalance", ACCOUNT, json!("0x5"));
    ledger.delay("getBalance", ACCOUNT, Duration::from_millis(30));
    let metrics = Arc::new(SwrMetrics::new());
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()))
        .with_metrics(metrics.clone());

    let balance = scope
        .request(vec![json!("getBalance"), json!(ACCOUNT)], None)
        .unwrap();
    let (a, b) = tokio::join!(balance.revalidate(), balance.revalidate());

    assert_eq!(a.unwrap(), Some(json!("0x5")));
    assert_eq!(b.unwrap(), Some(json!("0x5")));
    assert_eq!(ledger.call_count(), 1);
    assert_eq!(metrics.deduplicated.get(), 2);
    assert_eq!(metrics.fetches.with_label_values(&["base"]).get(), 1);
}

#[tokio::test]
async fn test_mutate_through_resource() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBalance", json!(1));
    let scope = SwrScope::new(
        SwrConfig::new()
            .with_ledger(ledger)
            .with_revalidate_on_mount(false),
    );

    let balance = scope
        .request(vec![json!("getBalance"), json!(ACCOUNT)], None)
        .unwrap();
    balance.mutate(Some(json!(42)), false);

    assert_eq!(balance.data(), Some(json!(42)));
    assert_eq!(scope.cache().get(balance.cache_key().unwrap()), Some(json!(42)));
}

#[tokio::test]
async fn test_lazy_key_with_unready_dependency() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBalance", json!(9));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));
    let account: Arc<parking_lot::Mutex<Option<String>>> = Arc::default();

    let source = {
        let account = account.clone();
        KeySource::lazy(move || {
            account
                .lock()
                .clone()
                .map(|a| RequestKey::new(vec![json!("getBalance"), json!(a)]))
        })
    };

    let mut balance = scope.request(source.clone(), None).unwrap();
    assert!(!balance.is_active());
    assert!(!balance.changed().await);

    *account.lock() = Some(ACCOUNT.to_string());
    balance.reconfigure(source, None).unwrap();
    let snapshot = balance.wait_for(|s| s.data.is_some()).await.unwrap();
    assert_eq!(snapshot.data, Some(json!(9)));
}

#[tokio::test]
async fn test_use_balance() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBalance", json!("0x64"));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));

    let mut balance = use_balance(&scope, ACCOUNT, "latest", None).unwrap();
    balance.wait_for(|s| s.data.is_some()).await.unwrap();

    assert_eq!(
        ledger.calls()[0],
        ("getBalance".to_string(), vec![json!(ACCOUNT), json!("latest")])
    );
}

#[tokio::test]
async fn test_use_balances() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond_to("getBalance", ACCOUNT, json!(1));
    ledger.respond_to("getBalance", OWNER, json!(2));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger));

    let mut balances = use_balances(
        &scope,
        &[ACCOUNT.to_string(), OWNER.to_string()],
        "latest",
        None,
    )
    .unwrap();
    let snapshot = balances.wait_for(|s| s.data.is_some()).await.unwrap();
    assert_eq!(snapshot.data, Some(json!([1, 2])));

    let empty = use_balances(&scope, &[], "latest", None).unwrap();
    assert!(!empty.is_active());
}

#[tokio::test]
async fn test_use_balance_of_variants() {
    let contracts = Arc::new(MockContractFactory::new());
    contracts.respond(TOKEN, "balanceOf", json!(10));
    contracts.respond(OTHER_TOKEN, "balanceOf", json!(20));
    let scope = SwrScope::new(
        SwrConfig::new()
            .with_abis(token_abis())
            .with_contracts(contracts.clone()),
    );

    let mut single = use_balance_of(&scope, TOKEN, OWNER, None).unwrap();
    let snapshot = single.wait_for(|s| s.data.is_some()).await.unwrap();
    assert_eq!(snapshot.data, Some(json!(10)));

    let mut many = use_balance_of(&scope, vec![TOKEN, OTHER_TOKEN], OWNER, None).unwrap();
    let snapshot = many.wait_for(|s| s.data.is_some()).await.unwrap();
    assert_eq!(snapshot.data, Some(json!([10, 20])));

    let both = use_balance_of(&scope, vec![TOKEN], vec![OWNER], None);
    assert!(matches!(both, Err(SwrError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_scope_from_settings() {
    let mut settings = Settings::default();
    settings.cache.dedupe_interval_ms = 0;
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBlockNumber", json!("0x1"));
    let scope = SwrScope::from_settings(&settings, SwrConfig::new().with_ledger(ledger.clone()));

    let mut a = scope.request(vec![json!("getBlockNumber")], None).unwrap();
    a.wait_for(|s| s.data.is_some() && !s.is_validating).await.unwrap();
    let mut b = scope.request(vec![json!("getBlockNumber")], None).unwrap();
    b.wait_for(|s| !s.is_validating).await.unwrap();

    assert_eq!(ledger.call_count(), 2);
}
