//! Subscription Tests
//!
//! Tests event-driven freshness through `SwrScope::request`:
//! - Optimistic updates via `on_event`
//! - Pessimistic refresh on events without a handler
//! - Listener idempotence across re-evaluation
//! - Teardown on drop, key change and subscription change
//! - Setup-time ABI failures
//! - Contract handle lifetime

use crate::support::*;
use chain_swr::{
    AbiRegistry, EventContext, RequestKey, Subscription, SwrConfig, SwrError, SwrScope,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn add_transfer_amount(ctx: EventContext) {
    let current = ctx.current.as_ref().and_then(Value::as_u64).unwrap_or(0);
    let amount = ctx.args.get(2).and_then(Value::as_u64).unwrap_or(0);
    ctx.mutator.mutate(Some(json!(current + amount)), false);
}

fn contract_scope(contracts: Arc<MockContractFactory>) -> SwrScope {
    SwrScope::new(
        SwrConfig::new()
            .with_abis(token_abis())
            .with_contracts(contracts),
    )
}

#[tokio::test]
async fn test_optimistic_update_without_refetch() {
    let contracts = Arc::new(MockContractFactory::new());
    contracts.respond(TOKEN, "balanceOf", json!(10));
    let scope = contract_scope(contracts.clone());

    let subscription = Subscription::filter("Transfer")
        .topics(vec![None, Some(json!(OWNER))])
        .on_event(add_transfer_amount);
    let mut balance = scope
        .request(
            vec![json!(TOKEN), json!("balanceOf"), json!(OWNER)],
            Some(SwrConfig::new().subscribe(subscription)),
        )
        .unwrap();
    balance
        .wait_for(|s| s.data == Some(json!(10)) && !s.is_validating)
        .await
        .unwrap();

    let token = contracts.contract(TOKEN).unwrap();
    token.emit("Transfer", &[json!(ACCOUNT), json!(OWNER), json!(50)]);
    token.emit("Transfer", &[json!(ACCOUNT), json!(OWNER), json!(50)]);
    // filtered out by the owner topic
    token.emit("Transfer", &[json!(OWNER), json!(ACCOUNT), json!(50)]);

    assert_eq!(balance.data(), Some(json!(110)));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(contracts.call_count(), 1);
    assert_eq!(balance.data(), Some(json!(110)));
}

#[tokio::test]
async fn test_pessimistic_refresh_fetches_once() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBalance", json!(10));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));

    let mut balance = scope
        .request(
            vec![json!("getBalance"), json!(ACCOUNT)],
            Some(SwrConfig::new().subscribe("block")),
        )
        .unwrap();
    balance
        .wait_for(|s| s.data == Some(json!(10)) && !s.is_validating)
        .await
        .unwrap();
    assert_eq!(ledger.call_count(), 1);

    ledger.respond("getBalance", json!(20));
    assert_eq!(ledger.emit("block", &[json!(101)]), 1);

    let snapshot = balance
        .wait_for(|s| s.data == Some(json!(20)) && !s.is_validating)
        .await
        .unwrap();
    assert_eq!(snapshot.data, Some(json!(20)));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(ledger.call_count(), 2);
    assert_eq!(scope.cache().get(balance.cache_key().unwrap()), Some(json!(20)));
}

#[tokio::test]
async fn test_reevaluation_keeps_one_listener() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBlockNumber", json!("0x1"));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));
    let overrides = SwrConfig::new().subscribe("block");

    let mut resource = scope
        .request(vec![json!("getBlockNumber")], Some(overrides.clone()))
        .unwrap();
    for _ in 0..5 {
        resource
            .reconfigure(vec![json!("getBlockNumber")], Some(overrides.clone()))
            .unwrap();
    }

    assert_eq!(ledger.listener_count("block"), 1);
    assert_eq!(resource.listener_count(), 1);
}

#[tokio::test]
async fn test_handler_descriptor_reused_keeps_listener() {
    let contracts = Arc::new(MockContractFactory::new());
    contracts.respond(TOKEN, "balanceOf", json!(1));
    let scope = contract_scope(contracts.clone());
    let overrides = SwrConfig::new().subscribe(Subscription::filter("Transfer").on_event(add_transfer_amount));
    let key = RequestKey::new(vec![json!(TOKEN), json!("balanceOf"), json!(OWNER)]);

    let mut resource = scope.request(key.clone(), Some(overrides.clone())).unwrap();
    resource.reconfigure(key.clone(), Some(overrides.clone())).unwrap();
    resource.reconfigure(key, Some(overrides)).unwrap();

    assert_eq!(contracts.contract(TOKEN).unwrap().listener_count(), 1);
    assert_eq!(contracts.built(), 1);
}

#[tokio::test]
async fn test_drop_removes_listeners() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBalance", json!(10));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));

    let mut balance = scope
        .request(
            vec![json!("getBalance"), json!(ACCOUNT)],
            Some(SwrConfig::new().subscribe("block").subscribe("pending")),
        )
        .unwrap();
    balance.wait_for(|s| s.data.is_some()).await.unwrap();
    assert_eq!(ledger.listener_count("block"), 1);
    assert_eq!(ledger.listener_count("pending"), 1);

    drop(balance);
    assert_eq!(ledger.listener_count("block"), 0);
    assert_eq!(ledger.listener_count("pending"), 0);

    assert_eq!(ledger.emit("block", &[json!(102)]), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(ledger.call_count(), 1);
}

#[tokio::test]
async fn test_drop_keeps_other_requests_listeners() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBalance", json!(10));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));
    let overrides = SwrConfig::new().subscribe("block");

    let first = scope
        .request(vec![json!("getBalance"), json!(ACCOUNT)], Some(overrides.clone()))
        .unwrap();
    let second = scope
        .request(vec![json!("getBalance"), json!(OWNER)], Some(overrides))
        .unwrap();
    assert_eq!(ledger.listener_count("block"), 2);

    drop(first);
    assert_eq!(ledger.listener_count("block"), 1);
    assert_eq!(second.listener_count(), 1);
}

#[tokio::test]
async fn test_key_change_moves_listener() {
    let contracts = Arc::new(MockContractFactory::new());
    contracts.respond(TOKEN, "balanceOf", json!(1));
    contracts.respond(OTHER_TOKEN, "balanceOf", json!(2));
    let scope = contract_scope(contracts.clone());
    let overrides = SwrConfig::new().subscribe("Transfer");

    let mut resource = scope
        .request(
            vec![json!(TOKEN), json!("balanceOf"), json!(OWNER)],
            Some(overrides.clone()),
        )
        .unwrap();
    let token = contracts.contract(TOKEN).unwrap();
    assert_eq!(token.listener_count(), 1);

    resource
        .reconfigure(
            vec![json!(OTHER_TOKEN), json!("balanceOf"), json!(OWNER)],
            Some(overrides),
        )
        .unwrap();

    assert_eq!(token.listener_count(), 0);
    assert!(scope.store().get(TOKEN).is_none());
    assert_eq!(contracts.contract(OTHER_TOKEN).unwrap().listener_count(), 1);
    // held by the mount and by the subscription
    assert_eq!(scope.store().holder_count(OTHER_TOKEN), 2);
}

#[tokio::test]
async fn test_handle_evicted_after_last_subscriber() {
    let contracts = Arc::new(MockContractFactory::new());
    contracts.respond(TOKEN, "balanceOf", json!(1));
    let scope = contract_scope(contracts.clone());
    let overrides = SwrConfig::new().subscribe("Transfer");

    let a = scope
        .request(vec![json!(TOKEN), json!("balanceOf"), json!(OWNER)], Some(overrides.clone()))
        .unwrap();
    let b = scope
        .request(vec![json!(TOKEN), json!("balanceOf"), json!(ACCOUNT)], Some(overrides))
        .unwrap();
    assert_eq!(scope.store().holder_count(TOKEN), 4);
    assert_eq!(contracts.built(), 1);

    drop(a);
    assert!(scope.store().get(TOKEN).is_some());
    drop(b);
    assert!(scope.store().get(TOKEN).is_none());
}

#[tokio::test]
async fn test_changed_subscriptions_reattach_on_same_key() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBalance", json!(10));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));
    let key = RequestKey::new(vec![json!("getBalance"), json!(ACCOUNT)]);

    let mut balance = scope
        .request(key.clone(), Some(SwrConfig::new().subscribe("block")))
        .unwrap();
    balance
        .wait_for(|s| s.data.is_some() && !s.is_validating)
        .await
        .unwrap();
    assert_eq!(ledger.listener_count("block"), 1);

    balance
        .reconfigure(key, Some(SwrConfig::new().subscribe("pending")))
        .unwrap();
    assert_eq!(ledger.listener_count("block"), 0);
    assert_eq!(ledger.listener_count("pending"), 1);
    assert_eq!(balance.listener_count(), 1);

    ledger.respond("getBalance", json!(20));
    assert_eq!(ledger.emit("block", &[json!(7)]), 0);
    assert_eq!(ledger.emit("pending", &[]), 1);
    balance
        .wait_for(|s| s.data == Some(json!(20)) && !s.is_validating)
        .await
        .unwrap();
    assert_eq!(ledger.call_count(), 2);
}

#[tokio::test]
async fn test_ledger_override_moves_listener() {
    let first = Arc::new(MockLedger::new());
    first.respond("getBlockNumber", json!(1));
    let second = Arc::new(MockLedger::new());
    second.respond("getBlockNumber", json!(2));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(first.clone()));
    let key = RequestKey::new(vec![json!("getBlockNumber")]);

    let mut block = scope
        .request(key.clone(), Some(SwrConfig::new().subscribe("block")))
        .unwrap();
    block
        .wait_for(|s| s.data.is_some() && !s.is_validating)
        .await
        .unwrap();
    assert_eq!(first.listener_count("block"), 1);

    block
        .reconfigure(
            key,
            Some(SwrConfig::new().subscribe("block").with_ledger(second.clone())),
        )
        .unwrap();
    assert_eq!(first.listener_count("block"), 0);
    assert_eq!(second.listener_count("block"), 1);
    assert_eq!(block.revalidate().await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_failed_resubscribe_is_retried() {
    let unknown = "0x4444444444444444444444444444444444444444";
    let contracts = Arc::new(MockContractFactory::new());
    let scope = contract_scope(contracts.clone());
    let key = RequestKey::new(vec![json!(unknown), json!("balanceOf"), json!(OWNER)]);
    let overrides = SwrConfig::new().subscribe("Transfer");

    let mut resource = scope.request(key.clone(), None).unwrap();
    for _ in 0..2 {
        let result = resource.reconfigure(key.clone(), Some(overrides.clone()));
        assert!(matches!(result, Err(SwrError::AbiNotFound(_))));
    }
    assert!(resource.is_active());
    assert_eq!(resource.listener_count(), 0);
}

#[tokio::test]
async fn test_contract_request_releases_handle_on_drop() {
    let contracts = Arc::new(MockContractFactory::new());
    contracts.respond(TOKEN, "balanceOf", json!(10));
    let scope = contract_scope(contracts.clone());

    let mut balance = scope
        .request(vec![json!(TOKEN), json!("balanceOf"), json!(OWNER)], None)
        .unwrap();
    balance.wait_for(|s| s.data.is_some()).await.unwrap();
    assert_eq!(scope.store().holder_count(TOKEN), 1);

    drop(balance);
    assert!(scope.store().is_empty());
    assert_eq!(contracts.built(), 1);
}

#[tokio::test]
async fn test_missing_abi_at_setup() {
    let unknown = "0x4444444444444444444444444444444444444444";
    let contracts = Arc::new(MockContractFactory::new());
    let scope = contract_scope(contracts.clone());

    let result = scope.request(
        vec![json!(unknown), json!("balanceOf"), json!(OWNER)],
        Some(SwrConfig::new().subscribe("Transfer")),
    );

    match result {
        Err(SwrError::AbiNotFound(address)) => assert_eq!(address, unknown),
        Err(other) => panic!("expected AbiNotFound, got {}", other),
        Ok(_) => panic!("expected AbiNotFound"),
    }
    assert!(scope.store().is_empty());
    assert_eq!(contracts.built(), 0);
    let key = RequestKey::new(vec![json!(unknown), json!("balanceOf"), json!(OWNER)]).cache_key();
    assert_eq!(scope.cache().mount_count(&key), 0);
}

#[tokio::test]
async fn test_missing_abi_registry_at_setup() {
    let scope = SwrScope::new(SwrConfig::new().with_contracts(Arc::new(MockContractFactory::new())));
    let result = scope.request(
        vec![json!(TOKEN), json!("balanceOf"), json!(OWNER)],
        Some(SwrConfig::new().subscribe("Transfer")),
    );
    assert!(matches!(result, Err(SwrError::Abi(_))));
}

#[tokio::test]
async fn test_undeclared_event_rejected() {
    let contracts = Arc::new(MockContractFactory::new());
    let scope = contract_scope(contracts.clone());
    let result = scope.request(
        vec![json!(TOKEN), json!("balanceOf"), json!(OWNER)],
        Some(SwrConfig::new().subscribe("Mint")),
    );
    assert!(matches!(result, Err(SwrError::InvalidRequest(_))));
    assert!(scope.store().is_empty());
}

#[tokio::test]
async fn test_batch_attaches_no_listeners() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBalance", json!(1));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));

    let resource = scope
        .request(
            RequestKey::batch(vec![
                RequestKey::new(vec![json!("getBalance"), json!(ACCOUNT)]),
                RequestKey::new(vec![json!("getBalance"), json!(OWNER)]),
            ]),
            Some(SwrConfig::new().subscribe("block")),
        )
        .unwrap();

    assert_eq!(resource.listener_count(), 0);
    assert_eq!(ledger.listener_count("block"), 0);
}

#[tokio::test]
async fn test_handler_may_revalidate() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getBlockNumber", json!(1));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));
    let subscription = Subscription::filter("block").on_event(|ctx: EventContext| {
        let block = ctx.args.first().cloned();
        ctx.mutator.mutate(block, true);
    });

    let mut block = scope
        .request(
            vec![json!("getBlockNumber")],
            Some(SwrConfig::new().subscribe(subscription)),
        )
        .unwrap();
    block.wait_for(|s| s.data == Some(json!(1))).await.unwrap();

    ledger.respond("getBlockNumber", json!(3));
    ledger.emit("block", &[json!(2)]);
    assert_eq!(block.data(), Some(json!(2)));

    block
        .wait_for(|s| s.data == Some(json!(3)) && !s.is_validating)
        .await
        .unwrap();
    assert_eq!(ledger.call_count(), 2);
}

#[tokio::test]
async fn test_fetch_error_keeps_previous_data() {
    let ledger = Arc::new(MockLedger::new());
    ledger.respond("getGasPrice", json!("0x3b9aca00"));
    let scope = SwrScope::new(SwrConfig::new().with_ledger(ledger.clone()));

    let mut gas = scope
        .request(
            vec![json!("getGasPrice")],
            Some(SwrConfig::new().subscribe("block")),
        )
        .unwrap();
    gas.wait_for(|s| s.data.is_some() && !s.is_validating).await.unwrap();

    ledger.fail(
        "getGasPrice",
        chain_swr::LedgerError::Transport("connection reset".to_string()),
    );
    ledger.emit("block", &[json!(5)]);

    let snapshot = gas
        .wait_for(|s| s.error.is_some() && !s.is_validating)
        .await
        .unwrap();
    assert_eq!(snapshot.data, Some(json!("0x3b9aca00")));
    assert!(matches!(
        snapshot.error.as_deref(),
        Some(SwrError::Upstream(_))
    ));
}

#[tokio::test]
async fn test_abis_from_ambient_scope() {
    let contracts = Arc::new(MockContractFactory::new());
    contracts.respond(TOKEN, "balanceOf", json!(4));
    let root = SwrScope::new(SwrConfig::new().with_contracts(contracts.clone()));
    let scope = root.nested(SwrConfig::new().with_abis(AbiRegistry::new().with(
        TOKEN,
        chain_swr::InterfaceDescriptor::new(["balanceOf"], Vec::<String>::new()),
    )));

    let mut resource = scope
        .request(
            vec![json!(TOKEN), json!("balanceOf"), json!(OWNER)],
            Some(SwrConfig::new().subscribe("Transfer")),
        )
        .unwrap();
    let snapshot = resource.wait_for(|s| s.data.is_some()).await.unwrap();
    assert_eq!(snapshot.data, Some(json!(4)));
    assert_eq!(resource.listener_count(), 1);
}
