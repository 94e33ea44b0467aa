//! Print an account balance on every new block
//!
//! Usage: `watch_balance [ADDRESS]`. Without an address the configured signer
//! (`CHAIN_SWR__RPC__SIGNER`) is used.

use chain_swr::{JsonRpcLedgerClient, Settings, SwrConfig, SwrMetrics, SwrScope};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = load_settings()?;
    let address = std::env::args()
        .nth(1)
        .or_else(|| settings.rpc.signer.clone())
        .ok_or_else(|| anyhow::anyhow!("pass an address or set CHAIN_SWR__RPC__SIGNER"))?;

    let ledger = Arc::new(JsonRpcLedgerClient::from_settings(&settings.rpc));
    let metrics = Arc::new(SwrMetrics::new());
    let scope = SwrScope::from_settings(&settings, SwrConfig::new().with_ledger(ledger))
        .with_metrics(metrics.clone());

    let mut balance = chain_swr::use_balance(
        &scope,
        &address,
        "latest",
        Some(SwrConfig::new().subscribe("block")),
    )?;

    tracing::info!(address = %address, url = %settings.rpc.url, "Watching balance");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutting down");
                break;
            }
            changed = balance.changed() => {
                if !changed {
                    break;
                }
                let snapshot = balance.snapshot();
                if let Some(error) = &snapshot.error {
                    tracing::warn!(error = %error, "Balance fetch failed");
                }
                if let Some(data) = &snapshot.data {
                    println!("{}", json!({ "address": address, "balance": data }));
                }
            }
        }
    }

    tracing::debug!(metrics = %metrics.render(), "Final metrics");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chain_swr=debug,watch_balance=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Load and validate settings
fn load_settings() -> anyhow::Result<Settings> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let settings = Settings::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load settings");
        anyhow::anyhow!("Configuration error: {}", e)
    })?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(settings)
}
