//! Settings Unit Tests
//!
//! Tests file and environment layering of `Settings`.

use chain_swr::Settings;
use std::io::Write;

#[test]
fn test_environment_overrides_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "rpc:\n  url: http://file:8545\n  poll_interval_ms: 250").unwrap();

    std::env::set_var("CHAIN_SWR__RPC__URL", "http://env:8545");
    let settings = Settings::load_from(file.path());
    std::env::remove_var("CHAIN_SWR__RPC__URL");

    let settings = settings.unwrap();
    assert_eq!(settings.rpc.url, "http://env:8545");
    assert_eq!(settings.rpc.poll_interval_ms, 250);
    assert!(settings.validate().is_ok());
}

#[test]
fn test_missing_sections_use_defaults() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "cache:\n  revalidate_on_mount: false").unwrap();

    let settings = Settings::load_from(file.path()).unwrap();
    assert!(!settings.cache.revalidate_on_mount);
    assert_eq!(settings.cache.capacity, 1000);
    assert_eq!(settings.rpc.url, "http://127.0.0.1:8545");
    assert_eq!(settings.rpc.signer, None);
}

#[test]
fn test_zero_poll_interval_invalid() {
    let mut settings = Settings::default();
    settings.rpc.poll_interval_ms = 0;
    assert!(settings.validate().is_err());
}
