#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Settings-file loading through the public API.

use stockgate_core::config::load_config;
use stockgate_core::Error;

#[test]
fn partial_settings_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(
        &path,
        r#"{
            "tunnel": { "host": "bastion.internal", "username": "deploy", "local_port": 5434 },
            "database": { "database": "inventory" }
        }"#,
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.tunnel.host.as_deref(), Some("bastion.internal"));
    assert_eq!(config.tunnel.port, 22);
    assert_eq!(config.tunnel.destination_port, 5432);
    assert_eq!(config.local_bind_port(), 5434);
    assert_eq!(config.database.database.as_deref(), Some("inventory"));
    assert_eq!(config.log_level, "info");
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_config(Some(&dir.path().join("absent.json"))).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = load_config(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}
