use camino::Utf8Path;
use jointmesh_network::config::{TimeoutConfig, DEFAULT_PORT};
use jointmesh_primitives::id::UnitId;
use tempfile::tempdir;

use super::*;

#[test]
fn missing_sections_fall_back_to_defaults() {
    let config: ConfigFile = toml::from_str("").unwrap();

    assert_eq!(config.network.port, Some(DEFAULT_PORT), "default port");
    assert!(!config.network.mode.light, "full node by default");
    assert!(config.node.witnesses.is_empty(), "no witnesses");
    assert!(config.node.genesis_unit.is_none(), "no genesis");
}

#[test]
fn partial_sections_keep_other_defaults() {
    let config: ConfigFile = toml::from_str(
        r#"
        [network]
        my_url = "wss://hub.example.org"

        [network.mode]
        hub = true

        [network.timeouts]
        stall_ms = 1000

        [node]
        genesis_unit = "G"
        "#,
    )
    .unwrap();

    assert_eq!(
        config.network.my_url.as_deref(),
        Some("wss://hub.example.org"),
        "my_url is read"
    );
    assert!(config.network.mode.hub, "hub mode is read");
    assert_eq!(
        config.network.timeouts.stall.as_millis(),
        1000,
        "stall timeout in milliseconds"
    );
    assert_eq!(
        config.network.timeouts.connect,
        TimeoutConfig::default().connect,
        "unset timeouts keep their default"
    );
    assert_eq!(
        config.node.genesis_unit,
        Some(UnitId::from("G")),
        "genesis unit is read"
    );
}

#[test]
fn saved_config_loads_back() {
    let dir = tempdir().unwrap();
    let dir = Utf8Path::from_path(dir.path()).unwrap();

    assert!(!ConfigFile::exists(dir), "nothing saved yet");

    let mut network = NetworkConfig::default();
    network.bootstrap.peers.push("wss://peer.example.org".to_owned());

    ConfigFile::new(network, NodeSection::new(vec!["W1".to_owned()], None))
        .save(dir)
        .unwrap();

    assert!(ConfigFile::exists(dir), "config is on disk");

    let loaded = ConfigFile::load(dir).unwrap();
    assert_eq!(
        loaded.network.bootstrap.peers,
        ["wss://peer.example.org"],
        "bootstrap peers survive"
    );
    assert_eq!(loaded.node.witnesses, ["W1"], "witnesses survive");
}

#[test]
fn unreadable_config_is_an_error() {
    let dir = tempdir().unwrap();
    let dir = Utf8Path::from_path(dir.path()).unwrap();

    let err = ConfigFile::load(dir).unwrap_err();
    assert!(
        err.to_string().contains("failed to read configuration"),
        "error names the failure, got {err}"
    );
}
