use assert_fs::TempDir;
use assert_fs::prelude::*;
use kherimoya::config::{
    Config, CrashPolicy, MultiplexerBackend, OrphanPolicy, validate_config,
};
use kherimoya::error::{Error, Result};
use std::path::PathBuf;

#[test]
fn test_parse_config() -> Result<()> {
    let config_str = r#"{
        "serversDir": "/srv/bedrock",
        "session": { "backend": "tmux", "prefix": "bds_", "tmuxSocket": "kherimoya" },
        "launch": {
            "command": "bedrock_server",
            "args": [],
            "env": { "LD_LIBRARY_PATH": "." },
            "readyPattern": "Server started."
        },
        "timeouts": { "gracefulStopSecs": 10, "spawnSecs": 120 },
        "monitor": { "intervalSecs": 2, "reconcileIntervalSecs": 60 },
        "policy": { "crash": "restart", "maxRestartAttempts": 5, "orphan": "adopt" }
    }"#;

    let config = Config::parse_from_str(config_str)?;

    assert_eq!(config.servers_dir, PathBuf::from("/srv/bedrock"));
    assert_eq!(config.registry_file, PathBuf::from("registry.json"));
    assert_eq!(config.session.backend, MultiplexerBackend::Tmux);
    assert_eq!(config.session.tmux_socket.as_deref(), Some("kherimoya"));
    assert_eq!(config.launch.command, "bedrock_server");
    assert_eq!(
        config.launch.env.get("LD_LIBRARY_PATH"),
        Some(&".".to_string())
    );
    assert_eq!(config.launch.stop_command, "stop");
    assert_eq!(config.timeouts.spawn_secs, 120);
    assert_eq!(config.monitor.reconcile_interval_secs, Some(60));
    assert_eq!(config.policy.crash, CrashPolicy::Restart);
    assert_eq!(config.policy.max_restart_attempts, 5);
    assert_eq!(config.policy.orphan, OrphanPolicy::Adopt);

    validate_config(&config)?;
    Ok(())
}

#[test]
fn test_discover_prefers_json_then_yaml() -> Result<()> {
    let root = TempDir::new().unwrap();

    let config = Config::discover(root.path())?;
    assert_eq!(config, Config::default());

    root.child("kherimoya.yaml")
        .write_str("launch:\n  command: bedrock_server\n  stopCommand: quit\n")
        .unwrap();
    let config = Config::discover(root.path())?;
    assert_eq!(config.launch.command, "bedrock_server");
    assert_eq!(config.launch.stop_command, "quit");

    root.child("kherimoya.json")
        .write_str(r#"{ "launch": { "command": "endstone" } }"#)
        .unwrap();
    let config = Config::discover(root.path())?;
    assert_eq!(config.launch.command, "endstone");
    assert_eq!(config.launch.stop_command, "stop");
    Ok(())
}

#[test]
fn test_resolve_keeps_absolute_paths() {
    let mut config = Config::default();
    config.registry_file = PathBuf::from("/var/lib/kherimoya/registry.json");

    let config = config.resolve("/srv/kherimoya");
    assert_eq!(config.servers_dir, PathBuf::from("/srv/kherimoya/servers"));
    assert_eq!(
        config.registry_file,
        PathBuf::from("/var/lib/kherimoya/registry.json")
    );
}

#[test]
fn test_validate_config() {
    assert!(validate_config(&Config::default()).is_ok());

    let mut config = Config::default();
    config.launch.command = "  ".to_string();
    assert!(matches!(validate_config(&config), Err(Error::ConfigInvalid(_))));

    let mut config = Config::default();
    config.session.prefix = "bds:".to_string();
    assert!(matches!(validate_config(&config), Err(Error::ConfigInvalid(_))));

    let mut config = Config::default();
    config.timeouts.spawn_secs = 0;
    assert!(matches!(validate_config(&config), Err(Error::ConfigInvalid(_))));

    let mut config = Config::default();
    config.monitor.interval_secs = 0;
    assert!(matches!(validate_config(&config), Err(Error::ConfigInvalid(_))));
}

#[test]
fn test_malformed_config_is_parse_error() {
    let err = Config::parse_from_str(r#"{ "policy": { "crash": "explode" } }"#).unwrap_err();
    assert!(matches!(err, Error::ConfigParse(_)));

    let root = TempDir::new().unwrap();
    root.child("kherimoya.yml").write_str("timeouts: [1, 2").unwrap();
    assert!(matches!(
        Config::discover(root.path()),
        Err(Error::ConfigParse(_))
    ));
}
