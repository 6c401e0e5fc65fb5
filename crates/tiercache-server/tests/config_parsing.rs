use std::{env, fs};

use tiercache_engine::{InvalidationMode, StoreBackend};
use tiercache_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("tiercache.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 7411
body_limit_bytes = 2048

[logging]
level = "debug"

[engine]
peer_read_timeout_ms = 250
peer_failure_threshold = 5

[engine.store]
backend = "memory"
default_ttl_secs = 120

[engine.strategies.user]
ttl_seconds = 60
compression = true

[engine.strategies.user.invalidation]
mode = "dependency"
dependency_tokens = ["user"]

[[engine.nodes]]
id = "node-b"
url = "http://10.0.0.2:7400"
region = "eu"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 7411);
    assert_eq!(cfg.server.body_limit_bytes, 2048);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.engine.peer_read_timeout_ms, 250);
    assert_eq!(cfg.engine.peer_failure_threshold, 5);
    assert_eq!(cfg.engine.store.backend, StoreBackend::Memory);
    assert_eq!(cfg.engine.store.default_ttl_secs, 120);
    let user = &cfg.engine.strategies["user"];
    assert_eq!(user.ttl_seconds, 60);
    assert!(user.compression);
    assert_eq!(user.invalidation.mode, InvalidationMode::Dependency);
    assert_eq!(cfg.engine.nodes.len(), 1);
    assert_eq!(cfg.engine.nodes[0].region, "eu");

    // 2) Env override should win over file
    unsafe {
        env::set_var("TIERCACHE__SERVER__PORT", "7412");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.server.port, 7412);
    unsafe {
        env::remove_var("TIERCACHE__SERVER__PORT");
    }

    // 3) Invalid strategy is rejected
    let bad = toml_content.replace("ttl_seconds = 60", "ttl_seconds = -5");
    fs::write(&path, bad).expect("write toml");
    let err = load_config(path.to_str()).expect_err("negative ttl must fail validation");
    assert!(err.contains("user"), "unexpected error: {err}");

    // 4) Missing file falls back to defaults
    let missing = dir.path().join("absent.toml");
    let defaults = load_config(missing.to_str()).expect("defaults");
    assert_eq!(defaults.server.port, 7400);
    assert!(defaults.engine.strategies.is_empty());
}
