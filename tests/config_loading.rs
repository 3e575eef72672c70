use std::path::Path;

use gold_accrual::{Config, EngineError};
use tempfile::TempDir;

#[test]
fn loads_full_file_from_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gold-accrual.toml");
    std::fs::write(
        &path,
        r#"
[engine]
top_n = 25
significant_change_threshold = 10.0
balance_cap = 1000.0
rebuild_interval_secs = 60
checkpoint_debounce_secs = 5

[storage]
data_dir = "/var/lib/gold"

[api]
http_port = 9000

[oracle]
url = "http://indexer.local:8080"
timeout_secs = 3
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.engine.top_n, 25);
    assert_eq!(config.engine.balance_cap, 1000.0);
    assert_eq!(config.storage.data_dir, Path::new("/var/lib/gold"));
    assert_eq!(config.api.http_port, 9000);
    assert_eq!(config.oracle.url.as_deref(), Some("http://indexer.local:8080"));
    assert_eq!(config.oracle.timeout_secs, 3);
    assert!(config.validate().is_ok());
}

#[test]
fn rejects_non_positive_cap() {
    let config = Config::from_toml("[engine]\nbalance_cap = 0.0\n").unwrap();
    assert!(matches!(config.validate(), Err(EngineError::Config(_))));
}
