use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tributary::config::types::ResumeStrategy;
use tributary::config::{load_config, resolve_config_path, ConfigError};
use tributary::pipeline::PipelineSettings;
use tributary::writer::codec::MAX_PREFIX_BYTES;

const CONFIG: &str = r#"
partitions:
  "0":
    path: ~/events/p0.ndjson
    timestamp:
      pattern: '"Timestamp":"(?P<ts>[^"]+)"'
      format: iso8601
  "1":
    path: $env{TRIBUTARY_CONFIG_TEST_DIR}/p1.ndjson
    timestamp:
      pattern: '^(?P<ts>\d+)'
      format: epoch_ms
    follow: true

accumulator:
  max_flush_latency: 2s

writer:
  epoch_marker: "20260301"
  max_block_bytes: 65536
  resume: use_checkpoint_position

sinks:
  primary:
    root: ~/tributary/primary
  mirror:
    root: $env{TRIBUTARY_CONFIG_TEST_DIR}/mirror
    propagate_errors: false
"#;

#[test]
fn test_config_file_loads_and_expands() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, CONFIG).unwrap();

    std::env::set_var("TRIBUTARY_CONFIG_TEST_DIR", "/srv/feeds");
    let config = load_config(&config_path).expect("config should be valid");
    std::env::remove_var("TRIBUTARY_CONFIG_TEST_DIR");

    assert_eq!(config.partitions.len(), 2);
    assert_eq!(config.partitions["1"].path, Path::new("/srv/feeds/p1.ndjson"));
    assert!(config.partitions["1"].follow);
    assert_eq!(config.writer.resume, ResumeStrategy::UseCheckpointPosition);

    if let Some(home) = dirs::home_dir() {
        assert_eq!(config.partitions["0"].path, home.join("events/p0.ndjson"));
        assert_eq!(config.sinks.primary.root, home.join("tributary/primary"));
    }

    let mirror = config.sinks.mirror.as_ref().unwrap();
    assert_eq!(mirror.root, Path::new("/srv/feeds/mirror"));
    assert_eq!(mirror.checkpoint_dir(), Path::new("/srv/feeds/mirror/.checkpoints"));
    assert!(!mirror.propagate_errors);

    let settings = PipelineSettings::from(&config);
    assert_eq!(settings.accumulator.capacity, 65536 - MAX_PREFIX_BYTES);
    assert_eq!(settings.accumulator.max_flush_latency, Duration::from_secs(2));
    assert_eq!(settings.channel_capacity, 1000);
}

#[test]
fn test_block_size_must_exceed_prefix() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    let yaml = CONFIG
        .replace("65536", &MAX_PREFIX_BYTES.to_string())
        .replace("$env{TRIBUTARY_CONFIG_TEST_DIR}", "/srv/other");
    fs::write(&config_path, yaml).unwrap();

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("max_block_bytes"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_malformed_yaml() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, "partitions: [unterminated").unwrap();

    assert!(matches!(load_config(&config_path), Err(ConfigError::YamlParse(_))));
}

#[test]
fn test_explicit_config_path_wins() {
    let resolved = resolve_config_path(Some(Path::new("/opt/tributary.yml")));
    assert_eq!(resolved.as_deref(), Some(Path::new("/opt/tributary.yml")));
}
