use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use crate::source::timestamp::TimestampExtractor;
use crate::writer::codec::MAX_PREFIX_BYTES;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;
    parse_config(&yaml)
}

/// Parse and validate a config document.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let unexpanded = unexpanded_env_vars(yaml);
    if unexpanded.is_empty() {
        return Ok(());
    }

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}\n\
         Set them before starting, or replace the $env{{...}} references with literal values",
        unexpanded.join(", ")
    )))
}

fn expand_paths(config: &mut Config) {
    for partition in config.partitions.values_mut() {
        partition.path = expand_tilde(&partition.path);
    }

    let sinks = std::iter::once(&mut config.sinks.primary).chain(config.sinks.mirror.as_mut());
    for sink in sinks {
        sink.root = expand_tilde(&sink.root);
        if let Some(dir) = &sink.checkpoint_dir {
            sink.checkpoint_dir = Some(expand_tilde(dir));
        }
    }
}

/// Check the whole document, reporting every problem at once.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.partitions.is_empty() {
        errors.push("at least one partition must be configured".to_string());
    }
    let mut ids: Vec<&String> = config.partitions.keys().collect();
    ids.sort();
    for id in ids {
        let partition = &config.partitions[id];
        if let Err(e) =
            TimestampExtractor::new(&partition.timestamp.pattern, &partition.timestamp.format)
        {
            errors.push(format!("partition '{}': invalid timestamp: {}", id, e));
        }
    }

    if config.pipeline.channel_capacity == 0 {
        errors.push("pipeline.channel_capacity must be greater than 0".to_string());
    }

    if config.sequencer.probe_timeout.is_zero() {
        errors.push("sequencer.probe_timeout must be greater than 0".to_string());
    }
    if config.sequencer.backoff.base.is_zero() {
        errors.push("sequencer.backoff.base must be greater than 0".to_string());
    }

    if config.accumulator.poll_interval.is_zero() {
        errors.push("accumulator.poll_interval must be greater than 0".to_string());
    }
    if config.accumulator.max_flush_latency.is_zero() {
        errors.push("accumulator.max_flush_latency must be greater than 0".to_string());
    }

    let writer = &config.writer;
    if writer.epoch_marker.is_empty() || writer.epoch_marker.contains('/') {
        errors.push("writer.epoch_marker must be a non-empty name without '/'".to_string());
    }
    if writer.max_block_bytes <= MAX_PREFIX_BYTES {
        errors.push(format!(
            "writer.max_block_bytes must exceed the {} byte block prefix",
            MAX_PREFIX_BYTES
        ));
    }
    if writer.max_blob_bytes == 0 {
        errors.push("writer.max_blob_bytes must be greater than 0".to_string());
    }
    if writer.max_block_count == 0 || writer.max_block_count > u32::from(u16::MAX) {
        errors.push(format!(
            "writer.max_block_count must be between 1 and {}",
            u16::MAX
        ));
    }
    if writer.retry.max_attempts == 0 {
        errors.push("writer.retry.max_attempts must be at least 1".to_string());
    }

    validate_sink("sinks.primary", &config.sinks.primary, &mut errors);
    if let Some(mirror) = &config.sinks.mirror {
        validate_sink("sinks.mirror", mirror, &mut errors);
        if mirror.root == config.sinks.primary.root {
            errors.push("sinks.mirror.root must differ from sinks.primary.root".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_sink(name: &str, sink: &SinkConfig, errors: &mut Vec<String>) {
    if sink.root.as_os_str().is_empty() {
        errors.push(format!("{}.root must be set", name));
    }
    let sub_path = &sink.sub_path;
    if sub_path.starts_with('/')
        || sub_path.ends_with('/')
        || sub_path.split('/').any(|segment| segment == ".." || segment == ".")
        || sub_path.contains("//")
    {
        errors.push(format!(
            "{}.sub_path '{}' must be a relative path without empty, '.' or '..' segments",
            name, sub_path
        ));
    }
}
