// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::Config;

/// Configuration failures are their own error type so the binary can map
/// them to the dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/runa/config.yaml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/runa/config.yaml"));
        paths.push(home.join(".runa/config.yaml"));
    }

    paths.push(PathBuf::from(".runa/config.yaml"));
    paths.push(PathBuf::from("runa.yaml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag);
/// unlike the search paths, an explicit path that does not exist is an error.
pub fn load_config(extra: Option<&Path>) -> Result<Config, ConfigError> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(p)?);
    }

    finish(merged)
}

/// Load configuration from a single file, ignoring the search paths.
/// Used by tests and by deployments that pin everything to one file.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    merge_yaml(&mut merged, read_layer(path)?);
    finish(merged)
}

fn read_layer(path: &Path) -> Result<serde_yaml::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn finish(merged: serde_yaml::Value) -> Result<Config, ConfigError> {
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.provider.model.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.model must not be empty".into()));
    }
    if config.provider.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.base_url must not be empty".into()));
    }
    if config.session.compaction_keep_head == 0 && config.session.compaction_keep_tail == 0 {
        return Err(ConfigError::Invalid(
            "compaction must keep at least one head or tail message".into(),
        ));
    }
    if config.engine.max_turns == 0 {
        return Err(ConfigError::Invalid("engine.max_turns must be at least 1".into()));
    }
    Ok(())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
