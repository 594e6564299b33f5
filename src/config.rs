use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
    #[error("Unable to read channels file {}: {}", .path.display(), .source)]
    ChannelsFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to parse JSON of channels file {}: {}", .path.display(), .source)]
    ChannelsJson {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub storage: StorageConfig,
    pub indexer: IndexerConfig,
    pub channels: Vec<ChannelConfig>,
    /// Maximum declared upload size in bytes
    pub max_upload_size: u64,
    pub probe_delay_ms: u64,
    /// Accepted in place of any signature. Never set this in production.
    pub test_signature: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root holding the per-algorithm object directories and the index.
    pub storage_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub enabled: bool,
    /// External tree reconciled by the background indexer
    pub index_dir: PathBuf,
    /// Directory names never descended into
    pub exclude: Vec<String>,
    pub interval_ms: u64,
}

/// Limits for one quota tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    pub max_file_size: u64,
    pub max_simultaneous: u64,
    pub max_num_files_per_day: u64,
    pub max_num_bytes_per_day: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub download_quotas: Vec<QuotaConfig>,
    #[serde(default)]
    pub upload_quotas: Vec<QuotaConfig>,
}

/// On-disk layout of the channels file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsFile {
    pub channels: Vec<ChannelConfig>,
}

impl StorageConfig {
    pub fn object_dir(&self, algorithm: crate::digest::Algorithm) -> PathBuf {
        self.storage_dir.join(format!("{}-cache", algorithm.name()))
    }

    /// Hidden directory holding the index database.
    pub fn index_db_dir(&self) -> PathBuf {
        self.storage_dir.join(".index")
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            index_dir: PathBuf::from("./storage/data"),
            exclude: default_exclude(),
            interval_ms: 3000,
        }
    }
}

fn default_exclude() -> Vec<String> {
    [".git", ".index", "node_modules", "__pycache__"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    /// Load configuration from environment variables and the channels file.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let storage_dir =
            PathBuf::from(std::env::var("STORAGE_DIR").unwrap_or_else(|_| "./storage".to_string()));

        let channels_file = std::env::var("CHANNELS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| storage_dir.join("channels.json"));

        let index_dir = std::env::var("INDEX_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| storage_dir.join("data"));

        let exclude = std::env::var("INDEX_EXCLUDE")
            .map(|p| {
                p.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| default_exclude());

        let interval_ms = std::env::var("INDEX_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        let indexing_enabled = std::env::var("INDEXING_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let max_upload_size = std::env::var("MAX_UPLOAD_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1024 * 1024 * 1024); // 1GB

        let probe_delay_ms = std::env::var("PROBE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        let test_signature = std::env::var("TEST_SIGNATURE")
            .ok()
            .filter(|s| !s.is_empty());

        let config = Config {
            bind_address,
            storage: StorageConfig { storage_dir },
            indexer: IndexerConfig {
                enabled: indexing_enabled,
                index_dir,
                exclude,
                interval_ms,
            },
            channels: load_channels(&channels_file)?,
            max_upload_size,
            probe_delay_ms,
            test_signature,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.is_empty() {
            return Err(ConfigError::ValidationError(
                "BIND_ADDRESS cannot be empty".to_string(),
            ));
        }

        if self.indexer.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "INDEX_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if channel.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "channel name cannot be empty".to_string(),
                ));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate channel name: {}",
                    channel.name
                )));
            }
            let mut tiers = channel.download_quotas.iter().chain(&channel.upload_quotas);
            if tiers.any(|q| q.max_simultaneous == 0) {
                tracing::warn!(
                    channel = %channel.name,
                    "Channel has a quota tier with maxSimultaneous = 0; tasks routed to it wait forever"
                );
            }
        }

        if self.channels.is_empty() {
            tracing::warn!("No channels provided in config file");
        }

        if self.test_signature.is_some() {
            tracing::warn!("WARNING: the TEST_SIGNATURE environment variable has been set.");
        }

        Ok(())
    }
}

/// Read the channel and quota definitions from a JSON file.
pub fn load_channels(path: &Path) -> Result<Vec<ChannelConfig>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ChannelsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ChannelsFile =
        serde_json::from_str(&text).map_err(|source| ConfigError::ChannelsJson {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(file.channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_channels_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(
            &path,
            r#"{"channels": [{
                "name": "public",
                "password": "pw",
                "downloadQuotas": [{"maxFileSize": 100, "maxSimultaneous": 2,
                                    "maxNumFilesPerDay": 10, "maxNumBytesPerDay": 1000}]
            }]}"#,
        )
        .unwrap();

        let channels = load_channels(&path).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "public");
        assert_eq!(channels[0].download_quotas[0].max_simultaneous, 2);
        assert!(channels[0].upload_quotas.is_empty());
    }

    #[test]
    fn test_load_channels_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_channels(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::ChannelsFile { .. }));
    }

    #[test]
    fn test_load_channels_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_channels(&path).unwrap_err(),
            ConfigError::ChannelsJson { .. }
        ));
    }

    #[test]
    fn test_duplicate_channel_names_rejected() {
        let channel = ChannelConfig {
            name: "dup".to_string(),
            password: "pw".to_string(),
            download_quotas: vec![],
            upload_quotas: vec![],
        };
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            storage: StorageConfig {
                storage_dir: PathBuf::from("/tmp/unused"),
            },
            indexer: IndexerConfig::default(),
            channels: vec![channel.clone(), channel],
            max_upload_size: 1024,
            probe_delay_ms: 0,
            test_signature: None,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
