//! Shared test helpers for router-level tests.

use std::sync::Arc;

use crate::config::{ChannelConfig, Config, IndexerConfig, QuotaConfig, StorageConfig};
use crate::digest::Digest;
use crate::regulator::{expected_signature, TaskKind};
use crate::AppState;

pub const TEST_CHANNEL: &str = "test";
pub const TEST_PASSWORD: &str = "test-password";

/// A tier large enough that no test runs into its limits.
pub fn generous_quota() -> QuotaConfig {
    QuotaConfig {
        max_file_size: 10 * 1024 * 1024,
        max_simultaneous: 10,
        max_num_files_per_day: 1000,
        max_num_bytes_per_day: 1024 * 1024 * 1024,
    }
}

pub fn test_channel(download: QuotaConfig, upload: QuotaConfig) -> ChannelConfig {
    ChannelConfig {
        name: TEST_CHANNEL.to_string(),
        password: TEST_PASSWORD.to_string(),
        download_quotas: vec![download],
        upload_quotas: vec![upload],
    }
}

/// Config rooted in `temp_dir` with a single channel and no probe delay.
pub fn test_config(temp_dir: &tempfile::TempDir, channel: ChannelConfig) -> Config {
    let storage_dir = temp_dir.path().join("storage");
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        storage: StorageConfig {
            storage_dir: storage_dir.clone(),
        },
        indexer: IndexerConfig {
            enabled: false,
            index_dir: storage_dir.join("data"),
            ..IndexerConfig::default()
        },
        channels: vec![channel],
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
        probe_delay_ms: 0,
        test_signature: None,
    }
}

/// Create a test AppState with a temporary storage root.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let config = test_config(temp_dir, test_channel(generous_quota(), generous_quota()));
    state_with(config)
}

pub fn state_with(config: Config) -> Arc<AppState> {
    Arc::new(AppState::open(config).expect("Failed to open test state"))
}

/// Signature for `kind` on `digest` in the test channel.
pub fn sign(kind: TaskKind, digest: &Digest) -> String {
    expected_signature(kind, digest.algorithm(), digest.as_str(), TEST_PASSWORD)
}

/// `/<route>/<algorithm>/<digest>?channel=test&signature=...`
pub fn signed_uri(route: &str, kind: TaskKind, digest: &Digest) -> String {
    format!(
        "/{route}/{}/{}?channel={TEST_CHANNEL}&signature={}",
        digest.algorithm(),
        digest,
        sign(kind, digest)
    )
}
