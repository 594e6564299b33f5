use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stat signature used to detect external modification of an indexed file
/// without reading its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub size: u64,
    pub inode: u64,
    pub modified_secs: i64,
    pub modified_nanos: u32,
}

impl FileStats {
    /// Capture the signature of `path` without following symlinks.
    pub fn capture(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::symlink_metadata(path)?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        Ok(Self {
            size: meta.len(),
            inode: inode_of(&meta),
            modified_secs: modified.timestamp(),
            modified_nanos: modified.timestamp_subsec_nanos(),
        })
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// A file discovered by the indexer.
///
/// The same record is stored twice: under the digest of its relative path
/// and under its content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Path relative to the indexed root, `/`-separated.
    pub relative_path: String,
    pub file_stats: FileStats,
    /// Hex content digest.
    pub digest: String,
}
