mod local;

pub use local::LocalStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::digest::{Algorithm, Digest};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Problem renaming file {} -> {}: {}", .temp.display(), .target.display(), .source)]
    Commit {
        temp: PathBuf,
        target: PathBuf,
        source: std::io::Error,
    },
    #[error("Digest {digest} does not belong to the {expected} store")]
    WrongAlgorithm { digest: String, expected: Algorithm },
    #[error("Index lookup failed: {0}")]
    Index(String),
}

/// Where the bytes for a digest currently live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub size: u64,
    /// Directory the relative path is resolved against: the object
    /// directory for committed objects, the indexed tree otherwise.
    pub root: PathBuf,
    pub relative_path: String,
}

impl Location {
    pub fn path(&self) -> PathBuf {
        self.root.join(Path::new(&self.relative_path))
    }
}

/// Content-addressed object storage for a single digest algorithm.
///
/// Objects are immutable once committed. Content is verified only at upload
/// time; lookups never re-hash.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Find the object for `digest`, falling back to the index when one is
    /// attached and the object has not been uploaded.
    async fn locate(&self, digest: &Digest) -> Result<Option<Location>, ObjectStoreError>;

    /// Prepare a unique temporary path next to the canonical object path.
    async fn begin_upload(&self, digest: &Digest) -> Result<PathBuf, ObjectStoreError>;

    /// Publish a fully verified temporary file under `digest`.
    /// Losing a race against a concurrent commit is not an error.
    async fn commit(&self, digest: &Digest, temp: &Path) -> Result<(), ObjectStoreError>;
}
