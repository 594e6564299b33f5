use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use super::{Location, ObjectStore, ObjectStoreError};
use crate::digest::{Algorithm, Digest};
use crate::indexer::Indexer;

/// Local filesystem object store, sharded as `ab/cd/ef/abcdef...`.
pub struct LocalStore {
    algorithm: Algorithm,
    base_path: PathBuf,
    index: Option<Arc<Indexer>>,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P, algorithm: Algorithm) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            algorithm,
            base_path,
            index: None,
        })
    }

    /// Serve digests found by `indexer` when no uploaded object exists.
    /// Ignored unless the indexer hashes with this store's algorithm.
    pub fn with_index(mut self, indexer: Arc<Indexer>) -> Self {
        if indexer.algorithm() == self.algorithm {
            self.index = Some(indexer);
        } else {
            tracing::warn!(
                store = %self.algorithm,
                index = %indexer.algorithm(),
                "Index algorithm does not match store; index fallback disabled"
            );
        }
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        self.base_path.join(relative_object_path(digest))
    }

    fn check_algorithm(&self, digest: &Digest) -> Result<(), ObjectStoreError> {
        if digest.algorithm() != self.algorithm {
            return Err(ObjectStoreError::WrongAlgorithm {
                digest: digest.to_string(),
                expected: self.algorithm,
            });
        }
        Ok(())
    }

    async fn lookup_index(&self, digest: &Digest) -> Result<Option<Location>, ObjectStoreError> {
        let Some(indexer) = self.index.as_ref().map(Arc::clone) else {
            return Ok(None);
        };
        let digest = digest.clone();
        tokio::task::spawn_blocking(move || indexer.lookup(&digest))
            .await
            .map_err(|e| ObjectStoreError::Index(e.to_string()))?
            .map_err(|e| ObjectStoreError::Index(e.to_string()))
    }
}

fn relative_object_path(digest: &Digest) -> String {
    let [a, b, c] = digest.shards();
    format!("{a}/{b}/{c}/{digest}")
}

/// Remove a temporary file, tolerating it already being gone.
async fn discard(temp: &Path) {
    if let Err(e) = fs::remove_file(temp).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %temp.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    async fn locate(&self, digest: &Digest) -> Result<Option<Location>, ObjectStoreError> {
        self.check_algorithm(digest)?;
        let path = self.object_path(digest);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                return Ok(Some(Location {
                    size: meta.len(),
                    root: self.base_path.clone(),
                    relative_path: relative_object_path(digest),
                }));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.lookup_index(digest).await
    }

    async fn begin_upload(&self, digest: &Digest) -> Result<PathBuf, ObjectStoreError> {
        self.check_algorithm(digest)?;
        let path = self.object_path(digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut temp = path.into_os_string();
        temp.push(format!(".{}.uploading", &token[..12]));
        Ok(PathBuf::from(temp))
    }

    async fn commit(&self, digest: &Digest, temp: &Path) -> Result<(), ObjectStoreError> {
        self.check_algorithm(digest)?;
        let target = self.object_path(digest);

        if fs::try_exists(&target).await? {
            tracing::debug!(digest = %digest, "Object already present, discarding upload");
            discard(temp).await;
            return Ok(());
        }

        // A hard link fails if the target exists, so exactly one of several
        // concurrent uploaders publishes the object.
        match fs::hard_link(temp, &target).await {
            Ok(()) => {
                discard(temp).await;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(digest = %digest, "Lost commit race, discarding upload");
                discard(temp).await;
                Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, "Hard link unavailable, falling back to rename");
                match fs::rename(temp, &target).await {
                    Ok(()) => Ok(()),
                    Err(source) => {
                        if fs::try_exists(&target).await.unwrap_or(false) {
                            discard(temp).await;
                            Ok(())
                        } else {
                            Err(ObjectStoreError::Commit {
                                temp: temp.to_path_buf(),
                                target,
                                source,
                            })
                        }
                    }
                }
            }
        }
    }
}
