//! Background indexer for files placed directly into an external directory
//! tree.
//!
//! Each pass walks the tree and makes sure every regular file has two index
//! records: one keyed by the digest of its relative path, one keyed by its
//! content digest. The content-digest record is what [`Indexer::lookup`]
//! serves from; the path-keyed record only lets later passes skip files
//! whose stat signature has not changed.
//!
//! Nothing is locked. A file that changes while it is being hashed is left
//! alone until a later pass, and a digest lookup is trusted only while the
//! file's current stat signature still equals the recorded one.

use std::ffi::OsStr;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::digest::{digest_of_bytes, Algorithm, Digest, Hasher};
use crate::object_store::Location;
use crate::storage::models::{FileStats, IndexRecord};
use crate::storage::{Database, DatabaseError};

const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Counters for a single pass over the tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexPassStats {
    pub files_seen: u64,
    /// Files whose content was read and hashed.
    pub files_hashed: u64,
    /// Files skipped because their stat signature matched the path record.
    pub files_unchanged: u64,
    /// Files that changed while being hashed; retried next pass.
    pub files_unstable: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Unchanged,
    Indexed,
    Unstable,
}

pub struct Indexer {
    algorithm: Algorithm,
    db: Database,
    exclude: Vec<String>,
    root: PathBuf,
}

impl Indexer {
    /// Create an indexer for the tree at `root`, creating it if missing.
    /// Directories whose name appears in `exclude` are never entered.
    pub fn new<P: AsRef<Path>>(
        root: P,
        db: Database,
        exclude: Vec<String>,
    ) -> Result<Self, std::io::Error> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            algorithm: Algorithm::Sha1,
            db,
            exclude,
            root,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_excluded(&self, name: &OsStr) -> bool {
        name.to_str()
            .is_some_and(|name| self.exclude.iter().any(|e| e == name))
    }

    /// Walk the tree once. Per-file and per-directory failures are logged
    /// and counted; they never stop the walk.
    pub fn index_pass(&self) -> IndexPassStats {
        let algorithm = self.algorithm;
        self.index_pass_with(|path| hash_file(algorithm, path))
    }

    /// One pass using `hash` to compute the content digest of each file
    /// that needs hashing.
    pub(crate) fn index_pass_with<H>(&self, hash: H) -> IndexPassStats
    where
        H: Fn(&Path) -> std::io::Result<String>,
    {
        let mut stats = IndexPassStats::default();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(entry.file_type().is_dir() && self.is_excluded(entry.file_name())));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Problem indexing directory");
                    stats.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative_path) = relative_path(&self.root, entry.path()) else {
                warn!(path = %entry.path().display(), "Skipping file with non UTF-8 path");
                stats.errors += 1;
                continue;
            };

            stats.files_seen += 1;
            match self.index_file(&relative_path, entry.path(), &hash) {
                Ok(FileOutcome::Unchanged) => stats.files_unchanged += 1,
                Ok(FileOutcome::Indexed) => stats.files_hashed += 1,
                Ok(FileOutcome::Unstable) => {
                    stats.files_hashed += 1;
                    stats.files_unstable += 1;
                }
                Err(e) => {
                    warn!(path = %relative_path, error = %e, "Problem indexing file");
                    stats.errors += 1;
                }
            }
        }

        stats
    }

    fn index_file<H>(
        &self,
        relative_path: &str,
        path: &Path,
        hash: H,
    ) -> Result<FileOutcome, IndexError>
    where
        H: FnOnce(&Path) -> std::io::Result<String>,
    {
        let path_key = digest_of_bytes(self.algorithm, relative_path.as_bytes());
        let before = FileStats::capture(path)?;

        if let Some(record) = self.db.record_by_path_key(&path_key)? {
            if record.file_stats == before && record.relative_path == relative_path {
                // The digest row may have been taken over by an identical file
                // that has since changed. Our record is still good, so put it
                // back without re-hashing.
                if !self.digest_record_is_live(&record.digest)? {
                    self.db.put_index_record(&path_key, &record)?;
                }
                return Ok(FileOutcome::Unchanged);
            }
        }

        info!(path = %relative_path, algorithm = %self.algorithm, "Computing digest");
        let digest = hash(path)?;
        let after = FileStats::capture(path)?;
        if before != after {
            debug!(path = %relative_path, "File changed while hashing, will retry");
            return Ok(FileOutcome::Unstable);
        }

        info!(path = %relative_path, digest = %digest, "Indexed file");
        let record = IndexRecord {
            relative_path: relative_path.to_string(),
            file_stats: after,
            digest,
        };
        self.db.put_index_record(&path_key, &record)?;
        Ok(FileOutcome::Indexed)
    }

    fn digest_record_is_live(&self, digest: &str) -> Result<bool, IndexError> {
        match self.db.record_by_digest(digest)? {
            Some(record) => Ok(self.current_stats(&record)?.is_some()),
            None => Ok(false),
        }
    }

    /// Stat signature of the record's file, if it still matches the record.
    fn current_stats(&self, record: &IndexRecord) -> Result<Option<FileStats>, IndexError> {
        match FileStats::capture(&self.root.join(&record.relative_path)) {
            Ok(stats) if stats == record.file_stats => Ok(Some(stats)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Find an indexed file by content digest.
    pub fn lookup(&self, digest: &Digest) -> Result<Option<Location>, IndexError> {
        if digest.algorithm() != self.algorithm {
            return Ok(None);
        }
        let Some(record) = self.db.record_by_digest(digest.as_str())? else {
            return Ok(None);
        };
        Ok(self.current_stats(&record)?.map(|stats| Location {
            size: stats.size,
            root: self.root.clone(),
            relative_path: record.relative_path,
        }))
    }

    /// Run passes forever, `interval` apart, until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(root = %self.root.display(), "Starting background indexer");
            loop {
                let indexer = Arc::clone(&self);
                let started = Instant::now();
                match tokio::task::spawn_blocking(move || indexer.index_pass()).await {
                    Ok(stats) => debug!(
                        files_seen = stats.files_seen,
                        files_hashed = stats.files_hashed,
                        files_unchanged = stats.files_unchanged,
                        files_unstable = stats.files_unstable,
                        errors = stats.errors,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Index pass complete"
                    ),
                    Err(e) => error!(error = %e, "Index pass failed"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Background indexer stopped");
        })
    }
}

/// `/`-separated path of `path` below `root`.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn hash_file(algorithm: Algorithm, path: &Path) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}
