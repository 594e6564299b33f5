use std::fmt::Display;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::digest::{Digest, Hasher};
use crate::object_store::{ObjectStore, ObjectStoreError};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Too many bytes processed: {received} > {declared}. Aborting.")]
    TooManyBytes { received: u64, declared: u64 },
    #[error("Incorrect num bytes processed: {received} <> {declared}")]
    LengthMismatch { received: u64, declared: u64 },
    #[error("Computed hash does not match expected: {actual} <> {expected}")]
    DigestMismatch { expected: String, actual: String },
    #[error("Upload stream closed: {0}")]
    Stream(String),
    #[error("Error writing file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub digest: Digest,
    pub bytes: u64,
}

/// Temporary upload file, removed on drop unless committed.
///
/// Dropping the upload future (client disconnect) also cleans up.
struct TempUpload {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Problem cleaning up after upload error");
            }
        }
    }
}

/// Stream `body` into the store under `digest`.
///
/// The byte count is enforced while streaming and checked exactly at the
/// end, then the digest is compared, and only then is the object committed.
/// On any failure the temporary file is removed and nothing becomes visible.
pub async fn upload<S, E>(
    store: &dyn ObjectStore,
    digest: &Digest,
    declared_len: u64,
    mut body: S,
) -> Result<UploadReceipt, UploadError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let started = Instant::now();
    let mut temp = TempUpload {
        path: store.begin_upload(digest).await?,
        committed: false,
    };
    let mut file = fs::File::create(&temp.path).await?;
    let mut hasher = Hasher::new(digest.algorithm());
    let mut received: u64 = 0;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| UploadError::Stream(e.to_string()))?;
        received += chunk.len() as u64;
        if received > declared_len {
            return Err(UploadError::TooManyBytes {
                received,
                declared: declared_len,
            });
        }
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }

    if received != declared_len {
        return Err(UploadError::LengthMismatch {
            received,
            declared: declared_len,
        });
    }
    file.flush().await?;
    drop(file);

    let actual = hasher.finalize_hex();
    if actual != digest.as_str() {
        return Err(UploadError::DigestMismatch {
            expected: digest.to_string(),
            actual,
        });
    }

    store.commit(digest, &temp.path).await?;
    temp.committed = true;

    tracing::info!(
        digest = %digest,
        bytes = received,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Uploaded file"
    );
    Ok(UploadReceipt {
        digest: digest.clone(),
        bytes: received,
    })
}
