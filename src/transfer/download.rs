use std::io::SeekFrom;

use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio_util::io::ReaderStream;

use crate::object_store::Location;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("Requested range not satisfiable for an object of {size} bytes")]
    Unsatisfiable { size: u64 },
}

/// Inclusive byte range within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for a `Content-Range` response header.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// Resolve a `Range` header against an object of `size` bytes.
///
/// Only a single `bytes` range is honored. Other units, multiple ranges and
/// malformed headers yield `Ok(None)`, meaning the whole object is served.
pub fn parse_range(header: &str, size: u64) -> Result<Option<ByteRange>, RangeError> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((first, last)) = spec.split_once('-') else {
        return Ok(None);
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // suffix range: the last n bytes
        let Ok(n) = last.parse::<u64>() else {
            return Ok(None);
        };
        if n == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable { size });
        }
        return Ok(Some(ByteRange {
            start: size.saturating_sub(n),
            end: size - 1,
        }));
    }

    let Ok(start) = first.parse::<u64>() else {
        return Ok(None);
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return Ok(None),
        }
    };
    if start >= size {
        return Err(RangeError::Unsatisfiable { size });
    }
    Ok(Some(ByteRange {
        start,
        end: end.map_or(size - 1, |end| end.min(size - 1)),
    }))
}

pub type DownloadStream = ReaderStream<Take<fs::File>>;

/// Stream the located file, or only `range` of it.
pub async fn open(
    location: &Location,
    range: Option<ByteRange>,
) -> Result<DownloadStream, std::io::Error> {
    let mut file = fs::File::open(location.path()).await?;
    let len = match range {
        Some(range) => {
            file.seek(SeekFrom::Start(range.start)).await?;
            range.len()
        }
        None => location.size,
    };
    Ok(ReaderStream::new(file.take(len)))
}
