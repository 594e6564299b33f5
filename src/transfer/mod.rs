//! Streaming transfer pipelines between HTTP bodies and the object store.

mod download;
mod upload;

pub use download::{open, parse_range, ByteRange, DownloadStream, RangeError};
pub use upload::{upload, UploadError, UploadReceipt};
