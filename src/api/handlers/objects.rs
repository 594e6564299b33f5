use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Serialize;

use super::{admission_error, parse_digest, store_error, AccessParams};
use crate::api::response::{ApiError, AppQuery, Empty, Success};
use crate::digest::Digest;
use crate::object_store::ObjectStore;
use crate::regulator::{ActiveTask, RequestMeta, TaskKind, TaskRequest};
use crate::transfer::{self, DownloadStream, RangeError, UploadError};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn check(
    State(state): State<Arc<AppState>>,
    Path((algorithm, digest)): Path<(String, String)>,
    AppQuery(params): AppQuery<AccessParams>,
) -> Result<Json<Success<CheckResponse>>, ApiError> {
    let digest = parse_digest(&algorithm, &digest)?;
    let store = store_for(&state, &digest)?;

    let _task = state
        .regulator
        .admit(TaskRequest {
            kind: TaskKind::Check,
            channel: &params.channel,
            digest: &digest,
            num_bytes: 0,
            signature: &params.signature,
            meta: RequestMeta::default(),
        })
        .await
        .map_err(admission_error)?;

    let location = store.locate(&digest).await.map_err(store_error)?;
    Ok(Success::json(CheckResponse {
        found: location.is_some(),
        size: location.map(|l| l.size),
    }))
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((algorithm, digest)): Path<(String, String)>,
    AppQuery(params): AppQuery<AccessParams>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let digest = parse_digest(&algorithm, &digest)?;
    let store = store_for(&state, &digest)?;
    let head = method == Method::HEAD;

    // Credentials are checked before existence or range validity is revealed.
    state
        .regulator
        .authorize(TaskRequest {
            kind: TaskKind::Download,
            channel: &params.channel,
            digest: &digest,
            num_bytes: 0,
            signature: &params.signature,
            meta: RequestMeta::default(),
        })
        .await
        .map_err(admission_error)?;

    let location = store
        .locate(&digest)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found(format!("File not found: {digest}")))?;

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => transfer::parse_range(value, location.size).map_err(range_error)?,
        None => None,
    };

    let task = state
        .regulator
        .admit(TaskRequest {
            kind: TaskKind::Download,
            channel: &params.channel,
            digest: &digest,
            num_bytes: location.size,
            signature: &params.signature,
            meta: RequestMeta {
                head,
                range_len: range.map(|r| r.len()),
            },
        })
        .await
        .map_err(admission_error)?;

    let content_length = range.map_or(location.size, |r| r.len());
    let status = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let body = if head {
        Body::empty()
    } else {
        let stream = transfer::open(&location, range).await.map_err(|e| {
            tracing::error!(digest = %digest, error = %e, "Problem opening file for download");
            ApiError::internal(format!("Unable to read file: {e}"))
        })?;
        Body::from_stream(TaskBody::new(stream, task, digest.clone(), content_length))
    };

    let mut response = (
        status,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, content_length.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (
                header::CACHE_CONTROL,
                "public, max-age=31536000, immutable".to_string(),
            ),
        ],
        body,
    )
        .into_response();

    if let Some(range) = range {
        if let Ok(value) = range.content_range(location.size).parse() {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path((algorithm, digest)): Path<(String, String)>,
    AppQuery(params): AppQuery<AccessParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Success<Empty>>, ApiError> {
    // The body is left unread on every failure path, so the connection
    // cannot be reused.
    upload_inner(&state, &algorithm, &digest, &params, &headers, body)
        .await
        .map_err(ApiError::closing)
}

async fn upload_inner(
    state: &AppState,
    algorithm: &str,
    digest: &str,
    params: &AccessParams,
    headers: &HeaderMap,
    body: Body,
) -> Result<Json<Success<Empty>>, ApiError> {
    let digest = parse_digest(algorithm, digest)?;
    let store = store_for(state, &digest)?;

    let declared_len: u64 = headers
        .get(header::CONTENT_LENGTH)
        .ok_or_else(|| ApiError::length_required("Missing Content-Length header"))?
        .to_str()
        .ok()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::bad_request("Invalid Content-Length header"))?;

    if declared_len > state.config.max_upload_size {
        return Err(ApiError::payload_too_large(format!(
            "File exceeds maximum upload size of {} bytes",
            state.config.max_upload_size
        )));
    }

    let mut task = state
        .regulator
        .admit(TaskRequest {
            kind: TaskKind::Upload,
            channel: &params.channel,
            digest: &digest,
            num_bytes: declared_len,
            signature: &params.signature,
            meta: RequestMeta::default(),
        })
        .await
        .map_err(admission_error)?;

    let receipt = transfer::upload(
        store.as_ref(),
        &digest,
        declared_len,
        body.into_data_stream(),
    )
    .await
    .map_err(|e| {
        tracing::warn!(digest = %digest, channel = %params.channel, error = %e, "Upload failed");
        upload_error(e)
    })?;

    task.set_num_bytes(receipt.bytes);
    Ok(Success::json(Empty {}))
}

// ============================================================================
// Helpers
// ============================================================================

fn store_for(state: &AppState, digest: &Digest) -> Result<Arc<dyn ObjectStore>, ApiError> {
    state
        .store(digest.algorithm())
        .cloned()
        .ok_or_else(|| {
            ApiError::bad_request(format!("Unsupported algorithm: {}", digest.algorithm()))
        })
}

fn range_error(e: RangeError) -> ApiError {
    let RangeError::Unsatisfiable { size } = e;
    ApiError::range_not_satisfiable(e.to_string(), size)
}

fn upload_error(e: UploadError) -> ApiError {
    match e {
        UploadError::TooManyBytes { .. }
        | UploadError::LengthMismatch { .. }
        | UploadError::DigestMismatch { .. }
        | UploadError::Stream(_) => ApiError::bad_request(e.to_string()),
        UploadError::Io(_) | UploadError::Store(_) => ApiError::internal(e.to_string()),
    }
}

/// Response body for a download. Holds the task guard so the approval is
/// finalized only once the body has been sent or dropped.
struct TaskBody {
    inner: DownloadStream,
    task: ActiveTask,
    digest: Digest,
    expected: u64,
    sent: u64,
    started: Instant,
}

impl TaskBody {
    fn new(inner: DownloadStream, task: ActiveTask, digest: Digest, expected: u64) -> Self {
        Self {
            inner,
            task,
            digest,
            expected,
            sent: 0,
            started: Instant::now(),
        }
    }
}

impl Stream for TaskBody {
    type Item = std::io::Result<bytes::Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &poll {
            let len = chunk.len() as u64;
            self.sent += len;
        }
        poll
    }
}

impl Drop for TaskBody {
    fn drop(&mut self) {
        self.task.set_num_bytes(self.sent);
        if self.sent == self.expected {
            tracing::info!(
                digest = %self.digest,
                bytes = self.sent,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "Downloaded file"
            );
        } else {
            tracing::warn!(
                digest = %self.digest,
                bytes = self.sent,
                expected = self.expected,
                "Download ended early"
            );
        }
    }
}
