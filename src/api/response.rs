use axum::extract::FromRequestParts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// Success envelope
// ============================================================================

/// `{"success": true, ...fields of T}`
#[derive(Debug, Serialize, Deserialize)]
pub struct Success<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Success<T> {
    pub fn json(data: T) -> Json<Success<T>> {
        Json(Success {
            success: true,
            data,
        })
    }
}

/// Body for responses that carry nothing besides `success`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Empty {}

// ============================================================================
// Failure envelope
// ============================================================================

/// `{"success": false, "error": "..."}`
#[derive(Debug, Serialize, Deserialize)]
pub struct Failure {
    pub success: bool,
    pub error: String,
}

// ============================================================================
// Unified error type for handlers
// ============================================================================

/// A failed request: status, a short human-readable reason, and whether the
/// connection must be dropped after responding.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub close_connection: bool,
    /// Object size reported in `Content-Range` for unsatisfiable ranges.
    pub unsatisfied_size: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Responding with error");
        } else {
            tracing::info!(status = %self.status, error = %self.message, "Responding with error");
        }

        let mut response = (
            self.status,
            Json(Failure {
                success: false,
                error: self.message,
            }),
        )
            .into_response();

        let headers = response.headers_mut();
        if self.close_connection {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        if let Some(size) = self.unsatisfied_size {
            if let Ok(value) = format!("bytes */{size}").parse() {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
            close_connection: false,
            unsatisfied_size: None,
        }
    }

    /// Ask the transport to terminate the connection after responding.
    pub fn closing(mut self) -> Self {
        self.close_connection = true;
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn length_required(message: impl Into<String>) -> Self {
        Self::new(StatusCode::LENGTH_REQUIRED, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn range_not_satisfiable(message: impl Into<String>, size: u64) -> Self {
        let mut err = Self::new(StatusCode::RANGE_NOT_SATISFIABLE, message);
        err.unsatisfied_size = Some(size);
        err
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

// ============================================================================
// Custom extractors
// ============================================================================

/// Drop-in replacement for `axum::extract::Query` that rejects with ApiError.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, ApiError> {
        let query = parts.uri.query().unwrap_or_default();
        serde_qs::from_str(query)
            .map(AppQuery)
            .map_err(|e| ApiError::bad_request(friendly_query_error(&e.to_string())))
    }
}

/// Translate serde/serde_qs error messages into human-friendly descriptions.
fn friendly_query_error(raw: &str) -> String {
    let cleaned = raw
        .replace("u32", "non-negative integer")
        .replace("u64", "non-negative integer")
        .replace("i32", "integer")
        .replace("i64", "integer");

    format!("Invalid query parameter: {cleaned}")
}
