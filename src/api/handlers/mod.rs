mod objects;
mod service;

use serde::Deserialize;

use crate::api::response::ApiError;
use crate::digest::{Algorithm, Digest, DigestError};
use crate::object_store::ObjectStoreError;
use crate::regulator::AdmissionError;

pub use objects::{check, download, upload};
pub use service::{health, probe};

/// Credentials carried in the query string of every object route.
#[derive(Debug, Default, Deserialize)]
pub struct AccessParams {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub signature: String,
}

/// Validate the `:algorithm/:digest` path segments.
fn parse_digest(algorithm: &str, digest: &str) -> Result<Digest, ApiError> {
    let algorithm: Algorithm = algorithm.parse().map_err(digest_error)?;
    Digest::parse(algorithm, digest).map_err(digest_error)
}

fn digest_error(e: DigestError) -> ApiError {
    ApiError::bad_request(e.to_string())
}

/// Map a regulator rejection to an ApiError
fn admission_error(e: AdmissionError) -> ApiError {
    match e {
        AdmissionError::UnknownChannel(_) | AdmissionError::BadSignature => {
            ApiError::forbidden(e.to_string())
        }
        AdmissionError::NoQuota(_)
        | AdmissionError::FilesPerDayExceeded
        | AdmissionError::BytesPerDayExceeded => ApiError::too_many_requests(e.to_string()),
        AdmissionError::Abandoned => ApiError::internal(e.to_string()),
    }
}

fn store_error(e: ObjectStoreError) -> ApiError {
    ApiError::internal(e.to_string())
}
