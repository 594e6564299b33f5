use subtle::ConstantTimeEq;

use crate::digest::{digest_of_bytes, Algorithm};

use super::TaskKind;

/// Signature a client must present for `kind` on `digest`.
///
/// The sha1 of the compact JSON object
/// `{"algorithm":..,"hash":..,"name":..,"password":..}` with keys in
/// alphabetical order.
pub fn expected_signature(kind: TaskKind, algorithm: Algorithm, digest: &str, password: &str) -> String {
    // serde_json maps keep keys sorted, which is the canonical order.
    let canonical = serde_json::json!({
        "algorithm": algorithm.name(),
        "hash": digest,
        "name": kind.name(),
        "password": password,
    });
    digest_of_bytes(Algorithm::Sha1, canonical.to_string().as_bytes())
}

pub(crate) fn signatures_match(expected: &str, provided: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}
