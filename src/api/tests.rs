use std::time::Instant;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use super::create_router;
use crate::digest::{digest_of_bytes, Algorithm, Digest};
use crate::regulator::{QuotaUsage, TaskKind, SIGNATURE_REJECTION_DELAY};
use crate::testutil::{signed_uri, test_state, TEST_CHANNEL};
use crate::AppState;

fn digest_for(algorithm: Algorithm, data: &[u8]) -> Digest {
    Digest::parse(algorithm, &digest_of_bytes(algorithm, data)).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn put(app: &Router, digest: &Digest, data: &[u8]) -> axum::response::Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(signed_uri("set", TaskKind::Upload, digest))
        .header(header::CONTENT_LENGTH, data.len())
        .body(Body::from(data.to_vec()))
        .unwrap();
    send(app, request).await
}

fn download_usage(state: &AppState, num_bytes: u64) -> QuotaUsage {
    state
        .regulator
        .channel(TEST_CHANNEL)
        .and_then(|c| c.download_tier(num_bytes))
        .unwrap()
        .usage()
}

fn files_under(dir: &std::path::Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .count()
}

#[tokio::test]
async fn test_probe_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));

    let response = send(&app, Request::get("/probe").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["success"], true);

    let response = send(
        &app,
        Request::get("/_internal/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_upload_check_download() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let data = b"hello world";
    let digest = digest_for(Algorithm::Sha1, data);

    let check = Request::get(signed_uri("check", TaskKind::Check, &digest))
        .body(Body::empty())
        .unwrap();
    let body = json_body(send(&app, check).await).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["found"], false);

    let response = put(&app, &digest, data).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["success"], true);

    let check = Request::get(signed_uri("check", TaskKind::Check, &digest))
        .body(Body::empty())
        .unwrap();
    let body = json_body(send(&app, check).await).await;
    assert_eq!(body["found"], true);
    assert_eq!(body["size"], data.len());

    let get = Request::get(signed_uri("get", TaskKind::Download, &digest))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, get).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        data.len().to_string()
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], data);
}

#[tokio::test]
async fn test_md5_objects_are_separate() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let data = b"md5 content";
    let digest = digest_for(Algorithm::Md5, data);

    assert_eq!(put(&app, &digest, data).await.status(), StatusCode::OK);
    assert!(dir.path().join("storage/md5-cache").is_dir());
    assert_eq!(files_under(&dir.path().join("storage/md5-cache")), 1);
    assert_eq!(files_under(&dir.path().join("storage/sha1-cache")), 0);
}

#[tokio::test]
async fn test_download_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let digest = digest_for(Algorithm::Sha1, b"never stored");

    let get = Request::get(signed_uri("get", TaskKind::Download, &digest))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, get).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["success"], false);
}

#[tokio::test]
async fn test_malformed_digest_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));

    for uri in [
        "/check/sha1/abc?channel=test&signature=x",
        "/check/sha256/2aae6c35c94fcfb415dbe95f408b9ce91ee846ed?channel=test&signature=x",
        "/check/sha1/2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED?channel=test&signature=x",
        "/get/md5/2aae6c35c94fcfb415dbe95f408b9ce91ee846ed?channel=test&signature=x",
    ] {
        let response = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn test_bad_signature_is_delayed() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let digest = digest_for(Algorithm::Sha1, b"data");
    assert_eq!(put(&app, &digest, b"data").await.status(), StatusCode::OK);

    for uri in [
        format!("/get/sha1/{digest}?channel={TEST_CHANNEL}&signature=wrong"),
        format!("/get/sha1/{digest}?channel=nope&signature=wrong"),
    ] {
        let started = Instant::now();
        let response = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(started.elapsed() >= SIGNATURE_REJECTION_DELAY);
    }
}

#[tokio::test]
async fn test_unsigned_download_does_not_reveal_existence() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let stored = digest_for(Algorithm::Sha1, b"data");
    let missing = digest_for(Algorithm::Sha1, b"never uploaded");
    assert_eq!(put(&app, &stored, b"data").await.status(), StatusCode::OK);

    let requests = [
        Request::get(format!("/get/sha1/{missing}?channel={TEST_CHANNEL}"))
            .body(Body::empty())
            .unwrap(),
        Request::head(format!("/get/sha1/{missing}?channel={TEST_CHANNEL}&signature=wrong"))
            .body(Body::empty())
            .unwrap(),
        Request::get(format!("/get/sha1/{stored}?channel={TEST_CHANNEL}&signature=wrong"))
            .header(header::RANGE, "bytes=100-200")
            .body(Body::empty())
            .unwrap(),
    ];
    for request in requests {
        let started = Instant::now();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(started.elapsed() >= SIGNATURE_REJECTION_DELAY);
    }
}

#[tokio::test]
async fn test_range_download_bills_requested_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let app = create_router(state.clone());
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let digest = digest_for(Algorithm::Sha1, &data);
    assert_eq!(put(&app, &digest, &data).await.status(), StatusCode::OK);

    let get = Request::get(signed_uri("get", TaskKind::Download, &digest))
        .header(header::RANGE, "bytes=0-99")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, get).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-99/10000");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], &data[..100]);

    let usage = download_usage(&state, data.len() as u64);
    assert_eq!(usage.total_files_today, 1);
    assert_eq!(usage.total_bytes_today, 100);
    assert_eq!(usage.active_tasks, 0);
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let digest = digest_for(Algorithm::Sha1, b"short");
    assert_eq!(put(&app, &digest, b"short").await.status(), StatusCode::OK);

    let get = Request::get(signed_uri("get", TaskKind::Download, &digest))
        .header(header::RANGE, "bytes=100-200")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, get).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */5");
}

#[tokio::test]
async fn test_head_is_not_billed() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let app = create_router(state.clone());
    let digest = digest_for(Algorithm::Sha1, b"head only");
    assert_eq!(put(&app, &digest, b"head only").await.status(), StatusCode::OK);

    let head = Request::builder()
        .method(Method::HEAD)
        .uri(signed_uri("get", TaskKind::Download, &digest))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, head).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "8");

    let usage = download_usage(&state, 8);
    assert_eq!(usage.total_files_today, 0);
    assert_eq!(usage.total_bytes_today, 0);
    assert_eq!(usage.active_tasks, 0);
}

#[tokio::test]
async fn test_upload_length_mismatch_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let data = b"0123456789";
    let digest = digest_for(Algorithm::Sha1, data);

    for declared in [5usize, 20] {
        let request = Request::builder()
            .method(Method::POST)
            .uri(signed_uri("set", TaskKind::Upload, &digest))
            .header(header::CONTENT_LENGTH, declared)
            .body(Body::from(data.to_vec()))
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[header::CONNECTION], "close");
    }
    assert_eq!(files_under(&dir.path().join("storage/sha1-cache")), 0);
}

#[tokio::test]
async fn test_upload_digest_mismatch_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let digest = digest_for(Algorithm::Sha1, b"expected content");

    let response = put(&app, &digest, b"tampered content").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[header::CONNECTION], "close");
    assert_eq!(files_under(&dir.path().join("storage/sha1-cache")), 0);
}

#[tokio::test]
async fn test_upload_requires_content_length() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let digest = digest_for(Algorithm::Sha1, b"data");

    let request = Request::builder()
        .method(Method::POST)
        .uri(signed_uri("set", TaskKind::Upload, &digest))
        .body(Body::from("data"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
}

#[tokio::test]
async fn test_upload_over_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(test_state(&dir));
    let digest = digest_for(Algorithm::Sha1, b"data");

    let request = Request::builder()
        .method(Method::POST)
        .uri(signed_uri("set", TaskKind::Upload, &digest))
        .header(header::CONTENT_LENGTH, 100 * 1024 * 1024)
        .body(Body::from("data"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_upload_without_matching_tier() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = crate::testutil::test_config(
        &dir,
        crate::testutil::test_channel(
            crate::testutil::generous_quota(),
            crate::config::QuotaConfig {
                max_file_size: 4,
                ..crate::testutil::generous_quota()
            },
        ),
    );
    config.max_upload_size = 1024;
    let app = create_router(crate::testutil::state_with(config));
    let digest = digest_for(Algorithm::Sha1, b"too large for tier");

    let response = put(&app, &digest, b"too large for tier").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
