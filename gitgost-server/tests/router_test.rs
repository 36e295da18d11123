//! Router-level tests. The forge and datastore endpoints point at an
//! unreachable local port, so these exercise routing, middlewares and the
//! protocol-error paths without touching the network.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use gitgost_server::config::{Config, LogFormat};
use gitgost_server::{router, AppState};

fn test_config(api_key: Option<&str>) -> Config {
    Config {
        port: 0,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        api_key: api_key.map(str::to_string),
        github_token: None,
        // Nothing listens here; forge calls fail fast.
        github_api_url: "http://127.0.0.1:1".to_string(),
        github_url: "http://127.0.0.1:1".to_string(),
        supabase_url: None,
        supabase_key: None,
        ntfy_base_url: "http://127.0.0.1:1".to_string(),
        log_format: LogFormat::Text,
        commit_hash: "test".to_string(),
        build_time: "test".to_string(),
    }
}

fn test_app(api_key: Option<&str>) -> axum::Router {
    let state = Arc::new(AppState::new(test_config(api_key), None).unwrap());
    router::build_router(state)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn info_refs_rejects_unknown_service() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::get("/v1/gh/acme/lib/info/refs?service=git-unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn info_refs_requires_a_service() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::get("/v1/gh/acme/lib/info/refs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_pack_route_exists_and_fails_upstream_not_404() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::post("/v1/gh/acme/lib/git-upload-pack")
                .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
                .body(Body::from("0000"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_server_error());
}

#[tokio::test]
async fn invalid_repo_names_are_rejected() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::get("/v1/gh/a..b/lib/info/refs?service=git-receive-pack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn receive_pack_with_garbage_body_reports_no_packfile_in_band() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::post("/v1/gh/acme/lib/git-receive-pack")
                .header(
                    header::CONTENT_TYPE,
                    "application/x-git-receive-pack-request",
                )
                .body(Body::from(vec![0u8; 1024]))
                .unwrap(),
        )
        .await
        .unwrap();

    // Protocol failures still answer 200; the error rides on band 3.
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-receive-pack-result"
    );
    let body = body_string(response).await;
    assert!(body.contains("unpack error: no packfile found"), "{}", body);
    assert!(body.ends_with("0000"), "missing flush: {:?}", body);
}

#[tokio::test]
async fn api_key_gate_spares_git_paths() {
    let app = test_app(Some("sekrit"));

    // Issues endpoint requires the key.
    let response = app
        .clone()
        .oneshot(
            Request::post("/v1/gh/acme/lib/issues")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"title":"t","body":"b"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong key is rejected too.
    let response = app
        .clone()
        .oneshot(
            Request::post("/v1/gh/acme/lib/issues")
                .header(header::CONTENT_TYPE, "application/json")
                .header("X-Gitgost-Key", "wrong")
                .body(Body::from(r#"{"title":"t","body":"b"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Push discovery stays anonymous: it may fail upstream but is never
    // challenged for the key.
    let response = app
        .oneshot(
            Request::get("/v1/gh/acme/lib/info/refs?service=git-receive-pack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn moderation_report_form_renders_and_records() {
    let app = test_app(None);

    let response = app
        .clone()
        .oneshot(
            Request::get("/v1/moderation/report?hash=abcd1234")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("abcd1234"));
    assert!(body.contains("registered"));

    let response = app
        .oneshot(
            Request::post("/v1/moderation/report")
                .header(
                    header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(Body::from("hash=abcd1234"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("Total reports: 1"), "{}", body);
}

#[tokio::test]
async fn report_form_requires_a_hash() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::get("/v1/moderation/report")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_string(response).await;
    assert!(body.contains("A hash is required."));
}

#[tokio::test]
async fn health_is_unauthenticated() {
    let app = test_app(Some("sekrit"));
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("healthy"));
}

#[tokio::test]
async fn stats_without_datastore_reports_zero() {
    let app = test_app(None);
    let response = app
        .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("\"total_prs\":0"));
}

#[tokio::test]
async fn pr_status_returns_notification_topic() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::get("/pr/deadbeef/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("gitgost-deadbeef"));
    assert!(body.contains("subscribe_url"));
}

#[tokio::test]
async fn counter_badge_renders_without_datastore() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::get("/badge/acme/lib")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/svg+xml");
    let body = body_string(response).await;
    assert!(body.contains("Anonymous PRs"));
}

#[tokio::test]
async fn unknown_static_badge_is_404() {
    let app = test_app(None);
    let response = app
        .oneshot(
            Request::get("/badge/other-badge.svg")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
