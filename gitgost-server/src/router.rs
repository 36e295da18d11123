//! Route table and the middlewares guarding the `/v1` surface.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;

use crate::{badge, issues, report, smart_http, status, AppState};

/// Maximum allowed push size.
const MAX_PUSH_SIZE: usize = 100 * 1024 * 1024;

pub fn build_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/gh/:owner/:repo/info/refs", get(smart_http::info_refs))
        .route(
            "/gh/:owner/:repo/git-receive-pack",
            post(smart_http::receive_pack),
        )
        .route(
            "/gh/:owner/:repo/git-upload-pack",
            post(smart_http::upload_pack),
        )
        .route("/gh/:owner/:repo/issues", post(issues::create_issue))
        .route(
            "/gh/:owner/:repo/issues/:number/comments",
            post(issues::create_issue_comment),
        )
        .route(
            "/gh/:owner/:repo/pulls/:number/comments",
            post(issues::create_pr_comment),
        )
        .route(
            "/moderation/report",
            get(report::report_form).post(report::submit_report),
        )
        .layer(RequestBodyLimitLayer::new(MAX_PUSH_SIZE))
        .layer(middleware::from_fn(validate_repo_names))
        .layer(middleware::from_fn_with_state(state.clone(), api_key_gate));

    // The JSON/badge surface answers quickly and gets the configured
    // response deadline; git transfers are exempt and run under the
    // request's own lifetime.
    let surface = Router::new()
        .route("/health", get(status::health))
        .route("/metrics", get(status::metrics))
        .route("/api/stats", get(status::stats))
        .route("/api/prs/recent", get(status::recent_prs))
        .route("/badge/:owner", get(badge::static_badge))
        .route("/badge/:owner/:repo", get(badge::pr_count_badge))
        .route("/pr/:hash/status", get(status::pr_status))
        .layer(
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(state.config.write_timeout))
                .layer(RequestBodyTimeoutLayer::new(state.config.read_timeout)),
        );

    Router::new()
        .merge(surface)
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Owner and repository names are restricted to a conservative character
/// set; anything else cannot reach a handler (path traversal, URL smuggling
/// into the forge).
pub fn is_valid_repo_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 100 {
        return false;
    }
    if name.contains("..") || name.contains('/') {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

async fn validate_repo_names(
    Path(params): Path<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Response {
    for key in ["owner", "repo"] {
        if let Some(value) = params.get(key) {
            if !is_valid_repo_name(value) {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid repo name" })),
                )
                    .into_response();
            }
        }
    }
    next.run(request).await
}

/// Require `X-Gitgost-Key` on the non-git API surface when a key is
/// configured. Push discovery and receive-pack are always exempt so pushing
/// stays anonymous.
async fn api_key_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path.contains("git-receive-pack") || path.contains("info/refs") {
        return next.run(request).await;
    }
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(request).await;
    };
    match request
        .headers()
        .get("X-Gitgost-Key")
        .and_then(|v| v.to_str().ok())
    {
        Some(provided) if provided == expected => next.run(request).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid API key" })),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "API key required" })),
        )
            .into_response(),
    }
}
