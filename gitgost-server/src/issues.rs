//! Anonymous issues and comments.
//!
//! Every write derives (or reuses) a pseudonym for the caller, enforces the
//! moderation gates, and appends a visible legend with the pseudonym, its
//! karma and a report link so readers can hold anonymous authors to
//! account.

use std::sync::Arc;

use axum::{
    extract::{Host, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct IssueRequest {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    #[serde(default)]
    pub user_token: String,
    pub body: String,
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

/// `POST /v1/gh/:owner/:repo/issues`
pub async fn create_issue(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Json(request): Json<IssueRequest>,
) -> Response {
    if request.title.trim().is_empty() || request.body.trim().is_empty() {
        return bad_request("title and body are required");
    }

    let (issue_url, number) = match state
        .github
        .create_issue(&owner, &repo, &request.title, &request.body, &request.labels)
        .await
    {
        Ok(created) => created,
        Err(err) => {
            warn!("issue creation failed on {}/{}: {:#}", owner, repo, err);
            return bad_request(&err.to_string());
        }
    };

    let user_token = crate::moderation::generate_user_token();
    let hash = state.moderation.derive_hash(&owner, &repo, number, &user_token);
    let karma = state.moderation.karma(&hash).await + 1;
    state.moderation.set_karma(&hash, karma).await;

    Json(json!({
        "issue_url": issue_url,
        "number": number,
        "hash": hash,
        "karma": karma,
        "user_token": user_token.clone(),
        "issue_reply_token": user_token,
    }))
    .into_response()
}

/// `POST /v1/gh/:owner/:repo/issues/:number/comments`
pub async fn create_issue_comment(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, number)): Path<(String, String, u64)>,
    host: Host,
    headers: HeaderMap,
    Json(request): Json<CommentRequest>,
) -> Response {
    anonymous_comment(state, owner, repo, number, host, headers, request).await
}

/// `POST /v1/gh/:owner/:repo/pulls/:number/comments`. The forge shares the
/// issues comment endpoint for general PR comments.
pub async fn create_pr_comment(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, number)): Path<(String, String, u64)>,
    host: Host,
    headers: HeaderMap,
    Json(request): Json<CommentRequest>,
) -> Response {
    anonymous_comment(state, owner, repo, number, host, headers, request).await
}

async fn anonymous_comment(
    state: Arc<AppState>,
    owner: String,
    repo: String,
    number: u64,
    Host(host): Host,
    headers: HeaderMap,
    request: CommentRequest,
) -> Response {
    if number == 0 {
        return bad_request("invalid issue number");
    }
    if request.body.trim().is_empty() {
        return bad_request("body is required");
    }

    let user_token = if request.user_token.trim().is_empty() {
        crate::moderation::generate_user_token()
    } else {
        request.user_token.clone()
    };
    let hash = state.moderation.derive_hash(&owner, &repo, number, &user_token);

    let now = Utc::now();
    let reports = state.moderation.report_count(&hash, now).await;
    if reports > 5 || state.moderation.is_blocked(&hash) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "hash blocked by reports" })),
        )
            .into_response();
    }
    if reports > 2 && state.moderation.is_flagged_cooldown(&hash, now) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "cooldown active due to reports" })),
        )
            .into_response();
    }

    // Flagged hashes write with karma hard-reset to zero.
    let karma = if reports > 2 {
        0
    } else {
        state.moderation.karma(&hash).await + 1
    };
    state.moderation.set_karma(&hash, karma).await;
    if reports > 2 {
        state.moderation.mark_flagged_action(&hash, now);
        let github = state.github.clone();
        let flagged = hash.clone();
        tokio::spawn(async move {
            if let Err(err) = github.update_comments_karma_by_hash(&flagged, 0).await {
                warn!("karma rewrite failed for {}: {:#}", flagged, err);
            }
        });
    }

    let report_url = format!(
        "{}://{}/v1/moderation/report?hash={}",
        request_scheme(&headers),
        host,
        hash
    );
    let body_with_legend = format!(
        "{}\n\n---\ngoster-{} · karma ({}) · [report]({})",
        request.body, hash, karma, report_url
    );

    let comment_url = match state
        .github
        .create_issue_comment(&owner, &repo, number, &body_with_legend)
        .await
    {
        Ok(url) => url,
        Err(err) => {
            warn!("comment failed on {}/{}#{}: {:#}", owner, repo, number, err);
            return bad_request(&err.to_string());
        }
    };

    Json(json!({
        "comment_url": comment_url,
        "hash": hash,
        "karma": karma,
        "user_token": user_token,
    }))
    .into_response()
}

/// Scheme as seen by the client, honoring the reverse proxy's
/// `X-Forwarded-Proto`.
fn request_scheme(headers: &HeaderMap) -> &str {
    headers
        .get("X-Forwarded-Proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_defaults_to_http() {
        assert_eq!(request_scheme(&HeaderMap::new()), "http");
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-Proto", "https".parse().unwrap());
        assert_eq!(request_scheme(&headers), "https");
    }
}
