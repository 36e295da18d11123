//! Health, metrics, stats and the PR-hash status lookup.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::warn;

use crate::{ntfy, AppState};

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "healthy",
        "time": chrono::Utc::now().to_rfc3339(),
        "commit": state.config.commit_hash,
        "build_time": state.config.build_time,
    }))
    .into_response()
}

/// `GET /metrics`: process-level numbers, no per-request data.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let proc_stats = read_proc_status();
    Json(json!({
        "memory": {
            "rss_bytes": proc_stats.rss_bytes,
        },
        "threads": proc_stats.threads,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

#[derive(Default)]
struct ProcStats {
    rss_bytes: u64,
    threads: u64,
}

/// Best-effort read of `/proc/self/status`; zeroes on non-Linux hosts.
fn read_proc_status() -> ProcStats {
    let mut stats = ProcStats::default();
    let Ok(contents) = std::fs::read_to_string("/proc/self/status") else {
        return stats;
    };
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kib: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            stats.rss_bytes = kib * 1024;
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            stats.threads = rest.trim().parse().unwrap_or(0);
        }
    }
    stats
}

/// `GET /api/stats`
pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    let Some(store) = &state.store else {
        return Json(json!({ "total_prs": 0 })).into_response();
    };

    let total = match store.total_prs().await {
        Ok(total) => total,
        Err(err) => {
            warn!("stats lookup failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to load stats" })),
            )
                .into_response();
        }
    };
    let last_updated = match store.latest_pr_created_at().await {
        Ok(last) => last,
        Err(err) => {
            warn!("stats timestamp lookup failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to load stats" })),
            )
                .into_response();
        }
    };

    let mut body = HashMap::new();
    body.insert("total_prs", json!(total));
    if let Some(last_updated) = last_updated {
        body.insert("last_updated", json!(last_updated));
    }
    Json(body).into_response()
}

/// `GET /api/prs/recent`
pub async fn recent_prs(State(state): State<Arc<AppState>>) -> Response {
    let Some(store) = &state.store else {
        return Json(json!({ "prs": [], "total": 0 })).into_response();
    };

    let prs = match store.recent_prs(10).await {
        Ok(prs) => prs,
        Err(err) => {
            warn!("recent PR lookup failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to load PRs" })),
            )
                .into_response();
        }
    };
    let total = match store.total_prs().await {
        Ok(total) => total,
        Err(err) => {
            warn!("PR count lookup failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to load total count" })),
            )
                .into_response();
        }
    };

    Json(json!({ "prs": prs, "total": total })).into_response()
}

/// `GET /pr/:hash/status` returns the notification topic for a PR hash.
/// Nothing
/// personal is stored or exposed.
pub async fn pr_status(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Response {
    let hash = hash.trim().to_string();
    if hash.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "hash is required" })),
        )
            .into_response();
    }

    let topic = ntfy::topic_for_pr(&hash);
    let subscribe_url = format!("{}/{}", state.ntfy.base_url(), topic);
    Json(json!({
        "hash": hash,
        "ntfy_topic": topic,
        "subscribe_url": subscribe_url,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_status_parse_is_nonzero_on_linux() {
        let stats = read_proc_status();
        if std::path::Path::new("/proc/self/status").exists() {
            assert!(stats.threads >= 1);
        }
    }
}
