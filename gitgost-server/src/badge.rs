//! SVG badges: the static "Anonymous Contributor Friendly" badge (green
//! when the repo opts in via `.gitgost.yml`) and a per-repo counter of
//! anonymous PRs backed by the datastore through a short-lived cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::debug;

use crate::{router, AppState};

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const GREEN: &str = "#4CAF50";
const GRAY: &str = "#9E9E9E";

/// Per-`owner/repo` PR counts with a five-minute TTL. Entries are refreshed
/// only when the datastore answers, so a flaky backend serves the last
/// known count instead of a sticky zero.
pub struct BadgeCache {
    entries: Mutex<HashMap<String, (i64, Instant)>>,
}

impl BadgeCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<(i64, bool)> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .map(|(count, at)| (*count, at.elapsed() <= CACHE_TTL))
    }

    fn put(&self, key: &str, count: i64) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (count, Instant::now()));
    }
}

impl Default for BadgeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `GET /badge/anonymous-friendly.svg?repo=owner/name`
pub async fn static_badge(
    State(state): State<Arc<AppState>>,
    Path(badge): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if badge != "anonymous-friendly.svg" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Badge not found" })),
        )
            .into_response();
    }

    let repo_param = params.get("repo").map(String::as_str).unwrap_or("");
    let mut verified = false;
    if let Some((owner, repo)) = repo_param.split_once('/') {
        if router::is_valid_repo_name(owner) && router::is_valid_repo_name(repo) {
            verified = state.github.is_repo_verified(owner, repo).await;
        }
    }

    // Static usage (no repo parameter) renders green; with a repo it
    // reflects verification.
    let fill = if repo_param.is_empty() || verified {
        GREEN
    } else {
        GRAY
    };
    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="230" height="20" role="img" aria-label="Anonymous Contributor Friendly" viewBox="0 0 230 20">
  <title>Anonymous Contributor Friendly</title>
  <rect width="230" height="20" rx="3" fill="{}"/>
  <g fill="#fff" text-anchor="middle" font-family="Verdana,Geneva,DejaVu Sans,sans-serif" font-size="11">
    <text x="115" y="14">Anonymous Contributor Friendly</text>
  </g>
</svg>"##,
        fill
    );

    svg_response(svg, false)
}

/// `GET /badge/:owner/:repo` serves the counter of anonymous PRs for the repo.
pub async fn pr_count_badge(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
) -> Response {
    if !router::is_valid_repo_name(&owner) || !router::is_valid_repo_name(&repo) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid owner or repo" })),
        )
            .into_response();
    }

    let key = format!("{}/{}", owner, repo);
    let cached = state.badge_cache.get(&key);
    let mut count = cached.map(|(count, _)| count).unwrap_or(0);

    let fresh = matches!(cached, Some((_, true)));
    if !fresh {
        let mut answered = false;
        if let Some(store) = &state.store {
            match store.pr_count_by_repo(&owner, &repo).await {
                Ok(db_count) => {
                    count = db_count;
                    answered = true;
                }
                Err(err) => debug!("badge count lookup failed for {}: {}", key, err),
            }
        }
        // Refresh the TTL only with a real answer, or to re-arm a count we
        // already knew.
        if answered || cached.is_some() {
            state.badge_cache.put(&key, count);
        }
    }

    svg_response(counter_svg(count), true)
}

fn counter_svg(count: i64) -> String {
    let label = "Anonymous PRs";
    let value = count.to_string();
    let value_width = (value.len() * 7 + 16).max(30);
    let total_width = 100 + value_width;
    let value_mid = 100 + value_width / 2;

    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{total}" height="20" role="img" aria-label="{label}: {value}" viewBox="0 0 {total} 20">
  <title>{label}: {value}</title>
  <clipPath id="r"><rect width="{total}" height="20" rx="3" fill="#fff"/></clipPath>
  <g clip-path="url(#r)">
    <rect width="100" height="20" fill="#555"/>
    <rect x="100" width="{value_width}" height="20" fill="{green}"/>
  </g>
  <g fill="#fff" text-anchor="middle" font-family="DejaVu Sans,Verdana,Geneva,sans-serif" font-size="11">
    <text x="50" y="14">{label}</text>
    <text x="{value_mid}" y="14">{value}</text>
  </g>
</svg>"##,
        total = total_width,
        label = label,
        value = value,
        value_width = value_width,
        value_mid = value_mid,
        green = GREEN,
    )
}

fn svg_response(svg: String, cacheable: bool) -> Response {
    let mut response = ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response();
    if cacheable {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("public, max-age=300"),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_reports_staleness() {
        let cache = BadgeCache::new();
        assert_eq!(cache.get("acme/lib"), None);
        cache.put("acme/lib", 7);
        assert_eq!(cache.get("acme/lib"), Some((7, true)));
    }

    #[test]
    fn counter_svg_scales_with_value_length() {
        let narrow = counter_svg(1);
        let wide = counter_svg(1_234_567);
        assert!(narrow.contains("Anonymous PRs"));
        assert!(narrow.len() < wide.len());
        assert!(wide.contains("1234567"));
    }
}
