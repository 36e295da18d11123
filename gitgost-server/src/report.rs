//! The public moderation surface: a small HTML form for reporting a
//! pseudonym hash, and the state transitions each report triggers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{Html, IntoResponse, Response},
    Form,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use crate::moderation::ReportState;
use crate::AppState;

const FORM_TEMPLATE: &str = include_str!("templates/report_form.html");
const THANKS_TEMPLATE: &str = include_str!("templates/report_thanks.html");

#[derive(Debug, Deserialize)]
pub struct ReportForm {
    #[serde(default)]
    pub hash: String,
}

fn render_form(hash: &str, reports: i64, state_label: &str, error: Option<&str>) -> Html<String> {
    let error_html = match error {
        Some(error) => format!(r#"<div class="error">{}</div>"#, error),
        None => String::new(),
    };
    Html(
        FORM_TEMPLATE
            .replace("{hash}", &escape(hash))
            .replace("{reports}", &reports.to_string())
            .replace("{state}", state_label)
            .replace("{error}", &error_html),
    )
}

fn render_thanks(hash: &str, reports: i64, state_label: &str) -> Html<String> {
    Html(
        THANKS_TEMPLATE
            .replace("{hash}", &escape(hash))
            .replace("{reports}", &reports.to_string())
            .replace("{state}", state_label),
    )
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `GET /v1/moderation/report?hash=...`
pub async fn report_form(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let hash = params
        .get("hash")
        .map(|h| h.trim().to_string())
        .unwrap_or_default();
    if hash.is_empty() {
        return render_form("", 0, "no data", Some("A hash is required.")).into_response();
    }
    if state.moderation.is_blocked(&hash) {
        return render_form(
            &hash,
            6,
            ReportState::Blocked.label(),
            Some("This hash has already been banned and its comments removed."),
        )
        .into_response();
    }
    let reports = state.moderation.report_count(&hash, Utc::now()).await;
    render_form(&hash, reports, ReportState::from_count(reports).label(), None).into_response()
}

/// `POST /v1/moderation/report`
///
/// Records the report and applies the escalation for the new count: 3-5
/// resets karma and starts the cooldown, 6+ blocks the hash and kicks off
/// best-effort comment deletion.
pub async fn submit_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<ReportForm>,
) -> Response {
    let hash = form.hash.trim().to_string();
    if hash.is_empty() {
        return render_form("", 0, "no data", Some("A hash is required.")).into_response();
    }

    let now = Utc::now();
    let ip = client_ip(&headers);
    let reports = state.moderation.record_report(&hash, &ip, now).await;

    match ReportState::from_count(reports) {
        ReportState::Registered => {}
        ReportState::Flagged => {
            state.moderation.set_karma(&hash, 0).await;
            state.moderation.mark_flagged_action(&hash, now);
            let github = state.github.clone();
            let flagged = hash.clone();
            tokio::spawn(async move {
                if let Err(err) = github.update_comments_karma_by_hash(&flagged, 0).await {
                    warn!("karma rewrite failed for {}: {:#}", flagged, err);
                }
            });
        }
        ReportState::Blocked => {
            state.moderation.set_blocked(&hash);
            let github = state.github.clone();
            let blocked = hash.clone();
            tokio::spawn(async move {
                if let Err(err) = github.delete_comments_by_hash(&blocked).await {
                    warn!("comment deletion failed for {}: {:#}", blocked, err);
                }
            });
        }
    }

    render_thanks(&hash, reports, ReportState::from_count(reports).label()).into_response()
}

/// Reporter identity for idempotence, as seen through the reverse proxy.
/// Only used to deduplicate reports, never logged or stored beyond the
/// report window.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    headers
        .get("X-Real-Ip")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "1.2.3.4, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "1.2.3.4");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_empty() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Real-Ip", "9.8.7.6".parse().unwrap());
        assert_eq!(client_ip(&headers), "9.8.7.6");
        assert_eq!(client_ip(&HeaderMap::new()), "");
    }

    #[test]
    fn form_rendering_escapes_the_hash() {
        let html = render_form("<script>", 2, "registered", None).0;
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("Reports: <strong>2</strong>"));
        assert!(!html.contains(r#"class="error""#));
    }

    #[test]
    fn thanks_rendering_includes_state() {
        let html = render_thanks("abcd1234", 4, "flagged").0;
        assert!(html.contains("abcd1234"));
        assert!(html.contains("Total reports: 4"));
        assert!(html.contains("State: flagged"));
    }
}
