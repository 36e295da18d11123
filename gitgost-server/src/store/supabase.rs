//! Supabase (PostgREST) implementation of the datastore.
//!
//! Counts never fetch rows: requests carry `Prefer: count=exact` with a
//! zero-length range and the total is read back from the `Content-Range`
//! header (`0-0/N` or `*/N`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response, StatusCode};

use super::{Datastore, KarmaRecord, PrRecord, ReportRecord, StoreError};

pub struct SupabaseStore {
    client: Client,
    base_url: String,
    key: String,
}

impl SupabaseStore {
    pub fn new(base_url: String, key: String) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            key,
        })
    }

    fn request(&self, method: reqwest::Method, path_and_query: &str) -> reqwest::RequestBuilder {
        self.client
            .request(
                method,
                format!("{}/rest/v1/{}", self.base_url, path_and_query),
            )
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .header("Content-Type", "application/json")
    }

    /// Issue a zero-range exact-count request and parse the total.
    async fn count(&self, path_and_query: &str) -> Result<i64, StoreError> {
        let response = self
            .request(reqwest::Method::GET, path_and_query)
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", "0-0")
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(StoreError::Status(status.as_u16()));
        }
        let header = response
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StoreError::Malformed("missing Content-Range header".to_string()))?;
        parse_content_range_total(header)
            .ok_or_else(|| StoreError::Malformed(format!("invalid Content-Range: {}", header)))
    }

    fn expect_write(response: Response, accept: &[StatusCode]) -> Result<(), StoreError> {
        let status = response.status();
        if accept.contains(&status) {
            Ok(())
        } else {
            Err(StoreError::Status(status.as_u16()))
        }
    }
}

/// `0-0/42` or `*/42` -> `42`.
fn parse_content_range_total(header: &str) -> Option<i64> {
    let (_, total) = header.rsplit_once('/')?;
    total.parse().ok()
}

#[async_trait]
impl Datastore for SupabaseStore {
    async fn insert_pr(&self, owner: &str, repo: &str, url: &str) -> Result<(), StoreError> {
        let record = PrRecord {
            owner: owner.to_string(),
            repo: repo.to_string(),
            url: url.to_string(),
            created_at: Utc::now(),
        };
        let response = self
            .request(reqwest::Method::POST, "prs")
            .header("Prefer", "return=minimal")
            .json(&record)
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        if response.status() == StatusCode::CONFLICT {
            return Err(StoreError::DuplicateUrl(url.to_string()));
        }
        Self::expect_write(response, &[StatusCode::CREATED])
    }

    async fn total_prs(&self) -> Result<i64, StoreError> {
        self.count("prs").await
    }

    async fn latest_pr_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let response = self
            .request(
                reqwest::Method::GET,
                "prs?select=created_at&order=created_at.desc&limit=1",
            )
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        #[derive(serde::Deserialize)]
        struct Row {
            created_at: DateTime<Utc>,
        }
        let rows: Vec<Row> = response
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(rows.into_iter().next().map(|r| r.created_at))
    }

    async fn recent_prs(&self, limit: usize) -> Result<Vec<PrRecord>, StoreError> {
        let limit = limit.clamp(1, 100);
        let response = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "prs?select=owner,repo,url,created_at&order=created_at.desc&limit={}",
                    limit
                ),
            )
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))
    }

    async fn pr_count_by_repo(&self, owner: &str, repo: &str) -> Result<i64, StoreError> {
        self.count(&format!("prs?owner=eq.{}&repo=eq.{}&select=id", owner, repo))
            .await
    }

    async fn karma(&self, hash: &str) -> Result<i64, StoreError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("karma?select=karma&hash=eq.{}&limit=1", hash),
            )
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        let rows: Vec<KarmaRecord> = response
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(rows.into_iter().next().map(|r| r.karma).unwrap_or(0))
    }

    async fn upsert_karma(&self, hash: &str, karma: i64) -> Result<(), StoreError> {
        let record = KarmaRecord {
            hash: hash.to_string(),
            karma,
            updated_at: Utc::now(),
        };
        let response = self
            .request(reqwest::Method::POST, "karma")
            .header("Prefer", "return=minimal,resolution=merge-duplicates")
            .json(&record)
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Self::expect_write(response, &[StatusCode::CREATED, StatusCode::NO_CONTENT])
    }

    async fn insert_report(&self, hash: &str, ip: &str) -> Result<(), StoreError> {
        let record = ReportRecord {
            hash: hash.to_string(),
            reason: "report".to_string(),
            ip: ip.to_string(),
            created_at: Utc::now(),
        };
        let response = self
            .request(reqwest::Method::POST, "reports")
            .header("Prefer", "return=minimal")
            .json(&record)
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Self::expect_write(response, &[StatusCode::CREATED, StatusCode::NO_CONTENT])
    }

    async fn report_count(&self, hash: &str) -> Result<i64, StoreError> {
        self.count(&format!("reports?hash=eq.{}&select=id", hash)).await
    }

    async fn has_report_from_ip(&self, hash: &str, ip: &str) -> Result<bool, StoreError> {
        if ip.is_empty() {
            return Ok(false);
        }
        let count = self
            .count(&format!("reports?hash=eq.{}&ip=eq.{}&select=id", hash, ip))
            .await?;
        Ok(count > 0)
    }

    async fn delete_reports_before(
        &self,
        hash: &str,
        before: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!(
                    "reports?hash=eq.{}&created_at=lt.{}",
                    hash,
                    before.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            )
            .header("Prefer", "return=minimal")
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Self::expect_write(response, &[StatusCode::OK, StatusCode::NO_CONTENT])
    }
}
