//! Durable counters and records behind an abstract datastore.
//!
//! The trait keeps the rest of the server independent of the backing
//! service. The production implementation speaks the Supabase PostgREST
//! dialect; when no datastore is configured the server runs with the
//! in-memory moderation fallback and simply skips the durable writes;
//! the protocol response never depends on this layer.

mod supabase;

pub use supabase::SupabaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The PR URL is already recorded (unique constraint).
    #[error("PR already recorded: duplicate URL {0}")]
    DuplicateUrl(String),
    #[error("datastore unreachable: {0}")]
    Unreachable(String),
    #[error("datastore returned status {0}")]
    Status(u16),
    #[error("malformed datastore response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrRecord {
    pub owner: String,
    pub repo: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KarmaRecord {
    pub hash: String,
    pub karma: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRecord {
    pub hash: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ip: String,
    pub created_at: DateTime<Utc>,
}

/// Storage operations used by the orchestrator, the stats endpoints and the
/// moderation layer. Implementations must be safe to call concurrently.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn insert_pr(&self, owner: &str, repo: &str, url: &str) -> Result<(), StoreError>;
    async fn total_prs(&self) -> Result<i64, StoreError>;
    async fn latest_pr_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn recent_prs(&self, limit: usize) -> Result<Vec<PrRecord>, StoreError>;
    async fn pr_count_by_repo(&self, owner: &str, repo: &str) -> Result<i64, StoreError>;

    async fn karma(&self, hash: &str) -> Result<i64, StoreError>;
    async fn upsert_karma(&self, hash: &str, karma: i64) -> Result<(), StoreError>;

    async fn insert_report(&self, hash: &str, ip: &str) -> Result<(), StoreError>;
    async fn report_count(&self, hash: &str) -> Result<i64, StoreError>;
    async fn has_report_from_ip(&self, hash: &str, ip: &str) -> Result<bool, StoreError>;
    /// Prune reports older than `before`, implementing the rolling window.
    async fn delete_reports_before(
        &self,
        hash: &str,
        before: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
