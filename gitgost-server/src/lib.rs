pub mod badge;
pub mod config;
pub mod git;
pub mod github;
pub mod issues;
pub mod moderation;
pub mod ntfy;
pub mod report;
pub mod router;
pub mod smart_http;
pub mod status;
pub mod store;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use badge::BadgeCache;
use config::Config;
use github::GitHubClient;
use moderation::Moderation;
use ntfy::NtfyPublisher;
use store::Datastore;

pub struct AppState {
    pub config: Config,
    pub github: Arc<GitHubClient>,
    pub ntfy: Arc<NtfyPublisher>,
    pub store: Option<Arc<dyn Datastore>>,
    pub moderation: Arc<Moderation>,
    pub badge_cache: BadgeCache,
    /// Dedicated client for the upload-pack reverse proxy (30 s timeout).
    pub proxy_client: reqwest::Client,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, store: Option<Arc<dyn Datastore>>) -> Result<Self> {
        let github = Arc::new(GitHubClient::new(
            config.github_api_url.clone(),
            config.github_token.clone(),
        )?);
        let ntfy = Arc::new(NtfyPublisher::new(config.ntfy_base_url.clone())?);
        let proxy_client = reqwest::Client::builder()
            .user_agent("git/2.0")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build proxy HTTP client")?;

        Ok(AppState {
            github,
            ntfy,
            moderation: Arc::new(Moderation::new(store.clone())),
            store,
            badge_cache: BadgeCache::new(),
            proxy_client,
            started_at: Instant::now(),
            config,
        })
    }
}
