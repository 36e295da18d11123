//! Best-effort push notifications over ntfy.
//!
//! Every anonymous PR gets a topic derived from its pr-hash; anyone holding
//! the hash can subscribe without an account. Publication never blocks or
//! fails the protocol response.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_BASE_URL: &str = "https://ntfy.sh";

/// The subscription topic for a PR hash.
pub fn topic_for_pr(pr_hash: &str) -> String {
    format!("gitgost-{}", pr_hash)
}

#[derive(Clone)]
pub struct NtfyPublisher {
    client: reqwest::Client,
    base_url: String,
}

impl NtfyPublisher {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build ntfy HTTP client")?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a plain-text event to the topic for `pr_hash`.
    pub async fn publish(&self, pr_hash: &str, title: &str, message: &str) -> Result<()> {
        let url = format!("{}/{}", self.base_url, topic_for_pr(pr_hash));
        let response = self
            .client
            .post(&url)
            .header("Title", title)
            .header("Tags", "bell")
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(message.to_string())
            .send()
            .await
            .context("ntfy publish failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("ntfy publish failed: status {}", response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_carries_hash() {
        assert_eq!(topic_for_pr("deadbeef"), "gitgost-deadbeef");
    }
}
