//! Typed client for the upstream forge's REST surface.
//!
//! All write paths authenticate with the bearer token from the environment;
//! its absence is reported as `GITHUB_TOKEN not set` and surfaced to the
//! pusher over side band 3. Comment search is the one slow endpoint at the
//! forge, so it gets a longer timeout and a small retry loop; everything
//! else fails fast.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(60);
const SEARCH_ATTEMPTS: u32 = 3;

/// Appended to every PR and issue body created through the proxy.
const ANONYMIZATION_NOTICE: &str = "\n\n---\n\n*This is an anonymous contribution made via \
     [gitGost](https://gitgost.leapcell.app).*\n\n*The original author's identity has been \
     anonymized to protect their privacy.*";

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    api_base: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Ref {
    #[serde(rename = "ref")]
    pub ref_name: String,
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

impl Ref {
    pub fn sha(&self) -> &str {
        &self.object.sha
    }
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct HtmlUrlResponse {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    html_url: String,
    number: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    number: u64,
    repository_url: String,
}

#[derive(Debug, Deserialize)]
struct CommentItem {
    id: u64,
    body: String,
}

#[derive(Debug, Serialize)]
struct CreatePrRequest<'a> {
    title: &'a str,
    head: String,
    base: &'a str,
    body: String,
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    body: String,
    labels: &'a [String],
}

#[derive(Debug, Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

impl GitHubClient {
    pub fn new(api_base: String, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent("gitGost")
            .build()
            .context("failed to build forge HTTP client")?;
        Ok(Self {
            client,
            api_base,
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| anyhow!("GITHUB_TOKEN not set"))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        Ok(builder
            .header("Authorization", format!("token {}", self.token()?))
            .header("Accept", "application/vnd.github+json")
            .timeout(WRITE_TIMEOUT))
    }

    /// Advertised refs of the upstream repository. An empty repository
    /// (409 from the forge) yields an empty list.
    pub async fn get_refs(&self, owner: &str, repo: &str) -> Result<Vec<Ref>> {
        let url = format!("{}/repos/{}/{}/git/refs", self.api_base, owner, repo);
        let response = self
            .authed(self.client.get(&url))?
            .send()
            .await
            .context("failed to list refs")?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(anyhow!("failed to get refs: {}", response.status()));
        }
        response.json().await.context("failed to parse refs")
    }

    /// The login of the account behind the configured token.
    pub async fn authenticated_login(&self) -> Result<String> {
        let url = format!("{}/user", self.api_base);
        let response = self
            .authed(self.client.get(&url))?
            .send()
            .await
            .context("failed to read authenticated user")?;
        if !response.status().is_success() {
            return Err(anyhow!("failed to read user: {}", response.status()));
        }
        let user: UserResponse = response.json().await.context("failed to parse user")?;
        Ok(user.login)
    }

    /// Ensure a fork of `owner/repo` exists for the authenticated account
    /// and return the fork owner. Idempotent: an existing fork is reused.
    pub async fn fork(&self, owner: &str, repo: &str) -> Result<String> {
        let fork_owner = self.authenticated_login().await?;

        let probe = format!("{}/repos/{}/{}", self.api_base, fork_owner, repo);
        let response = self
            .authed(self.client.get(&probe))?
            .send()
            .await
            .context("failed to probe for existing fork")?;
        if response.status() == StatusCode::OK {
            info!("fork already exists: {}/{}", fork_owner, repo);
            return Ok(fork_owner);
        }

        let url = format!("{}/repos/{}/{}/forks", self.api_base, owner, repo);
        let response = self
            .authed(self.client.post(&url))?
            .send()
            .await
            .context("failed to create fork")?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(anyhow!("failed to create fork: {}", response.status()));
        }
        info!("fork created: {}/{}", fork_owner, repo);
        Ok(fork_owner)
    }

    /// Look up `fork_owner:branch` and any open PR from it against
    /// `owner/repo`. Returns `(pr_url, branch_exists)`; a transport failure
    /// on the branch probe is treated as "branch absent" so the push can
    /// fall through to the fresh-PR path.
    pub async fn get_existing_pr(
        &self,
        owner: &str,
        repo: &str,
        fork_owner: &str,
        branch: &str,
    ) -> Result<(Option<String>, bool)> {
        let branch_url = format!(
            "{}/repos/{}/{}/branches/{}",
            self.api_base, fork_owner, repo, branch
        );
        let response = self
            .authed(self.client.get(&branch_url))?
            .send()
            .await
            .context("failed to check fork branch")?;
        if response.status() != StatusCode::OK {
            return Ok((None, false));
        }

        let head = format!("{}:{}", fork_owner, branch);
        let pulls_url = format!(
            "{}/repos/{}/{}/pulls?state=open&head={}&per_page=1",
            self.api_base,
            owner,
            repo,
            urlencode(&head)
        );
        let response = self
            .authed(self.client.get(&pulls_url))?
            .send()
            .await
            .context("failed to list pulls")?;
        if !response.status().is_success() {
            return Err(anyhow!("failed to list PRs: {}", response.status()));
        }
        let pulls: Vec<HtmlUrlResponse> = response.json().await.context("failed to parse pulls")?;
        Ok((pulls.into_iter().next().map(|p| p.html_url), true))
    }

    /// Open a PR from `fork_owner:branch` against the upstream default
    /// branch, with the pushed commit message and the anonymization notice
    /// as the body.
    pub async fn create_pr(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        fork_owner: &str,
        commit_message: &str,
    ) -> Result<String> {
        let url = format!("{}/repos/{}/{}/pulls", self.api_base, owner, repo);
        let request = CreatePrRequest {
            title: "Anonymous contribution via gitGost",
            head: format!("{}:{}", fork_owner, branch),
            base: "main",
            body: format!("{}{}", commit_message, ANONYMIZATION_NOTICE),
        };
        let response = self
            .authed(self.client.post(&url))?
            .json(&request)
            .send()
            .await
            .context("failed to create PR")?;
        if response.status() != StatusCode::CREATED {
            return Err(anyhow!("failed to create PR: {}", response.status()));
        }
        let pr: HtmlUrlResponse = response.json().await.context("failed to parse PR")?;
        Ok(pr.html_url)
    }

    /// Create an anonymous issue; returns `(html_url, number)`.
    pub async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<(String, u64)> {
        let url = format!("{}/repos/{}/{}/issues", self.api_base, owner, repo);
        let request = CreateIssueRequest {
            title,
            body: format!("{}{}", body, ANONYMIZATION_NOTICE),
            labels,
        };
        let response = self
            .authed(self.client.post(&url))?
            .json(&request)
            .send()
            .await
            .context("failed to create issue")?;
        if response.status() != StatusCode::CREATED {
            return Err(anyhow!("failed to create issue: {}", response.status()));
        }
        let issue: IssueResponse = response.json().await.context("failed to parse issue")?;
        Ok((issue.html_url, issue.number))
    }

    /// Post a comment on an issue.
    pub async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_base, owner, repo, number
        );
        let response = self
            .authed(self.client.post(&url))?
            .json(&CommentBody { body })
            .send()
            .await
            .context("failed to create comment")?;
        if response.status() != StatusCode::CREATED {
            return Err(anyhow!("failed to create comment: {}", response.status()));
        }
        let comment: HtmlUrlResponse = response.json().await.context("failed to parse comment")?;
        Ok(comment.html_url)
    }

    /// Post a general comment on a pull request. The forge shares the
    /// issues comment endpoint for these.
    pub async fn create_pr_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<String> {
        self.create_issue_comment(owner, repo, number, body).await
    }

    /// True iff `.gitgost.yml` exists at the repository root on the default
    /// branch. Unauthenticated so badge requests work without a token.
    pub async fn is_repo_verified(&self, owner: &str, repo: &str) -> bool {
        let url = format!(
            "{}/repos/{}/{}/contents/.gitgost.yml",
            self.api_base, owner, repo
        );
        match self
            .client
            .get(&url)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status() == StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Rewrite the karma count in the legend of every comment carrying the
    /// given pseudonym hash, preserving the report link.
    pub async fn update_comments_karma_by_hash(&self, hash: &str, karma: i64) -> Result<()> {
        for item in self.search_comments_by_hash(hash, 10).await? {
            let Some((owner, repo)) = split_repository_url(&item.repository_url) else {
                continue;
            };
            let comments = match self.list_issue_comments(&owner, &repo, item.number).await {
                Ok(comments) => comments,
                Err(err) => {
                    warn!("cannot list comments on {}/{}#{}: {}", owner, repo, item.number, err);
                    continue;
                }
            };
            for comment in comments {
                if !comment.body.contains(hash) {
                    continue;
                }
                let Some(updated) = rewrite_legend_karma(&comment.body, hash, karma) else {
                    continue;
                };
                if updated == comment.body {
                    continue;
                }
                if let Err(err) = self.update_comment(&owner, &repo, comment.id, &updated).await {
                    warn!("failed to update comment {}: {}", comment.id, err);
                }
            }
        }
        Ok(())
    }

    /// Delete every comment carrying the given pseudonym hash. Individual
    /// failures are logged and skipped.
    pub async fn delete_comments_by_hash(&self, hash: &str) -> Result<()> {
        for item in self.search_comments_by_hash(hash, 20).await? {
            let Some((owner, repo)) = split_repository_url(&item.repository_url) else {
                continue;
            };
            let comments = match self.list_issue_comments(&owner, &repo, item.number).await {
                Ok(comments) => comments,
                Err(err) => {
                    warn!("cannot list comments on {}/{}#{}: {}", owner, repo, item.number, err);
                    continue;
                }
            };
            for comment in comments {
                if !comment.body.contains(hash) {
                    continue;
                }
                if let Err(err) = self.delete_comment(&owner, &repo, comment.id).await {
                    warn!("failed to delete comment {}: {}", comment.id, err);
                }
            }
        }
        Ok(())
    }

    /// Code-search for issues/PRs whose comments mention `goster-<hash>`.
    /// The search endpoint is slow at the forge, so timeouts are retried
    /// with exponential backoff starting at one second.
    async fn search_comments_by_hash(&self, hash: &str, per_page: u32) -> Result<Vec<SearchItem>> {
        let query = urlencode(&format!("goster-{} in:comments", hash));
        let url = format!(
            "{}/search/issues?q={}&per_page={}",
            self.api_base, query, per_page
        );

        let mut delay = Duration::from_secs(1);
        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let result = self
                .authed(self.client.get(&url))?
                .timeout(SEARCH_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(response) => break response,
                Err(err) if err.is_timeout() && attempt < SEARCH_ATTEMPTS => {
                    warn!("comment search timed out (attempt {}), retrying", attempt);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err).context("comment search failed"),
            }
        };

        if !response.status().is_success() {
            return Err(anyhow!("search failed: {}", response.status()));
        }
        let result: SearchResponse = response.json().await.context("failed to parse search")?;
        Ok(result.items)
    }

    async fn list_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<CommentItem>> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_base, owner, repo, number
        );
        let response = self
            .authed(self.client.get(&url))?
            .send()
            .await
            .context("failed to list comments")?;
        if !response.status().is_success() {
            return Err(anyhow!("failed to list comments: {}", response.status()));
        }
        response.json().await.context("failed to parse comments")
    }

    async fn update_comment(&self, owner: &str, repo: &str, id: u64, body: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/issues/comments/{}",
            self.api_base, owner, repo, id
        );
        let response = self
            .authed(self.client.patch(&url))?
            .json(&CommentBody { body })
            .send()
            .await
            .context("failed to patch comment")?;
        if !response.status().is_success() {
            return Err(anyhow!("failed to patch comment: {}", response.status()));
        }
        Ok(())
    }

    async fn delete_comment(&self, owner: &str, repo: &str, id: u64) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/issues/comments/{}",
            self.api_base, owner, repo, id
        );
        let response = self
            .authed(self.client.delete(&url))?
            .send()
            .await
            .context("failed to delete comment")?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(anyhow!("failed to delete comment: {}", response.status()));
        }
        Ok(())
    }
}

/// `https://api.github.com/repos/{owner}/{repo}` -> `(owner, repo)`.
fn split_repository_url(url: &str) -> Option<(String, String)> {
    let mut parts = url.rsplit('/');
    let repo = parts.next()?.to_string();
    let owner = parts.next()?.to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

/// Replace the karma count inside every `goster-<hash> · karma (N) ·
/// [report](link)` legend, keeping the link intact. Returns `None` when no
/// legend is present.
fn rewrite_legend_karma(body: &str, hash: &str, karma: i64) -> Option<String> {
    let marker = format!("goster-{} · karma (", hash);
    if !body.contains(&marker) {
        return None;
    }
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find(&marker) {
        let after_marker = start + marker.len();
        out.push_str(&rest[..after_marker]);
        let tail = &rest[after_marker..];
        let Some(close) = tail.find(')') else {
            out.push_str(tail);
            return Some(out);
        };
        if tail[..close].bytes().all(|b| b.is_ascii_digit()) {
            out.push_str(&karma.to_string());
        } else {
            out.push_str(&tail[..close]);
        }
        rest = &tail[close..];
    }
    out.push_str(rest);
    Some(out)
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_is_reported_by_name() {
        let client = GitHubClient::new("https://api.invalid".to_string(), None).unwrap();
        let err = client.token().unwrap_err();
        assert!(err.to_string().contains("GITHUB_TOKEN not set"));
    }

    #[test]
    fn blank_token_counts_as_missing() {
        let client =
            GitHubClient::new("https://api.invalid".to_string(), Some("  ".to_string())).unwrap();
        assert!(client.token().is_err());
    }

    #[test]
    fn repository_url_splits_into_owner_and_repo() {
        assert_eq!(
            split_repository_url("https://api.github.com/repos/acme/lib"),
            Some(("acme".to_string(), "lib".to_string()))
        );
        assert_eq!(split_repository_url(""), None);
    }

    #[test]
    fn legend_karma_is_rewritten_in_place() {
        let body = "great point!\n\n---\ngoster-abcd1234 · karma (7) · [report](https://x/report?hash=abcd1234)";
        let updated = rewrite_legend_karma(body, "abcd1234", 0).unwrap();
        assert!(updated.contains("karma (0)"));
        assert!(updated.contains("[report](https://x/report?hash=abcd1234)"));
        assert!(updated.starts_with("great point!"));
    }

    #[test]
    fn legend_rewrite_ignores_other_hashes() {
        let body = "goster-ffff0000 · karma (3) · [report](https://x)";
        assert_eq!(rewrite_legend_karma(body, "abcd1234", 0), None);
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("bot:gitgost-1234"), "bot%3Agitgost-1234");
        assert_eq!(
            urlencode("goster-ab in:comments"),
            "goster-ab%20in%3Acomments"
        );
    }
}
