//! The Git Smart-HTTP surface: receive-pack discovery and execution, plus
//! the transparent upload-pack reverse proxy.
//!
//! Once the success headers are written the HTTP status is committed to
//! 200; everything after that, failures included, travels inside the
//! side-band stream. After the pack has been absorbed into the scratch
//! repository the client is always told `unpack ok` first, and any
//! downstream fork/push/PR failure follows on band 3, so `git push`'s
//! summary stays accurate.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{info, warn};

use gitgost_core::{
    branch_for_hash, extract_pack, generate_pr_hash, write_pkt, write_sideband, Band,
};

use crate::git::{self, ScratchRepo};
use crate::{ntfy, AppState};

const RECEIVE_PACK_ADVERTISEMENT: &str = "application/x-git-receive-pack-advertisement";
const RECEIVE_PACK_RESULT: &str = "application/x-git-receive-pack-result";
const UPLOAD_PACK_ADVERTISEMENT: &str = "application/x-git-upload-pack-advertisement";
const UPLOAD_PACK_RESULT: &str = "application/x-git-upload-pack-result";

/// Capabilities advertised on receive-pack discovery. `push-options` is
/// required: the update-PR flow rides on the `pr-hash=` option.
const CAPABILITIES: &str = "report-status delete-refs side-band-64k quiet ofs-delta push-options";

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// Maximum body accepted by the upload-pack proxy.
const MAX_UPLOAD_PACK_SIZE: usize = 50 * 1024 * 1024;

/// Grace period before closing the stream, letting the client drain the
/// response before the connection goes away.
const CLIENT_DRAIN_DELAY: Duration = Duration::from_millis(100);

/// `GET /v1/gh/:owner/:repo/info/refs?service=...`
///
/// `git-receive-pack` discovery is answered locally from the upstream refs;
/// `git-upload-pack` discovery is proxied verbatim; anything else is a 400.
pub async fn info_refs(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match params.get("service").map(String::as_str) {
        Some("git-receive-pack") => receive_pack_discovery(state, owner, repo).await,
        Some("git-upload-pack") => upload_pack_discovery(state, owner, repo).await,
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unsupported service" })),
        )
            .into_response(),
    }
}

async fn receive_pack_discovery(state: Arc<AppState>, owner: String, repo: String) -> Response {
    let refs = match state.github.get_refs(&owner, &repo).await {
        Ok(refs) => refs,
        Err(err) => {
            warn!("ref advertisement failed for {}/{}: {}", owner, repo, err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to get refs" })),
            )
                .into_response();
        }
    };

    let mut advertisement = Vec::new();
    write_pkt(&mut advertisement, b"# service=git-receive-pack\n");
    write_pkt(&mut advertisement, b"");

    let mut first = true;
    for r in &refs {
        if !r.ref_name.starts_with("refs/heads/") && !r.ref_name.starts_with("refs/tags/") {
            continue;
        }
        let mut line = format!("{} {}", r.sha(), r.ref_name);
        if first {
            line.push('\0');
            line.push_str(CAPABILITIES);
            first = false;
        }
        line.push('\n');
        write_pkt(&mut advertisement, line.as_bytes());
    }
    if first {
        // Empty repository: advertise capabilities on the zero id.
        let line = format!("{} capabilities^{{}}\0{}\n", ZERO_SHA, CAPABILITIES);
        write_pkt(&mut advertisement, line.as_bytes());
    }
    write_pkt(&mut advertisement, b"");

    (
        [(header::CONTENT_TYPE, RECEIVE_PACK_ADVERTISEMENT)],
        advertisement,
    )
        .into_response()
}

/// `POST /v1/gh/:owner/:repo/git-receive-pack`
///
/// Returns 200 immediately with a streaming side-band body; the push is
/// processed on a background task that feeds the stream. Dropping the
/// response (client disconnect) tears the task down at its next send.
pub async fn receive_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    info!("receive-pack for {}/{}: {} bytes", owner, repo, body.len());

    let scratch = match git::create_scratch_dir() {
        Ok(scratch) => scratch,
        Err(err) => return early_error_response(&format!("error creating temp dir: {}", err)),
    };

    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let sideband = Sideband { tx };
        // The scratch dir is removed when this task ends, on every path.
        let _ = run_push(state, owner, repo, body, &scratch, &sideband).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, RECEIVE_PACK_RESULT)
        .body(Body::from_stream(stream))
        .expect("static response parts are valid")
}

/// Failures before the success headers still answer 200 with a band-3
/// frame, which is what git clients expect.
fn early_error_response(message: &str) -> Response {
    let mut body = Vec::new();
    write_sideband(&mut body, Band::Error, message);
    write_pkt(&mut body, b"");
    (
        [(header::CONTENT_TYPE, RECEIVE_PACK_RESULT)],
        body,
    )
        .into_response()
}

/// Side-band frames flowing into the response stream. Send failure means
/// the client went away; it aborts the push via `?`.
struct Sideband {
    tx: mpsc::Sender<Bytes>,
}

impl Sideband {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.tx
            .send(frame.into())
            .await
            .map_err(|_| anyhow!("client disconnected"))
    }

    async fn progress(&self, msg: &str) -> Result<()> {
        let mut frame = Vec::new();
        write_sideband(&mut frame, Band::Progress, msg);
        self.send(frame).await
    }

    async fn data(&self, msg: &str) -> Result<()> {
        let mut frame = Vec::new();
        write_sideband(&mut frame, Band::Data, msg);
        self.send(frame).await
    }

    async fn error(&self, msg: &str) -> Result<()> {
        let mut frame = Vec::new();
        write_sideband(&mut frame, Band::Error, msg);
        self.send(frame).await
    }

    async fn flush(&self) -> Result<()> {
        let mut frame = Vec::new();
        write_pkt(&mut frame, b"");
        self.send(frame).await
    }

    /// Abort after the pack was absorbed: protocol result first, then the
    /// failure on band 3.
    async fn fail_after_unpack(&self, msg: &str) -> Result<()> {
        self.data("unpack ok\n").await?;
        self.error(msg).await?;
        self.flush().await
    }

    /// Abort before the pack was absorbed.
    async fn fail_unpack(&self, msg: &str) -> Result<()> {
        self.error(msg).await?;
        self.flush().await
    }
}

/// Which branch the anonymized head goes to, and whether a PR already
/// exists there.
enum PushPlan {
    Update {
        branch: String,
        existing_pr: Option<String>,
    },
    Fresh {
        branch: String,
    },
}

async fn run_push(
    state: Arc<AppState>,
    owner: String,
    repo: String,
    body: Bytes,
    scratch: &TempDir,
    sideband: &Sideband,
) -> Result<()> {
    sideband
        .progress("remote: gitGost: Processing your anonymous contribution...")
        .await?;

    // Receive: clone, absorb the pack, anonymize. All blocking git work.
    // The pack is always a suffix of the body, so only its offset crosses
    // into the blocking task.
    let (pr_hash_request, ref_name, new_sha, pack_offset) = match extract_pack(&body) {
        Ok(request) => (
            request.pr_hash().map(str::to_owned),
            request.ref_update.ref_name.clone(),
            request.ref_update.new_sha.clone(),
            body.len() - request.pack.len(),
        ),
        Err(err) => {
            warn!("pack extraction failed for {}/{}: {}", owner, repo, err);
            return sideband.fail_unpack(&format!("unpack error: {}", err)).await;
        }
    };
    let Ok(target) = git2::Oid::from_str(&new_sha) else {
        return sideband
            .fail_unpack("unpack error: pushed SHA is not a valid object id")
            .await;
    };

    let upstream_url = format!("{}/{}/{}.git", state.config.github_url, owner, repo);
    let token = state.config.github_token.clone();
    let scratch_path = scratch.path().to_path_buf();
    let body_for_git = body.clone();
    let git_phase = tokio::task::spawn_blocking(move || -> Result<(ScratchRepo, String, String)> {
        let repo = ScratchRepo::clone_or_init(&scratch_path, &upstream_url, token.as_deref())?;
        repo.absorb_pack(&body_for_git[pack_offset..])?;
        repo.set_head(target)?;
        let message = String::from_utf8_lossy(&repo.read_commit(target)?.message).into_owned();
        let anon_sha = git::anonymize(&repo, target)?;
        Ok((repo, anon_sha.to_string(), message))
    })
    .await
    .context("git task panicked")?;

    let (scratch_repo, anon_sha, commit_message) = match git_phase {
        Ok(result) => result,
        Err(err) => {
            warn!("receive failed for {}/{}: {:#}", owner, repo, err);
            return sideband.fail_unpack(&format!("unpack error: {}", err)).await;
        }
    };
    info!("anonymized head for {}/{}: {}", owner, repo, anon_sha);
    sideband
        .progress("remote: gitGost: Commits anonymized successfully")
        .await?;

    // Ensure fork. This is also where a missing GITHUB_TOKEN surfaces.
    sideband.progress("remote: gitGost: Creating fork...").await?;
    let fork_owner = match state.github.fork(&owner, &repo).await {
        Ok(fork_owner) => fork_owner,
        Err(err) => {
            warn!("fork failed for {}/{}: {:#}", owner, repo, err);
            return sideband
                .fail_after_unpack(&format!("error creating fork: {}", err))
                .await;
        }
    };
    sideband
        .progress(&format!(
            "remote: gitGost: Fork ready at {}/{}",
            fork_owner, repo
        ))
        .await?;

    // Branch selection: update an existing PR branch when the client sent
    // its pr-hash, otherwise push a fresh ephemeral branch.
    let plan = match &pr_hash_request {
        Some(pr_hash) => {
            let branch = branch_for_hash(pr_hash);
            sideband
                .progress(&format!(
                    "remote: gitGost: Updating existing PR (hash: {})...",
                    pr_hash
                ))
                .await?;
            match state
                .github
                .get_existing_pr(&owner, &repo, &fork_owner, &branch)
                .await
            {
                Ok((existing_pr, true)) => PushPlan::Update {
                    branch,
                    existing_pr,
                },
                Ok((_, false)) => {
                    sideband
                        .progress("remote: gitGost: Hash not found, creating new PR...")
                        .await?;
                    PushPlan::Fresh {
                        branch: git::fresh_branch_name(),
                    }
                }
                Err(err) => {
                    warn!("existing-PR lookup failed for {}: {:#}", branch, err);
                    sideband
                        .progress("remote: gitGost: Hash not found, creating new PR...")
                        .await?;
                    PushPlan::Fresh {
                        branch: git::fresh_branch_name(),
                    }
                }
            }
        }
        None => PushPlan::Fresh {
            branch: git::fresh_branch_name(),
        },
    };

    let (branch, force) = match &plan {
        PushPlan::Update { branch, .. } => (branch.clone(), true),
        PushPlan::Fresh { branch } => (branch.clone(), false),
    };
    sideband
        .progress(if force {
            "remote: gitGost: Pushing update to existing branch..."
        } else {
            "remote: gitGost: Pushing to fork..."
        })
        .await?;

    let Some(token) = state.config.github_token.clone() else {
        return sideband
            .fail_after_unpack("error pushing to fork: GITHUB_TOKEN not set")
            .await;
    };
    let fork_url = format!("{}/{}/{}.git", state.config.github_url, fork_owner, repo);
    let push_branch = branch.clone();
    let push_result = tokio::task::spawn_blocking(move || {
        git::push_to_fork(&scratch_repo, &fork_url, &push_branch, &token, force)
    })
    .await
    .context("push task panicked")?;
    if let Err(err) = push_result {
        warn!("push to fork failed for {}/{}: {:#}", fork_owner, repo, err);
        let msg = if force {
            format!("error pushing update: {}", err)
        } else {
            format!("error pushing to fork: {}", err)
        };
        return sideband.fail_after_unpack(&msg).await;
    }
    if !force {
        sideband
            .progress(&format!("remote: gitGost: Branch '{}' created", branch))
            .await?;
    }

    // Open or reuse the PR.
    let (pr_url, is_update) = match plan {
        PushPlan::Update {
            existing_pr: Some(url),
            ..
        } => (url, true),
        PushPlan::Update {
            existing_pr: None, ..
        } => {
            sideband
                .progress("remote: gitGost: PR was closed, creating new PR on existing branch...")
                .await?;
            match state
                .github
                .create_pr(&owner, &repo, &branch, &fork_owner, &commit_message)
                .await
            {
                Ok(url) => {
                    record_pr(&state, &owner, &repo, &url).await;
                    (url, true)
                }
                Err(err) => {
                    return sideband
                        .fail_after_unpack(&format!("error creating PR: {}", err))
                        .await;
                }
            }
        }
        PushPlan::Fresh { .. } => {
            sideband
                .progress("remote: gitGost: Creating pull request...")
                .await?;
            match state
                .github
                .create_pr(&owner, &repo, &branch, &fork_owner, &commit_message)
                .await
            {
                Ok(url) => {
                    record_pr(&state, &owner, &repo, &url).await;
                    (url, false)
                }
                Err(err) => {
                    return sideband
                        .fail_after_unpack(&format!("error creating PR: {}", err))
                        .await;
                }
            }
        }
    };
    info!("{} PR for {}/{}: {}", if is_update { "updated" } else { "created" }, owner, repo, pr_url);

    // The pr-hash the client should use next time, derived from the branch
    // that actually got pushed.
    let pr_hash = generate_pr_hash(&owner, &repo, &branch);

    // Non-blocking notification; the git response never waits for it.
    {
        let ntfy = state.ntfy.clone();
        let pr_url = pr_url.clone();
        let pr_hash = pr_hash.clone();
        tokio::spawn(async move {
            let (title, verb) = if is_update {
                ("PR Updated · gitGost", "updated")
            } else {
                ("PR Created · gitGost", "created")
            };
            let message = format!(
                "Your anonymous PR was {}.\nPR: {}\nTopic: {}/{}",
                verb,
                pr_url,
                ntfy.base_url(),
                ntfy::topic_for_pr(&pr_hash)
            );
            if let Err(err) = ntfy.publish(&pr_hash, title, &message).await {
                warn!("ntfy publish failed for hash {}: {}", pr_hash, err);
            }
        });
    }

    // Success banner (band 2), then the protocol result (band 1).
    sideband.progress("remote: ").await?;
    sideband
        .progress("remote: ========================================")
        .await?;
    sideband
        .progress(if is_update {
            "remote: SUCCESS! Pull Request Updated"
        } else {
            "remote: SUCCESS! Pull Request Created"
        })
        .await?;
    sideband
        .progress("remote: ========================================")
        .await?;
    sideband.progress("remote: ").await?;
    sideband
        .progress(&format!("remote: PR URL: {}", pr_url))
        .await?;
    sideband
        .progress(&format!("remote: Author: {}", git::ANON_NAME))
        .await?;
    sideband
        .progress(&format!("remote: Branch: {}", branch))
        .await?;
    sideband
        .progress(&format!("remote: PR Hash: {}", pr_hash))
        .await?;
    sideband.progress("remote: ").await?;
    sideband
        .progress("remote: Subscribe to PR notifications (no account needed):")
        .await?;
    sideband
        .progress(&format!(
            "remote:   {}/{}",
            state.ntfy.base_url(),
            ntfy::topic_for_pr(&pr_hash)
        ))
        .await?;
    sideband.progress("remote: ").await?;
    sideband
        .progress("remote: To update this PR on future pushes, use:")
        .await?;
    sideband
        .progress(&format!(
            "remote:   git push gost <branch>:main -o pr-hash={}",
            pr_hash
        ))
        .await?;
    sideband.progress("remote: ").await?;
    sideband
        .progress("remote: Your identity has been anonymized.")
        .await?;
    sideband.progress("remote: ").await?;

    sideband.data("unpack ok\n").await?;
    sideband.data(&format!("ok {}\n", ref_name)).await?;
    sideband.flush().await?;

    // Let the client drain before the stream (and connection) closes.
    tokio::time::sleep(CLIENT_DRAIN_DELAY).await;
    Ok(())
}

async fn record_pr(state: &AppState, owner: &str, repo: &str, pr_url: &str) {
    let Some(store) = &state.store else { return };
    match store.insert_pr(owner, repo, pr_url).await {
        Ok(()) => {}
        // The unique constraint firing means the PR is already on record.
        Err(crate::store::StoreError::DuplicateUrl(_)) => {}
        Err(err) => warn!("failed to record PR {}: {}", pr_url, err),
    }
}

async fn upload_pack_discovery(state: Arc<AppState>, owner: String, repo: String) -> Response {
    let url = format!(
        "{}/{}/{}.git/info/refs?service=git-upload-pack",
        state.config.github_url, owner, repo
    );
    match state.proxy_client.get(&url).send().await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, UPLOAD_PACK_ADVERTISEMENT)
                .body(Body::from_stream(upstream.bytes_stream()))
                .expect("static response parts are valid")
        }
        Err(err) => {
            warn!("upload-pack discovery proxy failed: {}", err);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "failed to reach GitHub" })),
            )
                .into_response()
        }
    }
}

/// `POST /v1/gh/:owner/:repo/git-upload-pack`: blind reverse proxy so
/// clones and fetches work through the same remote.
pub async fn upload_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if body.len() > MAX_UPLOAD_PACK_SIZE {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "request body too large" })),
        )
            .into_response();
    }

    let url = format!(
        "{}/{}/{}.git/git-upload-pack",
        state.config.github_url, owner, repo
    );
    match state
        .proxy_client
        .post(&url)
        .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
        .header(header::ACCEPT, UPLOAD_PACK_RESULT)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, UPLOAD_PACK_RESULT)
                .body(Body::from_stream(upstream.bytes_stream()))
                .expect("static response parts are valid")
        }
        Err(err) => {
            warn!("upload-pack proxy failed: {}", err);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "failed to reach GitHub" })),
            )
                .into_response()
        }
    }
}
