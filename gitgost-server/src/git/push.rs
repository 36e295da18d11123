//! Authenticated push of the anonymized head to the fork.

use std::cell::RefCell;

use anyhow::{anyhow, Context, Result};
use git2::{Cred, PushOptions, RemoteCallbacks};
use rand::Rng;
use tracing::info;

use super::scratch::ScratchRepo;

/// Ephemeral branch name for pushes that did not supply a `pr-hash` push
/// option. The final pr-hash is derived from whatever name ends up chosen.
pub fn fresh_branch_name() -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let nonce = rand::thread_rng().gen_range(0..1000);
    format!("gitgost-{}-{}", timestamp, nonce)
}

/// Push `HEAD` to `refs/heads/<branch>` on the fork, forcing when updating
/// an existing PR branch. Authentication uses the forge token with the
/// `x-access-token` username convention.
pub fn push_to_fork(
    repo: &ScratchRepo,
    fork_url: &str,
    branch: &str,
    token: &str,
    force: bool,
) -> Result<()> {
    let mut remote = repo
        .raw()
        .remote_anonymous(fork_url)
        .context("failed to create push remote")?;

    let push_error: RefCell<Option<String>> = RefCell::new(None);
    let token = token.to_owned();
    let refspec = if force {
        format!("+HEAD:refs/heads/{}", branch)
    } else {
        format!("HEAD:refs/heads/{}", branch)
    };

    {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", &token)
        });
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                *push_error.borrow_mut() = Some(format!("{}: {}", refname, msg));
            }
            Ok(())
        });

        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .with_context(|| format!("push of {} failed", refspec))?;
    }

    if let Some(rejection) = push_error.into_inner() {
        return Err(anyhow!("fork rejected push: {}", rejection));
    }

    info!("pushed {} to fork branch {}", if force { "update" } else { "new head" }, branch);
    Ok(())
}
