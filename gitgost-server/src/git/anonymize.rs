//! History rewriting that strips contributor identity.
//!
//! Only the delta above the upstream default branch is rewritten: commits
//! already present upstream keep their original hashes so the PR still
//! shares ancestry with the base repository, and the diff stays identical
//! to what the client pushed.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::Utc;
use git2::Oid;
use tracing::debug;

use super::scratch::{CommitData, Ident, ScratchRepo};

pub const ANON_NAME: &str = "gitGost Anonymous";
pub const ANON_EMAIL: &str = "anonymous@gitgost.local";

/// Rewrite the history reachable from `target`, replacing author and
/// committer on every commit not already present upstream, and point HEAD
/// at the rewritten tip. Returns the new tip hash.
pub fn anonymize(repo: &ScratchRepo, target: Oid) -> Result<Oid> {
    let base = base_commit_set(repo);
    debug!("base commit set has {} entries", base.len());

    // One timestamp for the whole push keeps parallel branches consistent.
    let anon = Ident {
        name: ANON_NAME.to_string(),
        email: ANON_EMAIL.to_string(),
        when_secs: Utc::now().timestamp(),
    };

    let mut rewritten: HashMap<Oid, Oid> = HashMap::new();
    let new_tip = rewrite(repo, target, &base, &anon, &mut rewritten)?;
    repo.set_head(new_tip)?;
    Ok(new_tip)
}

/// Commits reachable from the upstream default branch at push time. Empty
/// when the remote-tracking ref is unreadable, in which case the whole
/// pushed history is rewritten.
fn base_commit_set(repo: &ScratchRepo) -> HashSet<Oid> {
    let Some(base_tip) = repo.upstream_base() else {
        return HashSet::new();
    };
    let Ok(walk) = repo.log_from(base_tip) else {
        return HashSet::new();
    };
    walk.filter_map(|oid| oid.ok()).collect()
}

fn rewrite(
    repo: &ScratchRepo,
    oid: Oid,
    base: &HashSet<Oid>,
    anon: &Ident,
    rewritten: &mut HashMap<Oid, Oid>,
) -> Result<Oid> {
    if let Some(&mapped) = rewritten.get(&oid) {
        return Ok(mapped);
    }
    if base.contains(&oid) {
        return Ok(oid);
    }

    let commit = repo.read_commit(oid)?;

    let mut parents = Vec::with_capacity(commit.parents.len());
    for &parent in &commit.parents {
        if repo.has_object(parent) {
            parents.push(rewrite(repo, parent, base, anon, rewritten)?);
        } else {
            // Best-effort stub: the parent never arrived in the pack.
            parents.push(parent);
        }
    }

    let new_oid = repo.write_commit(&CommitData {
        tree: commit.tree,
        parents,
        author: anon.clone(),
        committer: anon.clone(),
        message: commit.message,
    })?;
    rewritten.insert(oid, new_oid);
    debug!("rewrote {} -> {}", oid, new_oid);
    Ok(new_oid)
}
