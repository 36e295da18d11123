//! Local git plumbing for one push: a throwaway object database, packfile
//! absorption, history rewriting and the authenticated push to the fork.

mod anonymize;
mod push;
mod scratch;
mod unpack;

pub use anonymize::{anonymize, ANON_EMAIL, ANON_NAME};
pub use push::{fresh_branch_name, push_to_fork};
pub use scratch::{CommitData, Ident, ScratchRepo};

use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Basename prefix of every scratch directory, also used by the sweeper to
/// recognize leftovers from crashed pushes.
pub const SCRATCH_PREFIX: &str = "gitgost-";

/// Scratch directories older than this are assumed to be crash leftovers.
const STALE_SCRATCH_AGE: Duration = Duration::from_secs(60 * 60);

/// Create the private working area for one push. The directory is removed
/// when the returned handle is dropped, on success and error paths alike.
pub fn create_scratch_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir()
        .context("failed to create scratch directory")
}

/// Remove scratch directories left behind by crashed pushes.
///
/// Normal cleanup is the `TempDir` drop guard; this only catches directories
/// orphaned by a hard kill, so anything younger than an hour is left alone.
pub fn sweep_stale_scratch_dirs() {
    let tmp = std::env::temp_dir();
    let entries = match std::fs::read_dir(&tmp) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot read temp dir {}: {}", tmp.display(), err);
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(SCRATCH_PREFIX) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_dir() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok());
        if age.is_some_and(|age| age > STALE_SCRATCH_AGE) {
            debug!("sweeping stale scratch dir {}", name);
            let _ = std::fs::remove_dir_all(entry.path());
        }
    }
}
