//! Thin wrapper over a per-push git object database.
//!
//! The scratch repository starts as a clone of the upstream repository so
//! that thin packs arriving over receive-pack can resolve their base
//! objects locally; when the clone fails (private or missing upstream) it
//! degrades to an empty repository and the push only works for
//! self-contained packs.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use git2::{Cred, ObjectType, Oid, RemoteCallbacks, Repository};
use tracing::{debug, info};

use super::unpack;

/// A commit as read from (or written to) the object database.
#[derive(Debug, Clone)]
pub struct CommitData {
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author: Ident,
    pub committer: Ident,
    pub message: Vec<u8>,
}

/// Author/committer identity with a UTC timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub email: String,
    pub when_secs: i64,
}

impl Ident {
    fn from_signature(sig: &git2::Signature<'_>) -> Self {
        Ident {
            name: String::from_utf8_lossy(sig.name_bytes()).into_owned(),
            email: String::from_utf8_lossy(sig.email_bytes()).into_owned(),
            when_secs: sig.when().seconds(),
        }
    }
}

pub struct ScratchRepo {
    repo: Repository,
}

impl ScratchRepo {
    /// Clone the upstream repository into `dir`, authenticating with the
    /// forge token when one is supplied. A failed clone falls back to an
    /// empty repository.
    pub fn clone_or_init(dir: &Path, upstream_url: &str, token: Option<&str>) -> Result<Self> {
        let mut callbacks = RemoteCallbacks::new();
        let token = token.map(str::to_owned);
        callbacks.credentials(move |_url, _username, _allowed| match &token {
            Some(token) => Cred::userpass_plaintext("x-access-token", token),
            None => Cred::default(),
        });
        let mut fetch = git2::FetchOptions::new();
        fetch.remote_callbacks(callbacks);

        let repo = match git2::build::RepoBuilder::new()
            .fetch_options(fetch)
            .clone(upstream_url, dir)
        {
            Ok(repo) => {
                info!("cloned upstream into scratch repo");
                repo
            }
            Err(err) => {
                debug!("clone failed ({}), initializing empty repo", err);
                Repository::init(dir).context("failed to init scratch repo")?
            }
        };
        Ok(Self { repo })
    }

    /// Open an existing repository, used by tests.
    #[cfg(test)]
    pub fn init(dir: &Path) -> Result<Self> {
        Ok(Self {
            repo: Repository::init(dir).context("failed to init scratch repo")?,
        })
    }

    pub fn raw(&self) -> &Repository {
        &self.repo
    }

    /// Write all objects from a packfile into the object database.
    ///
    /// The primary path feeds the pack to libgit2's indexer through the odb
    /// pack writer, which resolves thin-pack bases against objects already
    /// present. If indexing fails, a sequential unpack-objects pass is
    /// attempted; that path cannot index but leaves loose objects behind.
    pub fn absorb_pack(&self, pack: &[u8]) -> Result<()> {
        let indexed = (|| -> Result<(), git2::Error> {
            let odb = self.repo.odb()?;
            let mut writer = odb.packwriter()?;
            writer
                .write_all(pack)
                .map_err(|e| git2::Error::from_str(&e.to_string()))?;
            writer.commit()?;
            Ok(())
        })();

        match indexed {
            Ok(()) => Ok(()),
            Err(index_err) => {
                debug!("index-pack failed ({}), trying unpack-objects", index_err);
                let unpacked = unpack::unpack_objects(&self.repo, pack).with_context(|| {
                    format!("failed to unpack objects (index-pack: {})", index_err)
                })?;
                debug!("unpacked {} loose objects", unpacked);
                Ok(())
            }
        }
    }

    pub fn has_object(&self, oid: Oid) -> bool {
        self.repo.odb().map(|odb| odb.exists(oid)).unwrap_or(false)
    }

    pub fn read_commit(&self, oid: Oid) -> Result<CommitData> {
        let commit = self
            .repo
            .find_commit(oid)
            .with_context(|| format!("commit {} not found", oid))?;
        let data = CommitData {
            tree: commit.tree_id(),
            parents: commit.parent_ids().collect(),
            author: Ident::from_signature(&commit.author()),
            committer: Ident::from_signature(&commit.committer()),
            message: commit.message_raw_bytes().to_vec(),
        };
        Ok(data)
    }

    /// Store a commit object and return its hash.
    ///
    /// The object is encoded by hand and written through the odb rather than
    /// built from live parent objects, so a parent hash may reference a
    /// commit that is not present locally (a best-effort stub kept during
    /// anonymization).
    pub fn write_commit(&self, commit: &CommitData) -> Result<Oid> {
        let mut buf = Vec::with_capacity(commit.message.len() + 256);
        buf.extend_from_slice(format!("tree {}\n", commit.tree).as_bytes());
        for parent in &commit.parents {
            buf.extend_from_slice(format!("parent {}\n", parent).as_bytes());
        }
        write_ident_line(&mut buf, "author", &commit.author);
        write_ident_line(&mut buf, "committer", &commit.committer);
        buf.push(b'\n');
        buf.extend_from_slice(&commit.message);

        let odb = self.repo.odb().context("object database unavailable")?;
        odb.write(ObjectType::Commit, &buf)
            .context("failed to store commit object")
    }

    /// Point `HEAD` at the given commit.
    pub fn set_head(&self, oid: Oid) -> Result<()> {
        self.repo
            .set_head_detached(oid)
            .with_context(|| format!("failed to update HEAD to {}", oid))
    }

    /// Reverse-chronological walk over commits reachable from `from`.
    pub fn log_from(&self, from: Oid) -> Result<git2::Revwalk<'_>> {
        let mut walk = self.repo.revwalk().context("revwalk unavailable")?;
        walk.push(from)
            .with_context(|| format!("cannot walk from {}", from))?;
        Ok(walk)
    }

    /// The tip of the upstream default branch after the clone, if any.
    ///
    /// `origin/HEAD` is preferred so repositories whose default branch is
    /// not `main` still anchor the base set correctly.
    pub fn upstream_base(&self) -> Option<Oid> {
        for name in ["refs/remotes/origin/HEAD", "refs/remotes/origin/main"] {
            if let Ok(reference) = self.repo.find_reference(name) {
                if let Ok(resolved) = reference.resolve() {
                    if let Some(target) = resolved.target() {
                        return Some(target);
                    }
                }
            }
        }
        None
    }
}

fn write_ident_line(buf: &mut Vec<u8>, kind: &str, ident: &Ident) {
    buf.extend_from_slice(
        format!(
            "{} {} <{}> {} +0000\n",
            kind, ident.name, ident.email, ident.when_secs
        )
        .as_bytes(),
    );
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Write an empty tree and a chain of commits on top of it, returning
    /// the commit ids oldest-first.
    pub fn commit_chain(repo: &ScratchRepo, n: usize) -> Vec<Oid> {
        let tree = empty_tree(repo);
        let mut oids = Vec::new();
        let mut parent: Option<Oid> = None;
        for i in 0..n {
            let data = CommitData {
                tree,
                parents: parent.into_iter().collect(),
                author: test_ident("Alice Author", 1_700_000_000 + i as i64),
                committer: test_ident("Carol Committer", 1_700_000_000 + i as i64),
                message: format!("commit {}\n", i).into_bytes(),
            };
            let oid = repo.write_commit(&data).unwrap();
            oids.push(oid);
            parent = Some(oid);
        }
        oids
    }

    pub fn empty_tree(repo: &ScratchRepo) -> Oid {
        repo.raw().treebuilder(None).unwrap().write().unwrap()
    }

    pub fn test_ident(name: &str, when_secs: i64) -> Ident {
        Ident {
            name: name.to_string(),
            email: format!("{}@example.com", name.split(' ').next().unwrap()),
            when_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn written_commits_read_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScratchRepo::init(dir.path()).unwrap();
        let tree = empty_tree(&repo);

        let data = CommitData {
            tree,
            parents: vec![],
            author: test_ident("Alice Author", 1_700_000_000),
            committer: test_ident("Carol Committer", 1_700_000_001),
            message: b"subject line\n\nbody text\n".to_vec(),
        };
        let oid = repo.write_commit(&data).unwrap();

        let read = repo.read_commit(oid).unwrap();
        assert_eq!(read.tree, tree);
        assert!(read.parents.is_empty());
        assert_eq!(read.author.name, "Alice Author");
        assert_eq!(read.author.when_secs, 1_700_000_000);
        assert_eq!(read.committer.name, "Carol Committer");
        assert_eq!(read.message, data.message);
    }

    #[test]
    fn stub_parent_hash_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScratchRepo::init(dir.path()).unwrap();
        let tree = empty_tree(&repo);

        let missing = Oid::from_str("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let data = CommitData {
            tree,
            parents: vec![missing],
            author: test_ident("Alice Author", 1_700_000_000),
            committer: test_ident("Alice Author", 1_700_000_000),
            message: b"orphan\n".to_vec(),
        };
        let oid = repo.write_commit(&data).unwrap();
        assert!(repo.has_object(oid));
        // The raw object keeps the stub parent even though it is unreadable.
        let odb = repo.raw().odb().unwrap();
        let raw = odb.read(oid).unwrap();
        let text = String::from_utf8_lossy(raw.data()).into_owned();
        assert!(text.contains(&format!("parent {}", missing)));
    }

    #[test]
    fn set_head_detaches_to_commit() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScratchRepo::init(dir.path()).unwrap();
        let oids = commit_chain(&repo, 2);
        repo.set_head(oids[1]).unwrap();
        assert_eq!(repo.raw().head().unwrap().target(), Some(oids[1]));
    }

    #[test]
    fn log_from_walks_reachable_commits() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScratchRepo::init(dir.path()).unwrap();
        let oids = commit_chain(&repo, 3);
        let walked: Vec<Oid> = repo
            .log_from(oids[2])
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(walked.len(), 3);
        assert!(oids.iter().all(|oid| walked.contains(oid)));
    }

    #[test]
    fn upstream_base_absent_in_fresh_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScratchRepo::init(dir.path()).unwrap();
        assert_eq!(repo.upstream_base(), None);
    }

    #[test]
    fn upstream_base_reads_remote_tracking_ref() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScratchRepo::init(dir.path()).unwrap();
        let oids = commit_chain(&repo, 1);
        repo.raw()
            .reference("refs/remotes/origin/main", oids[0], true, "test")
            .unwrap();
        assert_eq!(repo.upstream_base(), Some(oids[0]));
    }
}
