//! Deterministic PR-hash derivation.
//!
//! The hash is the first 8 hex characters of `SHA-256("owner/repo/branch")`.
//! There is no secret: a client can precompute the hash for a branch it has
//! already pushed and address the existing PR on a later push without the
//! server remembering anything.

use sha2::{Digest, Sha256};

/// Derive the 8-character PR hash for a branch on the fork.
pub fn generate_pr_hash(owner: &str, repo: &str, branch: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}/{}", owner, repo, branch).as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// The fork branch name carrying a given PR hash.
pub fn branch_for_hash(pr_hash: &str) -> String {
    format!("gitgost-{}", pr_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn hash_is_deterministic_and_eight_hex_chars() {
        let a = generate_pr_hash("acme", "lib", "gitgost-1234abcd");
        let b = generate_pr_hash("acme", "lib", "gitgost-1234abcd");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));

        let expected = hex::encode(Sha256::digest(b"acme/lib/gitgost-1234abcd"));
        assert_eq!(a, expected[..8]);
    }

    #[test]
    fn hash_differs_per_input() {
        assert_ne!(
            generate_pr_hash("acme", "lib", "gitgost-aaaa0000"),
            generate_pr_hash("acme", "lib", "gitgost-bbbb0000")
        );
        assert_ne!(
            generate_pr_hash("acme", "lib", "b"),
            generate_pr_hash("acme", "other", "b")
        );
    }

    #[test]
    fn branch_name_carries_hash() {
        assert_eq!(branch_for_hash("deadbeef"), "gitgost-deadbeef");
    }
}
