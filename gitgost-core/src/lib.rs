//! Protocol-level primitives for the gitgost anonymizing push proxy.
//!
//! This crate contains the pieces of the Git Smart-HTTP dialect that are
//! independent of any I/O or server framework: pkt-line framing and
//! side-band-64k multiplexing, decomposition of a `git-receive-pack`
//! request body into ref-update commands and a packfile, and the
//! deterministic PR-hash derivation that clients can precompute.

pub mod hash;
pub mod pack;
pub mod pktline;

pub use hash::{branch_for_hash, generate_pr_hash};
pub use pack::{extract_pack, PackError, PackRequest, RefUpdate};
pub use pktline::{write_pkt, write_sideband, Band, Pkt, PktError, PktReader, MAX_PKT_PAYLOAD};
