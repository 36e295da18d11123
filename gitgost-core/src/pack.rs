//! Decomposition of a `git-receive-pack` request body.
//!
//! The body is a sequence of pkt-line commands (`<old> <new> <ref>\0<caps>`)
//! terminated by a flush-pkt, followed by the packfile. Real clients are not
//! always tidy about the boundary: the flush may be missing, in which case
//! the `PACK` magic shows up where a pkt header or payload was expected.
//! Extraction tolerates both and falls back to scanning the body for the
//! last `PACK` magic before giving up.

use thiserror::Error;

use crate::pktline::{Pkt, PktReader};

const PACK_MAGIC: &[u8] = b"PACK";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    #[error("no packfile found in body")]
    NoPackfile,
    #[error("no ref update found in request")]
    NoRefUpdate,
}

/// A single ref-update command from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old_sha: String,
    pub new_sha: String,
    pub ref_name: String,
}

impl RefUpdate {
    /// Parse the command portion of a pkt-line payload (capabilities already
    /// stripped). Returns `None` unless both SHAs are 40 hex characters and
    /// the ref is a branch or tag.
    fn parse(command: &str) -> Option<RefUpdate> {
        let mut fields = command.split_whitespace();
        let old_sha = fields.next()?;
        let new_sha = fields.next()?;
        let ref_name = fields.next()?;
        if !is_sha(old_sha) || !is_sha(new_sha) {
            return None;
        }
        if !ref_name.starts_with("refs/heads/") && !ref_name.starts_with("refs/tags/") {
            return None;
        }
        Some(RefUpdate {
            old_sha: old_sha.to_string(),
            new_sha: new_sha.to_string(),
            ref_name: ref_name.to_string(),
        })
    }
}

fn is_sha(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// The decomposed request: one ref update, the capability list the client
/// sent on the first command line, and the raw packfile bytes.
#[derive(Debug)]
pub struct PackRequest<'a> {
    pub ref_update: RefUpdate,
    pub capabilities: Vec<String>,
    pub pack: &'a [u8],
}

impl PackRequest<'_> {
    /// The `pr-hash=<8-hex>` push option, when the client asked to update an
    /// existing PR. Malformed values are ignored like any unknown capability.
    pub fn pr_hash(&self) -> Option<&str> {
        self.capabilities
            .iter()
            .filter_map(|c| c.strip_prefix("pr-hash="))
            .find(|v| v.len() == 8 && v.bytes().all(|b| b.is_ascii_hexdigit()))
    }
}

/// Split a receive-pack body into its ref-update command and packfile.
///
/// The first well-formed command wins; later commands are ignored. The
/// command phase ends on flush-pkt, end of input, a payload that begins with
/// the `PACK` magic (rewinding to its start), or a malformed pkt header
/// (typically the magic itself landing where a length prefix was expected).
pub fn extract_pack(body: &[u8]) -> Result<PackRequest<'_>, PackError> {
    let mut reader = PktReader::new(body);
    let mut ref_update: Option<RefUpdate> = None;
    let mut capabilities: Vec<String> = Vec::new();
    let mut pack_start: Option<usize> = None;

    loop {
        match reader.read_pkt() {
            Ok(None) | Ok(Some(Pkt::Flush)) => break,
            Ok(Some(Pkt::Line(payload))) => {
                if payload.starts_with(PACK_MAGIC) {
                    pack_start = Some(reader.position() - payload.len());
                    break;
                }
                let Ok(line) = std::str::from_utf8(payload) else {
                    continue;
                };
                let (command, caps) = match line.split_once('\0') {
                    Some((command, caps)) => (command, Some(caps)),
                    None => (line, None),
                };
                if ref_update.is_none() {
                    if let Some(update) = RefUpdate::parse(command.trim_end()) {
                        ref_update = Some(update);
                        if let Some(caps) = caps {
                            capabilities = caps
                                .split_whitespace()
                                .map(|c| c.to_string())
                                .collect();
                        }
                    }
                }
            }
            // A malformed header usually means the flush was omitted and we
            // are staring at the packfile; leave the cursor where it is and
            // let the magic checks below sort it out.
            Err(_) => break,
        }
    }

    let mut pack = match pack_start {
        Some(start) => &body[start..],
        None => reader.rest(),
    };

    if pack.len() < 4 || &pack[..4] != PACK_MAGIC {
        match body.windows(4).rposition(|w| w == PACK_MAGIC) {
            Some(idx) => pack = &body[idx..],
            None => return Err(PackError::NoPackfile),
        }
    }

    let ref_update = ref_update.ok_or(PackError::NoRefUpdate)?;
    Ok(PackRequest {
        ref_update,
        capabilities,
        pack,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::write_pkt;

    const OLD: &str = "0000000000000000000000000000000000000000";
    const NEW: &str = "1111222233334444555566667777888899990000";

    fn command_line(caps: &str) -> Vec<u8> {
        let mut line = format!("{} {} refs/heads/main", OLD, NEW).into_bytes();
        if !caps.is_empty() {
            line.push(0);
            line.extend_from_slice(caps.as_bytes());
        }
        line
    }

    fn body_with(caps: &str, pack: &[u8], flush: bool) -> Vec<u8> {
        let mut body = Vec::new();
        write_pkt(&mut body, &command_line(caps));
        if flush {
            write_pkt(&mut body, b"");
        }
        body.extend_from_slice(pack);
        body
    }

    #[test]
    fn extracts_command_and_pack() {
        let body = body_with("report-status side-band-64k", b"PACKdata", true);
        let req = extract_pack(&body).unwrap();
        assert_eq!(req.ref_update.old_sha, OLD);
        assert_eq!(req.ref_update.new_sha, NEW);
        assert_eq!(req.ref_update.ref_name, "refs/heads/main");
        assert_eq!(req.capabilities, vec!["report-status", "side-band-64k"]);
        assert_eq!(req.pack, b"PACKdata");
    }

    #[test]
    fn extraction_is_idempotent_on_reconstructed_body() {
        let body = body_with("report-status", b"PACKdata", true);
        let first = extract_pack(&body).unwrap();

        let mut rebuilt = Vec::new();
        write_pkt(&mut rebuilt, &command_line("report-status"));
        write_pkt(&mut rebuilt, b"");
        rebuilt.extend_from_slice(first.pack);

        let second = extract_pack(&rebuilt).unwrap();
        assert_eq!(second.ref_update, first.ref_update);
        assert_eq!(second.pack, first.pack);
    }

    #[test]
    fn missing_flush_with_pack_magic_as_header() {
        // No flush-pkt: the PACK magic lands where a length prefix would be.
        let body = body_with("", b"PACK\x00\x00\x00\x02rest", false);
        let req = extract_pack(&body).unwrap();
        assert_eq!(req.pack, b"PACK\x00\x00\x00\x02rest");
    }

    #[test]
    fn payload_beginning_with_pack_magic_rewinds() {
        let mut body = Vec::new();
        write_pkt(&mut body, &command_line(""));
        // The magic read as if it were a command payload.
        write_pkt(&mut body, b"PACKtail");
        let req = extract_pack(&body).unwrap();
        assert_eq!(req.pack, b"PACKtail");
    }

    #[test]
    fn falls_back_to_last_pack_magic_in_body() {
        let mut body = Vec::new();
        write_pkt(&mut body, &command_line(""));
        write_pkt(&mut body, b"");
        body.extend_from_slice(b"garbage PACKone PACKtwo");
        let req = extract_pack(&body).unwrap();
        assert_eq!(req.pack, b"PACKtwo");
    }

    #[test]
    fn zeroed_body_has_no_packfile() {
        let body = vec![0u8; 1024];
        match extract_pack(&body) {
            Err(PackError::NoPackfile) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn pack_without_command_is_missing_ref_update() {
        let mut body = Vec::new();
        write_pkt(&mut body, b"");
        body.extend_from_slice(b"PACKdata");
        match extract_pack(&body) {
            Err(PackError::NoRefUpdate) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn only_first_well_formed_command_is_kept() {
        let mut body = Vec::new();
        write_pkt(&mut body, &command_line("report-status"));
        write_pkt(
            &mut body,
            format!("{} {} refs/heads/other", NEW, OLD).as_bytes(),
        );
        write_pkt(&mut body, b"");
        body.extend_from_slice(b"PACKdata");
        let req = extract_pack(&body).unwrap();
        assert_eq!(req.ref_update.ref_name, "refs/heads/main");
    }

    #[test]
    fn malformed_commands_are_skipped() {
        let mut body = Vec::new();
        write_pkt(&mut body, b"not a command");
        write_pkt(&mut body, &command_line(""));
        write_pkt(&mut body, b"");
        body.extend_from_slice(b"PACKdata");
        let req = extract_pack(&body).unwrap();
        assert_eq!(req.ref_update.new_sha, NEW);
    }

    #[test]
    fn pr_hash_option_requires_eight_hex_chars() {
        let body = body_with("report-status pr-hash=deadbeef", b"PACKx", true);
        let req = extract_pack(&body).unwrap();
        assert_eq!(req.pr_hash(), Some("deadbeef"));

        let body = body_with("pr-hash=nothex!! pr-hash=tooshort", b"PACKx", true);
        let req = extract_pack(&body).unwrap();
        assert_eq!(req.pr_hash(), None);
    }
}
