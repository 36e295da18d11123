//! Git pkt-line framing and side-band-64k multiplexing.
//!
//! A pkt-line is a 4-character lowercase-hex length prefix (which counts
//! itself) followed by the payload. The length `0000` is a flush-pkt and
//! carries no payload. Side-band frames put a one-byte band selector in
//! front of the payload: band 1 is pack data / protocol result, band 2 is
//! progress (rendered as `remote:` by the client), band 3 is a fatal error.

use thiserror::Error;

/// Largest payload a single pkt-line may carry (64 KiB minus the 4-byte
/// length prefix and the side-band selector byte).
pub const MAX_PKT_PAYLOAD: usize = 65_519;

/// Side-band channel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Pack data and the protocol result the client parses (`unpack ok`,
    /// per-ref status lines).
    Data = 1,
    /// Human-readable progress, shown by the client prefixed with `remote:`.
    Progress = 2,
    /// Fatal error; the client aborts after printing it.
    Error = 3,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PktError {
    #[error("invalid pkt-line length prefix {0:?}")]
    BadLength(String),
    #[error("pkt-line declares {declared} bytes but only {remaining} remain")]
    Truncated { declared: usize, remaining: usize },
}

/// Write `data` as one pkt-line. An empty `data` writes a flush-pkt.
pub fn write_pkt(out: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        out.extend_from_slice(b"0000");
        return;
    }
    debug_assert!(data.len() <= MAX_PKT_PAYLOAD);
    out.extend_from_slice(format!("{:04x}", data.len() + 4).as_bytes());
    out.extend_from_slice(data);
}

/// Write `msg` on the given side band, appending a trailing newline if the
/// message does not already end with one. Empty messages are dropped.
pub fn write_sideband(out: &mut Vec<u8>, band: Band, msg: &str) {
    if msg.is_empty() {
        return;
    }
    let mut payload = Vec::with_capacity(msg.len() + 2);
    payload.push(band as u8);
    payload.extend_from_slice(msg.as_bytes());
    if !msg.ends_with('\n') {
        payload.push(b'\n');
    }
    write_pkt(out, &payload);
}

/// One decoded frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Pkt<'a> {
    Line(&'a [u8]),
    Flush,
}

/// Cursor-style pkt-line decoder over an in-memory buffer.
pub struct PktReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PktReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset into the underlying buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Everything not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Read the next frame. Returns `Ok(None)` at end of input.
    pub fn read_pkt(&mut self) -> Result<Option<Pkt<'a>>, PktError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let remaining = self.buf.len() - self.pos;
        if remaining < 4 {
            return Err(PktError::Truncated {
                declared: 4,
                remaining,
            });
        }
        let prefix = &self.buf[self.pos..self.pos + 4];
        if prefix == b"0000" {
            self.pos += 4;
            return Ok(Some(Pkt::Flush));
        }
        let prefix_str = std::str::from_utf8(prefix)
            .map_err(|_| PktError::BadLength(format!("{:02x?}", prefix)))?;
        let declared = usize::from_str_radix(prefix_str, 16)
            .map_err(|_| PktError::BadLength(prefix_str.to_string()))?;
        if declared < 4 {
            return Err(PktError::BadLength(prefix_str.to_string()));
        }
        if declared > remaining {
            return Err(PktError::Truncated {
                declared,
                remaining,
            });
        }
        let payload = &self.buf[self.pos + 4..self.pos + declared];
        self.pos += declared;
        Ok(Some(Pkt::Line(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_data_writes_flush() {
        let mut out = Vec::new();
        write_pkt(&mut out, b"");
        assert_eq!(out, b"0000");
    }

    #[test]
    fn encodes_length_including_prefix() {
        let mut out = Vec::new();
        write_pkt(&mut out, b"hello\n");
        assert_eq!(out, b"000ahello\n");
    }

    #[test]
    fn sideband_appends_newline_and_band_byte() {
        let mut out = Vec::new();
        write_sideband(&mut out, Band::Progress, "remote: working");
        // 4 (prefix) + 1 (band) + 15 (msg) + 1 (newline) = 0x15
        assert_eq!(&out[..4], b"0015");
        assert_eq!(out[4], 2);
        assert_eq!(&out[5..], b"remote: working\n");
    }

    #[test]
    fn sideband_keeps_existing_newline() {
        let mut out = Vec::new();
        write_sideband(&mut out, Band::Data, "unpack ok\n");
        let mut reader = PktReader::new(&out);
        match reader.read_pkt().unwrap().unwrap() {
            Pkt::Line(payload) => {
                assert_eq!(payload[0], 1);
                assert_eq!(&payload[1..], b"unpack ok\n");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn reads_flush_and_eof() {
        let mut reader = PktReader::new(b"0000");
        assert_eq!(reader.read_pkt().unwrap(), Some(Pkt::Flush));
        assert_eq!(reader.read_pkt().unwrap(), None);
    }

    #[test]
    fn rejects_non_hex_prefix() {
        let mut reader = PktReader::new(b"PACK\x00\x00\x00\x02");
        assert!(matches!(
            reader.read_pkt(),
            Err(PktError::BadLength(_))
        ));
    }

    #[test]
    fn rejects_undersized_length() {
        let mut reader = PktReader::new(b"0003x");
        assert!(matches!(reader.read_pkt(), Err(PktError::BadLength(_))));
    }

    #[test]
    fn rejects_length_past_end_of_input() {
        let mut reader = PktReader::new(b"00ffshort");
        assert!(matches!(
            reader.read_pkt(),
            Err(PktError::Truncated { declared: 255, .. })
        ));
    }

    proptest! {
        #[test]
        fn roundtrip(data in proptest::collection::vec(any::<u8>(), 1..=MAX_PKT_PAYLOAD)) {
            let mut out = Vec::new();
            write_pkt(&mut out, &data);
            let mut reader = PktReader::new(&out);
            prop_assert_eq!(reader.read_pkt().unwrap(), Some(Pkt::Line(&data[..])));
            prop_assert_eq!(reader.read_pkt().unwrap(), None);
        }
    }
}
