//! Sequential unpack-objects fallback.
//!
//! Used when libgit2's pack indexer rejects an incoming pack. Entries are
//! inflated one by one and written as loose objects through the odb; delta
//! entries are resolved against objects already written (earlier pack
//! entries or the cloned upstream odb). Unlike the indexer this path does
//! not produce a pack index and does not verify the SHA-1 trailer, which is
//! acceptable for a scratch repository that lives for one push.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::ZlibDecoder;
use git2::{ObjectType, Oid, Repository};
use std::collections::HashMap;
use std::io::Read;

const TYPE_COMMIT: u8 = 1;
const TYPE_TREE: u8 = 2;
const TYPE_BLOB: u8 = 3;
const TYPE_TAG: u8 = 4;
const TYPE_OFS_DELTA: u8 = 6;
const TYPE_REF_DELTA: u8 = 7;

/// Inflate every entry of `pack` into loose objects. Returns the number of
/// objects written.
pub fn unpack_objects(repo: &Repository, pack: &[u8]) -> Result<usize> {
    if pack.len() < 12 || &pack[..4] != b"PACK" {
        bail!("not a packfile");
    }
    let version = u32::from_be_bytes(pack[4..8].try_into().unwrap());
    if version != 2 && version != 3 {
        bail!("unsupported pack version {}", version);
    }
    let count = u32::from_be_bytes(pack[8..12].try_into().unwrap()) as usize;

    let odb = repo.odb().context("object database unavailable")?;
    // Entry offset -> written oid, for ofs-delta resolution.
    let mut by_offset: HashMap<usize, Oid> = HashMap::new();
    let mut pos = 12usize;

    for _ in 0..count {
        let entry_start = pos;
        let (kind, size, header_len) = read_entry_header(pack, pos)?;
        pos += header_len;

        let (base, obj_type) = match kind {
            TYPE_OFS_DELTA => {
                let (distance, len) = read_ofs_distance(pack, pos)?;
                pos += len;
                let base_offset = entry_start
                    .checked_sub(distance)
                    .ok_or_else(|| anyhow!("ofs-delta offset before pack start"))?;
                let base_oid = by_offset
                    .get(&base_offset)
                    .copied()
                    .ok_or_else(|| anyhow!("ofs-delta base at {} not seen", base_offset))?;
                let base = odb.read(base_oid).context("ofs-delta base unreadable")?;
                (Some((base.data().to_vec(), base.kind())), None)
            }
            TYPE_REF_DELTA => {
                if pos + 20 > pack.len() {
                    bail!("truncated ref-delta base id");
                }
                let base_oid = Oid::from_bytes(&pack[pos..pos + 20])?;
                pos += 20;
                let base = odb
                    .read(base_oid)
                    .with_context(|| format!("ref-delta base {} missing", base_oid))?;
                (Some((base.data().to_vec(), base.kind())), None)
            }
            TYPE_COMMIT => (None, Some(ObjectType::Commit)),
            TYPE_TREE => (None, Some(ObjectType::Tree)),
            TYPE_BLOB => (None, Some(ObjectType::Blob)),
            TYPE_TAG => (None, Some(ObjectType::Tag)),
            other => bail!("unknown pack entry type {}", other),
        };

        let (raw, consumed) = inflate_entry(pack, pos, size)?;
        pos += consumed;

        let (data, obj_type) = match base {
            Some((base_data, base_type)) => (apply_delta(&base_data, &raw)?, base_type),
            None => (raw, obj_type.unwrap()),
        };

        let oid = odb
            .write(obj_type, &data)
            .context("failed to write loose object")?;
        by_offset.insert(entry_start, oid);
    }

    Ok(by_offset.len())
}

/// Entry header: low 4 bits of the first byte are size bits, bits 4-6 the
/// type, MSB the continuation flag; further bytes carry 7 size bits each.
fn read_entry_header(pack: &[u8], pos: usize) -> Result<(u8, usize, usize)> {
    let mut idx = pos;
    let first = *pack.get(idx).ok_or_else(|| anyhow!("truncated pack entry"))?;
    idx += 1;
    let kind = (first >> 4) & 0x07;
    let mut size = (first & 0x0f) as usize;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = *pack.get(idx).ok_or_else(|| anyhow!("truncated pack entry"))?;
        idx += 1;
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
    }
    Ok((kind, size, idx - pos))
}

/// The ofs-delta distance: big-endian 7-bit groups where each continuation
/// adds one to the accumulated high bits.
fn read_ofs_distance(pack: &[u8], pos: usize) -> Result<(usize, usize)> {
    let mut idx = pos;
    let mut byte = *pack.get(idx).ok_or_else(|| anyhow!("truncated ofs-delta"))?;
    idx += 1;
    let mut distance = (byte & 0x7f) as usize;
    while byte & 0x80 != 0 {
        byte = *pack.get(idx).ok_or_else(|| anyhow!("truncated ofs-delta"))?;
        idx += 1;
        distance = ((distance + 1) << 7) | (byte & 0x7f) as usize;
    }
    Ok((distance, idx - pos))
}

/// Inflate one zlib stream expecting `expected` bytes; returns the data and
/// the number of compressed bytes consumed.
fn inflate_entry(pack: &[u8], pos: usize, expected: usize) -> Result<(Vec<u8>, usize)> {
    let mut decoder = ZlibDecoder::new(&pack[pos..]);
    let mut data = Vec::with_capacity(expected);
    decoder
        .read_to_end(&mut data)
        .context("zlib inflation failed")?;
    if data.len() != expected {
        bail!(
            "pack entry inflated to {} bytes, header declared {}",
            data.len(),
            expected
        );
    }
    Ok((data, decoder.total_in() as usize))
}

/// Apply a git delta to `base`.
fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0usize;
    let declared_base = read_varint(delta, &mut pos)?;
    if declared_base != base.len() {
        bail!(
            "delta base size {} does not match actual {}",
            declared_base,
            base.len()
        );
    }
    let result_size = read_varint(delta, &mut pos)?;
    let mut out = Vec::with_capacity(result_size);

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;
        if cmd & 0x80 != 0 {
            // Copy from base: bits 0-3 select offset bytes, 4-6 size bytes.
            let mut offset = 0usize;
            for bit in 0..4 {
                if cmd & (1 << bit) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| anyhow!("truncated delta"))?;
                    pos += 1;
                    offset |= (byte as usize) << (8 * bit);
                }
            }
            let mut size = 0usize;
            for bit in 0..3 {
                if cmd & (1 << (4 + bit)) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| anyhow!("truncated delta"))?;
                    pos += 1;
                    size |= (byte as usize) << (8 * bit);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| anyhow!("delta copy outside base"))?;
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            // Insert literal bytes.
            let size = cmd as usize;
            let end = pos
                .checked_add(size)
                .filter(|&end| end <= delta.len())
                .ok_or_else(|| anyhow!("truncated delta insert"))?;
            out.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            bail!("delta opcode 0 is reserved");
        }
    }

    if out.len() != result_size {
        bail!(
            "delta produced {} bytes, header declared {}",
            out.len(),
            result_size
        );
    }
    Ok(out)
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0;
    loop {
        let byte = *buf.get(*pos).ok_or_else(|| anyhow!("truncated varint"))?;
        *pos += 1;
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn entry_header(kind: u8, mut size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = (kind << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size > 0 {
            out.push(byte | 0x80);
            byte = (size & 0x7f) as u8;
            size >>= 7;
        }
        out.push(byte);
        out
    }

    fn pack_with(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut pack = Vec::new();
        pack.extend_from_slice(b"PACK");
        pack.extend_from_slice(&2u32.to_be_bytes());
        pack.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for entry in entries {
            pack.extend_from_slice(entry);
        }
        // Trailer is not verified by the fallback path.
        pack.extend_from_slice(&[0u8; 20]);
        pack
    }

    #[test]
    fn unpacks_plain_blob() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        let content = b"hello world";
        let mut entry = entry_header(TYPE_BLOB, content.len());
        entry.extend_from_slice(&deflate(content));

        let written = unpack_objects(&repo, &pack_with(&[entry])).unwrap();
        assert_eq!(written, 1);

        let expected = repo.odb().unwrap().write(ObjectType::Blob, content).unwrap();
        let odb = repo.odb().unwrap();
        let read = odb.read(expected).unwrap();
        assert_eq!(read.data(), content);
    }

    #[test]
    fn resolves_ref_delta_against_existing_odb_object() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        // Base object exists only in the odb, like a thin-pack base from the
        // upstream clone.
        let base = b"hello world";
        let base_oid = repo.odb().unwrap().write(ObjectType::Blob, base).unwrap();

        // Delta: copy all 11 base bytes, insert "!".
        let delta: Vec<u8> = vec![
            base.len() as u8, // base size
            12,               // result size
            0x90, 11,         // copy offset 0, size 11
            0x01, b'!',       // insert 1 byte
        ];
        let mut entry = entry_header(TYPE_REF_DELTA, delta.len());
        entry.extend_from_slice(base_oid.as_bytes());
        entry.extend_from_slice(&deflate(&delta));

        unpack_objects(&repo, &pack_with(&[entry])).unwrap();

        let expected = repo
            .odb()
            .unwrap()
            .write(ObjectType::Blob, b"hello world!")
            .unwrap();
        assert!(repo.odb().unwrap().exists(expected));
        let odb = repo.odb().unwrap();
        let read = odb.read(expected).unwrap();
        assert_eq!(read.data(), b"hello world!");
    }

    #[test]
    fn resolves_ofs_delta_against_earlier_entry() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        let base = b"base content";
        let mut first = entry_header(TYPE_BLOB, base.len());
        first.extend_from_slice(&deflate(base));

        // Copy the first 4 bytes of the base.
        let delta: Vec<u8> = vec![base.len() as u8, 4, 0x90, 4];
        let mut second = entry_header(TYPE_OFS_DELTA, delta.len());
        second.push(first.len() as u8); // distance back to the first entry
        second.extend_from_slice(&deflate(&delta));

        unpack_objects(&repo, &pack_with(&[first, second])).unwrap();

        let expected = repo.odb().unwrap().write(ObjectType::Blob, b"base").unwrap();
        assert!(repo.odb().unwrap().exists(expected));
    }

    #[test]
    fn rejects_non_pack_input() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert!(unpack_objects(&repo, b"JUNKJUNKJUNKJUNK").is_err());
    }

    #[test]
    fn rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut entry = entry_header(TYPE_BLOB, 99);
        entry.extend_from_slice(&deflate(b"short"));
        assert!(unpack_objects(&repo, &pack_with(&[entry])).is_err());
    }
}
