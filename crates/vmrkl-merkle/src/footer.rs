//! Binary footer format shared by `.mref` and `.mrkl` files (§6.1, §6.2).
//!
//! Layout (all multi-byte integers little-endian):
//!
//! ```text
//! [0 .. payload_end)                 payload (hash array, + bitmap for state)
//! [payload_end .. file_len-1)        footer fields + checksum
//! [file_len-1 .. file_len)           footer_length (u8)
//! ```
//!
//! `footer_length` is the byte length of the footer fields block (excluding
//! itself), so a loader can seek to `file_len - 1 - footer_length` to find
//! the footer's start without needing to know in advance whether it is a
//! reference or a state footer.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use vmrkl_core::error::ChannelError;
use vmrkl_core::hash::Digest32;

/// Format version written by this implementation.
pub const FORMAT_VERSION: u16 = 1;

/// Magic bytes identifying a `.mref` file.
pub const MREF_MAGIC: [u8; 4] = *b"MREF";
/// Magic bytes identifying a `.mrkl` file.
pub const MRKL_MAGIC: [u8; 4] = *b"MRKL";

/// Common geometry fields carried by both footer kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryFields {
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Total content size in bytes.
    pub total_content_size: u64,
    /// Number of actual leaves (chunks).
    pub leaf_count: u64,
    /// Total node count in the tree.
    pub node_count: u64,
}

/// Write the `.mref` footer (magic, version, geometry, checksum, length
/// byte) to `w`. Does not write the hash array itself; callers write the
/// payload first and then call this.
pub fn write_reference_footer(w: &mut impl Write, geometry: GeometryFields) -> io::Result<()> {
    let mut fields = Vec::with_capacity(4 + 2 + 8 * 4);
    fields.extend_from_slice(&MREF_MAGIC);
    fields.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    fields.write_u64::<LittleEndian>(geometry.chunk_size)?;
    fields.write_u64::<LittleEndian>(geometry.total_content_size)?;
    fields.write_u64::<LittleEndian>(geometry.leaf_count)?;
    fields.write_u64::<LittleEndian>(geometry.node_count)?;

    let checksum = footer_checksum(&fields);
    fields.extend_from_slice(&checksum);

    debug_assert!(fields.len() <= u8::MAX as usize);
    w.write_all(&fields)?;
    w.write_u8(fields.len() as u8)?;
    Ok(())
}

/// Write the `.mrkl` footer, which additionally carries `valid_chunk_count`.
pub fn write_state_footer(
    w: &mut impl Write,
    geometry: GeometryFields,
    valid_chunk_count: u64,
) -> io::Result<()> {
    let mut fields = Vec::with_capacity(4 + 2 + 8 * 5);
    fields.extend_from_slice(&MRKL_MAGIC);
    fields.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    fields.write_u64::<LittleEndian>(geometry.chunk_size)?;
    fields.write_u64::<LittleEndian>(geometry.total_content_size)?;
    fields.write_u64::<LittleEndian>(geometry.leaf_count)?;
    fields.write_u64::<LittleEndian>(geometry.node_count)?;
    fields.write_u64::<LittleEndian>(valid_chunk_count)?;

    let checksum = footer_checksum(&fields);
    fields.extend_from_slice(&checksum);

    debug_assert!(fields.len() <= u8::MAX as usize);
    w.write_all(&fields)?;
    w.write_u8(fields.len() as u8)?;
    Ok(())
}

/// A parsed `.mref` footer, plus the byte offset where its payload began.
#[derive(Clone, Copy, Debug)]
pub struct ParsedReferenceFooter {
    /// Shared geometry fields.
    pub geometry: GeometryFields,
    /// Byte offset of the first byte of the footer block (i.e. the end of
    /// the hash-array payload).
    pub footer_start: u64,
}

/// A parsed `.mrkl` footer.
#[derive(Clone, Copy, Debug)]
pub struct ParsedStateFooter {
    /// Shared geometry fields.
    pub geometry: GeometryFields,
    /// Number of chunks marked valid at the time of the last flush.
    pub valid_chunk_count: u64,
    /// Byte offset of the first byte of the footer block (i.e. the end of
    /// the hash-array + bitmap payload).
    pub footer_start: u64,
}

/// Parse and validate a `.mref` footer from the full file contents,
/// given the total file length. Fails with [`ChannelError::CorruptReference`]
/// on any magic/version/checksum mismatch.
pub fn read_reference_footer(
    path: &str,
    data: &[u8],
) -> Result<ParsedReferenceFooter, ChannelError> {
    let corrupt = |reason: &str| ChannelError::CorruptReference {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let footer_len = read_footer_length(data).map_err(|e| corrupt(&e))?;
    let footer_start = (data.len() as u64)
        .checked_sub(1)
        .and_then(|x| x.checked_sub(footer_len as u64))
        .ok_or_else(|| corrupt("file too short for declared footer length"))?;
    let fields = &data[footer_start as usize..data.len() - 1];
    if fields.len() != footer_len as usize {
        return Err(corrupt("footer length mismatch"));
    }

    let (body, checksum) = fields.split_at(fields.len() - 32);
    let expected = footer_checksum(body);
    if expected != checksum {
        return Err(corrupt("checksum mismatch"));
    }

    let mut cur = body;
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic).map_err(|_| corrupt("truncated magic"))?;
    if magic != MREF_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = cur
        .read_u16::<LittleEndian>()
        .map_err(|_| corrupt("truncated version"))?;
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }
    let chunk_size = cur.read_u64::<LittleEndian>().map_err(|_| corrupt("truncated chunk_size"))?;
    let total_content_size = cur
        .read_u64::<LittleEndian>()
        .map_err(|_| corrupt("truncated total_content_size"))?;
    let leaf_count = cur.read_u64::<LittleEndian>().map_err(|_| corrupt("truncated leaf_count"))?;
    let node_count = cur.read_u64::<LittleEndian>().map_err(|_| corrupt("truncated node_count"))?;

    Ok(ParsedReferenceFooter {
        geometry: GeometryFields {
            chunk_size,
            total_content_size,
            leaf_count,
            node_count,
        },
        footer_start,
    })
}

/// Parse and validate a `.mrkl` footer.
pub fn read_state_footer(path: &str, data: &[u8]) -> Result<ParsedStateFooter, ChannelError> {
    let corrupt = |reason: &str| ChannelError::CorruptState {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let footer_len = read_footer_length(data).map_err(|e| corrupt(&e))?;
    let footer_start = (data.len() as u64)
        .checked_sub(1)
        .and_then(|x| x.checked_sub(footer_len as u64))
        .ok_or_else(|| corrupt("file too short for declared footer length"))?;
    let fields = &data[footer_start as usize..data.len() - 1];
    if fields.len() != footer_len as usize {
        return Err(corrupt("footer length mismatch"));
    }

    let (body, checksum) = fields.split_at(fields.len() - 32);
    let expected = footer_checksum(body);
    if expected != checksum {
        return Err(corrupt("checksum mismatch"));
    }

    let mut cur = body;
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic).map_err(|_| corrupt("truncated magic"))?;
    if magic != MRKL_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = cur
        .read_u16::<LittleEndian>()
        .map_err(|_| corrupt("truncated version"))?;
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }
    let chunk_size = cur.read_u64::<LittleEndian>().map_err(|_| corrupt("truncated chunk_size"))?;
    let total_content_size = cur
        .read_u64::<LittleEndian>()
        .map_err(|_| corrupt("truncated total_content_size"))?;
    let leaf_count = cur.read_u64::<LittleEndian>().map_err(|_| corrupt("truncated leaf_count"))?;
    let node_count = cur.read_u64::<LittleEndian>().map_err(|_| corrupt("truncated node_count"))?;
    let valid_chunk_count = cur
        .read_u64::<LittleEndian>()
        .map_err(|_| corrupt("truncated valid_chunk_count"))?;

    Ok(ParsedStateFooter {
        geometry: GeometryFields {
            chunk_size,
            total_content_size,
            leaf_count,
            node_count,
        },
        valid_chunk_count,
        footer_start,
    })
}

fn read_footer_length(data: &[u8]) -> Result<u8, String> {
    if data.is_empty() {
        return Err("empty file".to_string());
    }
    Ok(data[data.len() - 1])
}

fn footer_checksum(fields: &[u8]) -> Digest32 {
    vmrkl_core::hash::hash_leaf(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_footer_roundtrips() {
        let geometry = GeometryFields {
            chunk_size: 4096,
            total_content_size: 20_000,
            leaf_count: 5,
            node_count: 9,
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0xAAu8; 32 * 9]); // fake payload
        write_reference_footer(&mut buf, geometry).unwrap();

        let parsed = read_reference_footer("x.mref", &buf).unwrap();
        assert_eq!(parsed.geometry, geometry);
        assert_eq!(parsed.footer_start, 32 * 9);
    }

    #[test]
    fn state_footer_roundtrips_with_valid_count() {
        let geometry = GeometryFields {
            chunk_size: 4096,
            total_content_size: 20_000,
            leaf_count: 5,
            node_count: 9,
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0xBBu8; 32 * 9 + 1]); // payload + bitmap byte
        write_state_footer(&mut buf, geometry, 3).unwrap();

        let parsed = read_state_footer("x.mrkl", &buf).unwrap();
        assert_eq!(parsed.geometry, geometry);
        assert_eq!(parsed.valid_chunk_count, 3);
        assert_eq!(parsed.footer_start, 32 * 9 + 1);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let geometry = GeometryFields {
            chunk_size: 4096,
            total_content_size: 20_000,
            leaf_count: 5,
            node_count: 9,
        };
        let mut buf = Vec::new();
        write_reference_footer(&mut buf, geometry).unwrap();
        let last = buf.len() - 2;
        buf[last] ^= 0xFF; // flip a checksum byte
        assert!(read_reference_footer("x.mref", &buf).is_err());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let geometry = GeometryFields {
            chunk_size: 4096,
            total_content_size: 20_000,
            leaf_count: 5,
            node_count: 9,
        };
        let mut buf = Vec::new();
        write_state_footer(&mut buf, geometry, 0).unwrap();
        // Try to read a state footer as a reference footer.
        assert!(read_reference_footer("x.mref", &buf).is_err());
    }
}
