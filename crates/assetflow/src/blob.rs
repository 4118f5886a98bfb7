//! Binary mesh blob boundary.
//!
//! The streaming core treats mesh blobs as opaque byte buffers plus a byte
//! length for budget accounting; only the fixed 20-byte header is validated
//! here. Attribute layout and index data are the GPU-upload collaborator's
//! concern.

use crate::error::{Error, Result};

/// Magic bytes opening every mesh blob.
pub const BLOB_MAGIC: [u8; 4] = *b"MSH0";

/// Byte length of the fixed header.
pub const BLOB_HEADER_LEN: usize = 20;

/// Parsed mesh blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// Format version gating which attribute arrays follow.
    pub version: u32,
    /// Number of vertices in the packed attribute arrays.
    pub vertex_count: u32,
    /// Number of `u32` indices in the trailing index array.
    pub index_count: u32,
    /// Bitflags gating optional attribute arrays.
    pub flags: u32,
}

impl BlobHeader {
    /// Parse and validate the fixed header of a mesh blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Blob`] if the buffer is shorter than the header or
    /// the magic bytes are wrong.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BLOB_HEADER_LEN {
            return Err(Error::Blob {
                context: "header",
                detail: format!("truncated: {} bytes, need {BLOB_HEADER_LEN}", data.len()),
            });
        }
        if data[0..4] != BLOB_MAGIC {
            return Err(Error::Blob {
                context: "header",
                detail: format!("bad magic {:02x?}", &data[0..4]),
            });
        }
        let word = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        Ok(Self {
            version: word(4),
            vertex_count: word(8),
            index_count: word(12),
            flags: word(16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(version: u32, vertices: u32, indices: u32, flags: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&BLOB_MAGIC);
        data.extend_from_slice(&version.to_le_bytes());
        data.extend_from_slice(&vertices.to_le_bytes());
        data.extend_from_slice(&indices.to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data
    }

    #[test]
    fn test_parse_header() {
        let header = BlobHeader::parse(&blob(2, 100, 300, 0b101)).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.vertex_count, 100);
        assert_eq!(header.index_count, 300);
        assert_eq!(header.flags, 0b101);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let result = BlobHeader::parse(&[0x4d, 0x53, 0x48]);
        assert!(matches!(result, Err(Error::Blob { .. })));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut data = blob(1, 0, 0, 0);
        data[3] = b'9';
        assert!(matches!(BlobHeader::parse(&data), Err(Error::Blob { .. })));
    }
}
