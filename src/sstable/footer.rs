//! Table file framing: block handles, the fixed footer, and the
//! read-verify-decompress path shared by every block fetch.

use std::fs::File;
use std::os::unix::fs::FileExt;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::Compression;
use crate::encoding::{decode_varint64, encode_varint64, masked_crc};
use crate::error::{Error, Result};

/// Location of a block inside a table file. `size` excludes the 5-byte
/// trailer that follows every block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

/// Maximum encoded length of a handle: two varint64s.
pub const MAX_ENCODED_HANDLE: usize = 10 + 10;

/// compression tag (1) + masked crc (4).
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// metaindex handle + index handle padded to 40 bytes, then the magic.
pub const FOOTER_SIZE: usize = 48;

pub const TABLE_MAGIC: u64 = 0xc7f5_4a1d_88e2_3b60;

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        encode_varint64(dst, self.offset);
        encode_varint64(dst, self.size);
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_ENCODED_HANDLE);
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes a handle from the front of `buf`, returning it and the bytes
    /// consumed.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize)> {
        let (offset, n1) =
            decode_varint64(buf).ok_or_else(|| Error::Corruption("bad block handle".to_string()))?;
        let (size, n2) = decode_varint64(&buf[n1..])
            .ok_or_else(|| Error::Corruption("bad block handle".to_string()))?;
        Ok((Self { offset, size }, n1 + n2))
    }
}

/// The fixed-size table footer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex_handle.encode_to(&mut buf);
        self.index_handle.encode_to(&mut buf);
        buf.resize(FOOTER_SIZE - 8, 0);
        let mut magic = [0u8; 8];
        LittleEndian::write_u64(&mut magic, TABLE_MAGIC);
        buf.extend_from_slice(&magic);

        let mut out = [0u8; FOOTER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(Error::Corruption("footer has wrong length".to_string()));
        }
        let magic = LittleEndian::read_u64(&buf[FOOTER_SIZE - 8..]);
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(
                "not an sstable (bad magic number)".to_string(),
            ));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(buf)?;
        let (index_handle, _) = BlockHandle::decode_from(&buf[n..])?;
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Reads a block at `handle`, verifies the trailer, and decompresses.
/// Checksum verification is skipped unless `verify_checksums`; a damaged
/// length or compression tag always fails.
pub fn read_block(file: &File, handle: BlockHandle, verify_checksums: bool) -> Result<Vec<u8>> {
    let size = handle.size as usize;
    let mut raw = vec![0u8; size + BLOCK_TRAILER_SIZE];
    file.read_exact_at(&mut raw, handle.offset)
        .map_err(|e| Error::Corruption(format!("truncated block read: {e}")))?;

    let compression_tag = raw[size];
    if verify_checksums {
        let expected = LittleEndian::read_u32(&raw[size + 1..size + 5]);
        let actual = masked_crc(&[&raw[..size], &[compression_tag]]);
        if expected != actual {
            return Err(Error::Corruption("block checksum mismatch".to_string()));
        }
    }

    let contents = &raw[..size];
    match Compression::from_u8(compression_tag) {
        Some(Compression::None) => Ok(contents.to_vec()),
        Some(Compression::Snappy) => {
            let decompressed = snap::raw::Decoder::new().decompress_vec(contents)?;
            Ok(decompressed)
        }
        None => Err(Error::NotSupported(format!(
            "unknown block compression tag {compression_tag:#x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let handle = BlockHandle::new(1 << 40, 4096);
        let encoded = handle.encoded();
        let (decoded, n) = BlockHandle::decode_from(&encoded).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(n, encoded.len());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(1000, 50),
            index_handle: BlockHandle::new(1055, 900),
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(0, 0),
            index_handle: BlockHandle::new(0, 0),
        };
        let mut encoded = footer.encode();
        encoded[FOOTER_SIZE - 1] ^= 0xff;
        assert!(matches!(
            Footer::decode(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_footer_rejects_bad_length() {
        assert!(Footer::decode(&[0u8; 10]).is_err());
    }
}
