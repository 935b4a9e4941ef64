//! Version edits: durable deltas to the database's file sets.
//!
//! Each edit is serialised as a run of tagged fields and appended to the
//! manifest as one log record. Replaying every edit in order reconstructs
//! the latest version; a fresh manifest always starts with a full snapshot
//! edit so older manifests can be discarded.

use crate::encoding::{
    decode_varint32, decode_varint64, encode_varint32, encode_varint64,
    get_length_prefixed_slice, put_length_prefixed_slice,
};
use crate::error::{Error, Result};
use crate::key::SequenceNumber;
use crate::version::FileMetaData;

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;

/// A delta against the current version.
#[derive(Clone, Debug, Default)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    /// (level, internal key): where the next compaction at `level` resumes.
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, n: u64) {
        self.log_number = Some(n);
    }

    pub fn set_next_file_number(&mut self, n: u64) {
        self.next_file_number = Some(n);
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: &[u8]) {
        self.compact_pointers.push((level, key.to_vec()));
    }

    pub fn delete_file(&mut self, level: usize, file_number: u64) {
        self.deleted_files.push((level, file_number));
    }

    pub fn add_file(&mut self, level: usize, meta: FileMetaData) {
        self.new_files.push((level, meta));
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        if let Some(name) = &self.comparator {
            encode_varint32(dst, TAG_COMPARATOR);
            put_length_prefixed_slice(dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            encode_varint32(dst, TAG_LOG_NUMBER);
            encode_varint64(dst, n);
        }
        if let Some(n) = self.next_file_number {
            encode_varint32(dst, TAG_NEXT_FILE_NUMBER);
            encode_varint64(dst, n);
        }
        if let Some(seq) = self.last_sequence {
            encode_varint32(dst, TAG_LAST_SEQUENCE);
            encode_varint64(dst, seq);
        }
        for (level, key) in &self.compact_pointers {
            encode_varint32(dst, TAG_COMPACT_POINTER);
            encode_varint32(dst, *level as u32);
            put_length_prefixed_slice(dst, key);
        }
        for (level, number) in &self.deleted_files {
            encode_varint32(dst, TAG_DELETED_FILE);
            encode_varint32(dst, *level as u32);
            encode_varint64(dst, *number);
        }
        for (level, meta) in &self.new_files {
            encode_varint32(dst, TAG_NEW_FILE);
            encode_varint32(dst, *level as u32);
            encode_varint64(dst, meta.number);
            encode_varint64(dst, meta.size);
            put_length_prefixed_slice(dst, &meta.smallest);
            put_length_prefixed_slice(dst, &meta.largest);
        }
    }

    pub fn decode_from(mut buf: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();

        fn read_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
            let (v, n) = decode_varint32(buf)
                .ok_or_else(|| Error::Corruption(format!("bad {what} in version edit")))?;
            *buf = &buf[n..];
            Ok(v)
        }
        fn read_u64(buf: &mut &[u8], what: &str) -> Result<u64> {
            let (v, n) = decode_varint64(buf)
                .ok_or_else(|| Error::Corruption(format!("bad {what} in version edit")))?;
            *buf = &buf[n..];
            Ok(v)
        }
        fn read_bytes(buf: &mut &[u8], what: &str) -> Result<Vec<u8>> {
            let (slice, n) = get_length_prefixed_slice(buf)
                .ok_or_else(|| Error::Corruption(format!("bad {what} in version edit")))?;
            let out = slice.to_vec();
            *buf = &buf[n..];
            Ok(out)
        }

        while !buf.is_empty() {
            let tag = read_u32(&mut buf, "tag")?;
            match tag {
                TAG_COMPARATOR => {
                    let name = read_bytes(&mut buf, "comparator name")?;
                    edit.comparator = Some(
                        String::from_utf8(name)
                            .map_err(|_| Error::Corruption("comparator name not utf-8".into()))?,
                    );
                }
                TAG_LOG_NUMBER => edit.log_number = Some(read_u64(&mut buf, "log number")?),
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(read_u64(&mut buf, "next file number")?)
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(read_u64(&mut buf, "last sequence")?)
                }
                TAG_COMPACT_POINTER => {
                    let level = read_u32(&mut buf, "compact pointer level")? as usize;
                    let key = read_bytes(&mut buf, "compact pointer key")?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = read_u32(&mut buf, "deleted file level")? as usize;
                    let number = read_u64(&mut buf, "deleted file number")?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = read_u32(&mut buf, "new file level")? as usize;
                    let number = read_u64(&mut buf, "new file number")?;
                    let size = read_u64(&mut buf, "new file size")?;
                    let smallest = read_bytes(&mut buf, "new file smallest key")?;
                    let largest = read_bytes(&mut buf, "new file largest key")?;
                    edit.new_files
                        .push((level, FileMetaData::new(number, size, smallest, largest)));
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag {other}"
                    )))
                }
            }
        }
        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta(number: u64) -> FileMetaData {
        FileMetaData::new(number, 4096, b"aaa-key".to_vec(), b"zzz-key".to_vec())
    }

    fn roundtrip(edit: &VersionEdit) -> VersionEdit {
        let mut buf = Vec::new();
        edit.encode_to(&mut buf);
        VersionEdit::decode_from(&buf).expect("decode failed")
    }

    #[test]
    fn test_empty_edit_roundtrip() {
        let edit = VersionEdit::new();
        let decoded = roundtrip(&edit);
        assert!(decoded.comparator.is_none());
        assert!(decoded.new_files.is_empty());
        assert!(decoded.deleted_files.is_empty());
    }

    #[test]
    fn test_full_edit_roundtrip() {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("cinderdb.BytewiseComparator");
        edit.set_log_number(12);
        edit.set_next_file_number(99);
        edit.set_last_sequence(123456789);
        edit.set_compact_pointer(2, b"pointer-key");
        edit.delete_file(1, 5);
        edit.delete_file(2, 6);
        edit.add_file(3, sample_meta(7));

        let decoded = roundtrip(&edit);
        assert_eq!(
            decoded.comparator.as_deref(),
            Some("cinderdb.BytewiseComparator")
        );
        assert_eq!(decoded.log_number, Some(12));
        assert_eq!(decoded.next_file_number, Some(99));
        assert_eq!(decoded.last_sequence, Some(123456789));
        assert_eq!(decoded.compact_pointers, vec![(2, b"pointer-key".to_vec())]);
        assert_eq!(decoded.deleted_files, vec![(1, 5), (2, 6)]);
        assert_eq!(decoded.new_files.len(), 1);
        let (level, meta) = &decoded.new_files[0];
        assert_eq!(*level, 3);
        assert_eq!(meta.number, 7);
        assert_eq!(meta.size, 4096);
        assert_eq!(meta.smallest, b"aaa-key");
        assert_eq!(meta.largest, b"zzz-key");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = Vec::new();
        encode_varint32(&mut buf, 999);
        assert!(matches!(
            VersionEdit::decode_from(&buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_truncated_edit_rejected() {
        let mut edit = VersionEdit::new();
        edit.add_file(0, sample_meta(1));
        let mut buf = Vec::new();
        edit.encode_to(&mut buf);
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            VersionEdit::decode_from(&buf),
            Err(Error::Corruption(_))
        ));
    }
}
