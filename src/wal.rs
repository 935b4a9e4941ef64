//! Framed record log, used for both the write-ahead log and the manifest.
//!
//! The log partitions its byte stream into 32 KiB blocks so that a reader
//! can resynchronise at a block boundary after corruption. Each physical
//! record carries a 7-byte header:
//!
//! ```text
//! +-------------+------------+---------+----------------+
//! | crc32c: u32 | length:u16 | type:u8 | payload bytes  |
//! +-------------+------------+---------+----------------+
//! ```
//!
//! The checksum is the masked CRC32C of the type byte followed by the
//! payload. A logical record that does not fit in the current block is
//! split into `First`/`Middle`/`Last` fragments; records that fit whole
//! use `Full`. A block tail of fewer than 7 bytes is zero-filled and
//! skipped by readers.
//!
//! Writers append without fsync; durability is selected per write by the
//! caller invoking [`LogWriter::sync`].

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::encoding::masked_crc;
use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 7;

const FULL: u8 = 1;
const FIRST: u8 = 2;
const MIDDLE: u8 = 3;
const LAST: u8 = 4;
const MAX_RECORD_TYPE: u8 = LAST;

pub struct LogWriter {
    file: File,
    writer: BufWriter<File>,
    block_offset: usize,
}

impl LogWriter {
    pub fn new(file: File) -> Result<Self> {
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            block_offset: 0,
        })
    }

    /// Resumes appending to a log whose current length is `initial_length`.
    pub fn with_offset(file: File, initial_length: u64) -> Result<Self> {
        let mut writer = Self::new(file)?;
        writer.block_offset = (initial_length % BLOCK_SIZE as u64) as usize;
        Ok(writer)
    }

    /// Appends one logical record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mut left = payload;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Zero-fill the block tail; readers skip it.
                if leftover > 0 {
                    self.writer.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(available);
            let end = fragment_len == left.len();

            let record_type = match (begin, end) {
                (true, true) => FULL,
                (true, false) => FIRST,
                (false, true) => LAST,
                (false, false) => MIDDLE,
            };

            self.emit_physical_record(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if end {
                break;
            }
        }
        Ok(())
    }

    fn emit_physical_record(&mut self, record_type: u8, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let mut header = [0u8; HEADER_SIZE];
        let crc = masked_crc(&[&[record_type], payload]);
        LittleEndian::write_u32(&mut header[0..4], crc);
        LittleEndian::write_u16(&mut header[4..6], payload.len() as u16);
        header[6] = record_type;

        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sequential reader over a record log. In non-paranoid mode corrupt
/// records are skipped and reading resumes at the next block boundary; in
/// paranoid mode corruption is surfaced as an error.
pub struct LogReader {
    reader: BufReader<File>,
    paranoid: bool,
    buf: Vec<u8>,
    buf_pos: usize,
    eof: bool,
    /// Bytes skipped over corruption so far, for diagnostics.
    dropped_bytes: u64,
}

impl LogReader {
    pub fn new(file: File, paranoid: bool) -> Self {
        Self {
            reader: BufReader::new(file),
            paranoid,
            buf: Vec::new(),
            buf_pos: 0,
            eof: false,
            dropped_bytes: 0,
        }
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Reads the next logical record, reassembling fragments. Returns
    /// Ok(None) at end of log.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            let (record_type, payload) = match self.read_physical_record()? {
                Some(r) => r,
                None => {
                    if in_fragmented_record {
                        // Torn tail: the writer died mid-record. Drop it.
                        self.report_drop(scratch.len() as u64, "partial record at end of log")?;
                    }
                    return Ok(None);
                }
            };

            match record_type {
                FULL => {
                    if in_fragmented_record {
                        self.report_drop(scratch.len() as u64, "partial record without end")?;
                        scratch.clear();
                    }
                    return Ok(Some(payload));
                }
                FIRST => {
                    if in_fragmented_record {
                        self.report_drop(scratch.len() as u64, "partial record without end")?;
                        scratch.clear();
                    }
                    scratch = payload;
                    in_fragmented_record = true;
                }
                MIDDLE => {
                    if !in_fragmented_record {
                        self.report_drop(payload.len() as u64, "missing start of fragmented record")?;
                    } else {
                        scratch.extend_from_slice(&payload);
                    }
                }
                LAST => {
                    if !in_fragmented_record {
                        self.report_drop(payload.len() as u64, "missing start of fragmented record")?;
                    } else {
                        scratch.extend_from_slice(&payload);
                        return Ok(Some(scratch));
                    }
                }
                _ => unreachable!("read_physical_record validates the type"),
            }
        }
    }

    /// Returns the next valid physical record, resynchronising past
    /// corruption unless paranoid.
    fn read_physical_record(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        loop {
            if self.buf.len() - self.buf_pos < HEADER_SIZE {
                if !self.refill_block()? {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.buf[self.buf_pos..self.buf_pos + HEADER_SIZE];
            let expected_crc = LittleEndian::read_u32(&header[0..4]);
            let length = LittleEndian::read_u16(&header[4..6]) as usize;
            let record_type = header[6];

            // A zero-filled block tail parses as type 0, length 0.
            if record_type == 0 && length == 0 {
                self.buf_pos = self.buf.len();
                continue;
            }

            if record_type == 0 || record_type > MAX_RECORD_TYPE {
                self.drop_block(format!("unknown record type {record_type}"))?;
                continue;
            }

            if self.buf_pos + HEADER_SIZE + length > self.buf.len() {
                self.drop_block("record length overflows block".to_string())?;
                continue;
            }

            let payload_start = self.buf_pos + HEADER_SIZE;
            let payload = &self.buf[payload_start..payload_start + length];
            let actual_crc = masked_crc(&[&[record_type], payload]);
            if actual_crc != expected_crc {
                self.drop_block("checksum mismatch".to_string())?;
                continue;
            }

            let payload = payload.to_vec();
            self.buf_pos = payload_start + length;
            return Ok(Some((record_type, payload)));
        }
    }

    /// Reads the next block from the file. Returns false at EOF.
    fn refill_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        self.buf.clear();
        self.buf.resize(BLOCK_SIZE, 0);
        self.buf_pos = 0;

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.reader.read(&mut self.buf[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.buf.truncate(filled);
        Ok(filled >= HEADER_SIZE)
    }

    /// Abandons the rest of the current block after corruption.
    fn drop_block(&mut self, reason: String) -> Result<()> {
        let dropped = (self.buf.len() - self.buf_pos) as u64;
        self.buf_pos = self.buf.len();
        self.report_drop(dropped, &reason)
    }

    fn report_drop(&mut self, bytes: u64, reason: &str) -> Result<()> {
        self.dropped_bytes += bytes;
        if self.paranoid {
            return Err(Error::Corruption(format!("log record dropped: {reason}")));
        }
        tracing::warn!(bytes, reason, "skipping corrupt log record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;
    use std::io::{Seek, SeekFrom, Write as _};

    fn write_records(records: &[Vec<u8>]) -> NamedTempFile {
        let tmp = NamedTempFile::new().expect("failed to create temp file");
        let file = tmp.reopen().expect("failed to open temp file");
        let mut writer = LogWriter::new(file).unwrap();
        for record in records {
            writer.add_record(record).expect("append failed");
        }
        writer.flush().unwrap();
        tmp
    }

    fn read_all(tmp: &NamedTempFile, paranoid: bool) -> (Vec<Vec<u8>>, Result<()>) {
        let file = tmp.reopen().unwrap();
        let mut reader = LogReader::new(file, paranoid);
        let mut records = Vec::new();
        loop {
            match reader.read_record() {
                Ok(Some(r)) => records.push(r),
                Ok(None) => return (records, Ok(())),
                Err(e) => return (records, Err(e)),
            }
        }
    }

    #[test]
    fn test_roundtrip_small_records() {
        let records = vec![b"alpha".to_vec(), b"beta".to_vec(), Vec::new(), b"d".to_vec()];
        let tmp = write_records(&records);
        let (read, status) = read_all(&tmp, true);
        status.unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn test_record_spanning_blocks() {
        // Large enough to need First/Middle/Last fragments.
        let big = vec![0xabu8; BLOCK_SIZE * 3 + 1234];
        let records = vec![b"head".to_vec(), big.clone(), b"tail".to_vec()];
        let tmp = write_records(&records);
        let (read, status) = read_all(&tmp, true);
        status.unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[1], big);
        assert_eq!(read[2], b"tail");
    }

    #[test]
    fn test_block_tail_padding() {
        // A record sized so the next header cannot fit in the block tail.
        let first = vec![1u8; BLOCK_SIZE - HEADER_SIZE - 3];
        let records = vec![first.clone(), b"after-pad".to_vec()];
        let tmp = write_records(&records);
        let (read, status) = read_all(&tmp, true);
        status.unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn test_corruption_skips_to_next_block() {
        let records = vec![vec![7u8; 100], vec![8u8; BLOCK_SIZE * 2]];
        let tmp = write_records(&records);

        // Corrupt the first record's payload.
        let mut file = tmp.reopen().unwrap();
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 10)).unwrap();
        file.write_all(b"XXXX").unwrap();
        file.sync_all().unwrap();

        // Non-paranoid: first record dropped, second survives because it
        // starts in a later block... its First fragment shares block 0, so
        // everything in block 0 is lost and resync recovers nothing of
        // record 2 either; the reader must simply not error.
        let (read, status) = read_all(&tmp, false);
        status.unwrap();
        assert!(read.len() <= 1);

        // Paranoid: surfaced as corruption.
        let (_, status) = read_all(&tmp, true);
        assert!(matches!(status, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_corruption_preserves_later_blocks() {
        // Three single-block records, each in its own block region: pad the
        // first two out with large payloads.
        let a = vec![1u8; BLOCK_SIZE / 2];
        let b = vec![2u8; BLOCK_SIZE / 2];
        let c = b"survivor".to_vec();
        let tmp = write_records(&[a, b, c.clone()]);

        // Clobber the first block entirely.
        let mut file = tmp.reopen().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&vec![0xff; 64]).unwrap();
        file.sync_all().unwrap();

        let (read, status) = read_all(&tmp, false);
        status.unwrap();
        assert!(read.contains(&c), "record in a clean block must survive");
    }

    #[test]
    fn test_torn_tail_dropped() {
        let records = vec![b"complete".to_vec()];
        let tmp = write_records(&records);

        // Append a header promising more bytes than exist.
        let mut file = tmp.reopen().unwrap();
        file.seek(SeekFrom::End(0)).unwrap();
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], 0xdeadbeef);
        LittleEndian::write_u16(&mut header[4..6], 5000);
        header[6] = FULL;
        file.write_all(&header).unwrap();
        file.write_all(b"short").unwrap();
        file.sync_all().unwrap();

        let (read, status) = read_all(&tmp, false);
        status.unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn test_resumed_writer_keeps_alignment() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let file = tmp.reopen().unwrap();
            let mut writer = LogWriter::new(file).unwrap();
            writer.add_record(b"one").unwrap();
            writer.flush().unwrap();
        }
        {
            let mut file = tmp.reopen().unwrap();
            let len = file.metadata().unwrap().len();
            file.seek(SeekFrom::End(0)).unwrap();
            let mut writer = LogWriter::with_offset(file, len).unwrap();
            writer.add_record(b"two").unwrap();
            writer.flush().unwrap();
        }
        let (read, status) = read_all(&tmp, true);
        status.unwrap();
        assert_eq!(read, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
