//! Journal reader used to replay a store on open.

use super::record::{Record, RecordType, HEADER_SIZE};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Reads entries back from a journal file.
///
/// A record cut short at the end of the file, or a damaged final record, is
/// what a crash in the middle of an append leaves behind. The reader treats
/// it as end of input and remembers why in [`torn_tail`](Self::torn_tail).
/// Damage anywhere before the final record is reported as corruption.
pub struct JournalReader {
    reader: BufReader<File>,
    file_len: u64,
    position: u64,
    valid_len: u64,
    torn_tail: Option<String>,
}

enum Frame {
    Record(Record),
    End,
    Torn(String),
}

impl JournalReader {
    /// Open a journal file for reading
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        Ok(Self { reader: BufReader::new(file), file_len, position: 0, valid_len: 0, torn_tail: None })
    }

    /// Reads the next complete entry, reassembling fragments.
    ///
    /// Returns `None` at the end of the file or at a torn tail.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Option<Vec<u8>> = None;

        loop {
            let record = match self.read_frame()? {
                Frame::Record(record) => record,
                Frame::End => {
                    if assembled.is_some() {
                        self.torn_tail = Some("entry ends before its last fragment".to_string());
                    }
                    return Ok(None);
                }
                Frame::Torn(reason) => {
                    self.torn_tail = Some(reason);
                    return Ok(None);
                }
            };

            match (record.record_type, assembled.as_mut()) {
                (RecordType::Full, None) => {
                    self.valid_len = self.position;
                    return Ok(Some(record.payload));
                }
                (RecordType::First, None) => assembled = Some(record.payload),
                (RecordType::Middle, Some(buf)) => buf.extend_from_slice(&record.payload),
                (RecordType::Last, Some(buf)) => {
                    buf.extend_from_slice(&record.payload);
                    self.valid_len = self.position;
                    return Ok(assembled);
                }
                (record_type, _) => {
                    return Err(Error::corruption(format!(
                        "Unexpected {:?} journal record at offset {}",
                        record_type, self.position
                    )));
                }
            }
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let remaining = self.file_len - self.position;
        if remaining == 0 {
            return Ok(Frame::End);
        }
        if remaining < HEADER_SIZE as u64 {
            return Ok(Frame::Torn(format!("{} stray bytes after the last record", remaining)));
        }

        let mut header = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header)?;

        let length = Record::payload_len(&header);
        let total_size = (HEADER_SIZE + length) as u64;
        if total_size > remaining {
            return Ok(Frame::Torn(format!(
                "record at offset {} needs {} bytes, {} left",
                self.position, total_size, remaining
            )));
        }

        let mut buffer = vec![0u8; HEADER_SIZE + length];
        buffer[..HEADER_SIZE].copy_from_slice(&header);
        self.reader.read_exact(&mut buffer[HEADER_SIZE..])?;

        let start = self.position;
        self.position += total_size;
        let is_last = self.position == self.file_len;

        match Record::decode(&buffer) {
            Ok(record) => Ok(Frame::Record(record)),
            Err(e @ (Error::ChecksumMismatch { .. } | Error::Corruption(_))) if is_last => {
                Ok(Frame::Torn(format!("final record at offset {}: {}", start, e)))
            }
            Err(Error::ChecksumMismatch { expected, actual }) => Err(Error::corruption(format!(
                "journal record at offset {} fails its checksum ({:#x} != {:#x})",
                start, actual, expected
            ))),
            Err(e) => Err(e),
        }
    }

    /// Reads every entry up to the end of the file or a torn tail.
    pub fn recover_all(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.read_next()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Why reading stopped early, if it did.
    pub fn torn_tail(&self) -> Option<&str> {
        self.torn_tail.as_deref()
    }

    /// Length of the prefix made of complete entries.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Get the current read position
    pub fn position(&self) -> u64 {
        self.position
    }
}
