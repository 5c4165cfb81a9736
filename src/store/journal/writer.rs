//! Journal writer.

use super::record::{Record, RecordType, MAX_FRAGMENT_SIZE};
use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Appends framed entries to a journal file.
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    file_size: u64,
}

impl JournalWriter {
    /// Opens the journal file in append mode, creating it if it doesn't exist.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_size = file.metadata()?.len();

        Ok(Self { path, writer: BufWriter::new(file), file_size })
    }

    /// Appends one entry, fragmenting it when it exceeds [`MAX_FRAGMENT_SIZE`].
    pub fn append(&mut self, entry: &[u8]) -> Result<()> {
        if entry.is_empty() {
            return Ok(());
        }

        let chunks: Vec<&[u8]> = entry.chunks(MAX_FRAGMENT_SIZE).collect();
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let record_type = match (i, last) {
                (_, 0) => RecordType::Full,
                (0, _) => RecordType::First,
                (i, last) if i == last => RecordType::Last,
                _ => RecordType::Middle,
            };

            let encoded = Record::new(record_type, chunk.to_vec()).encode();
            self.writer.write_all(&encoded)?;
            self.file_size += encoded.len() as u64;
        }

        Ok(())
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Flushes buffered records without fsync.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Get the current file size
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Get the path to the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_append_small_entry() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut writer = JournalWriter::new(temp_file.path()).unwrap();

        writer.append(b"entry").unwrap();
        writer.sync().unwrap();

        assert_eq!(writer.file_size(), (super::super::record::HEADER_SIZE + 5) as u64);
    }

    #[test]
    fn test_append_large_entry_fragments() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut writer = JournalWriter::new(temp_file.path()).unwrap();

        let data = vec![0xAB; MAX_FRAGMENT_SIZE * 2 + 100];
        writer.append(&data).unwrap();
        writer.sync().unwrap();

        let headers = 3 * super::super::record::HEADER_SIZE;
        assert_eq!(writer.file_size(), (data.len() + headers) as u64);
    }

    #[test]
    fn test_empty_append() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut writer = JournalWriter::new(temp_file.path()).unwrap();

        writer.append(&[]).unwrap();
        assert_eq!(writer.file_size(), 0);
    }

    #[test]
    fn test_writer_reopen_appends() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        {
            let mut writer = JournalWriter::new(&path).unwrap();
            writer.append(b"first").unwrap();
            writer.sync().unwrap();
        }

        let mut writer = JournalWriter::new(&path).unwrap();
        let initial_size = writer.file_size();
        assert!(initial_size > 0);
        writer.append(b"second").unwrap();
        writer.sync().unwrap();
        assert!(writer.file_size() > initial_size);
    }
}
