//! Append-only journal behind a durable [`Database`](super::Database).
//!
//! Every single-document write is appended as one [`JournalEntry`] before it
//! becomes visible in memory. Opening a database replays the journal, so a
//! write is either fully present after a crash or not present at all.
//!
//! ## Layout
//!
//! - **Record format**: CRC32-checked frames, see [`record`]
//! - **Fragmentation**: entries above 64 KiB span several frames
//! - **Torn tails**: a partial final frame is dropped and the file truncated
//! - **Checkpoint**: the journal can be rewritten as a snapshot of live documents

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::JournalReader;
pub use record::{Record, RecordType};
pub use writer::JournalWriter;

use crate::document::Document;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// File name of the journal inside a database directory.
pub const JOURNAL_FILE: &str = "journal.log";

/// One durable single-document write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    /// A new document.
    Insert {
        /// Target collection.
        collection: String,
        /// The document, identity included.
        document: Document,
    },
    /// A document replaced by identity.
    Replace {
        /// Target collection.
        collection: String,
        /// The new document, identity included.
        document: Document,
    },
    /// A document deleted by identity.
    Delete {
        /// Target collection.
        collection: String,
        /// Identity of the deleted document.
        id: Value,
    },
    /// A whole collection dropped.
    DropCollection {
        /// The dropped collection.
        collection: String,
    },
}

/// Journal manager that coordinates reading and writing.
pub struct Journal {
    writer: JournalWriter,
    sync: bool,
}

impl Journal {
    /// Opens or creates the journal at `path`.
    pub fn open<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self> {
        Ok(Self { writer: JournalWriter::new(path)?, sync })
    }

    /// Appends an entry, syncing it to disk when configured to.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        self.writer.append(&bytes)?;
        if self.sync {
            self.writer.sync()
        } else {
            self.writer.flush()
        }
    }

    /// Get the current file size
    pub fn size(&self) -> u64 {
        self.writer.file_size()
    }

    /// Get the path to the journal file
    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Reads every entry of the journal at `path`.
    ///
    /// A torn tail left by an interrupted append is truncated away.
    pub fn recover<P: AsRef<Path>>(path: P) -> Result<Vec<JournalEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = JournalReader::new(path)?;
        let raw = reader.recover_all()?;

        if let Some(reason) = reader.torn_tail() {
            log::warn!("Discarding torn journal tail in {:?}: {}", path, reason);
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(reader.valid_len())?;
            file.sync_all()?;
        }

        raw.iter().map(|bytes| Ok(serde_json::from_slice(bytes)?)).collect()
    }

    /// Replaces the journal with `entries`, then reopens it for appending.
    ///
    /// The new journal is written beside the old one and renamed over it, so
    /// a crash leaves either the old or the new file.
    pub fn rewrite(&mut self, entries: &[JournalEntry]) -> Result<()> {
        let path = self.path().to_path_buf();
        let temp_path = temp_path_for(&path);

        if temp_path.exists() {
            std::fs::remove_file(&temp_path)?;
        }

        {
            let mut writer = JournalWriter::new(&temp_path)?;
            for entry in entries {
                writer.append(&serde_json::to_vec(entry)?)?;
            }
            writer.sync()?;
        }

        std::fs::rename(&temp_path, &path)?;
        self.writer = JournalWriter::new(&path)?;
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
