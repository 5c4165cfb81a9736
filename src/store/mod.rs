//! The document store that tasks run against.
//!
//! [`Store`] is the handle contract the task engine needs: insert, filtered
//! find, filtered update and replace, filtered delete. Each call writes
//! documents one at a time; the only atomicity a store promises is that of a
//! single-document write. [`Database`] is the implementation shipped with the
//! crate, in memory or backed by a [`journal`] on disk.

pub mod journal;
pub mod query;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Options;
use crate::document::{ensure_identity, Document, ID_FIELD};
use crate::error::{Error, Result};
use journal::{Journal, JournalEntry, JOURNAL_FILE};
use query::{apply_update, matches, validate_collection_name, validate_document, values_equal};

/// Counts reported by an update or replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    /// Documents selected by the filter.
    pub matched: u64,
    /// Documents whose content actually changed.
    pub modified: u64,
}

/// A handle on a document store.
///
/// Implementations must be safe to share between threads. Writes touching
/// several documents are applied one document at a time.
pub trait Store: Send + Sync {
    /// Inserts a document, assigning an identity if it has none, and returns
    /// the stored document.
    fn insert_one(&self, collection: &str, document: Document) -> Result<Document>;

    /// Returns documents matching `filter` in insertion order, at most `limit` of them.
    fn find(&self, collection: &str, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>>;

    /// Returns the first document matching `filter`.
    fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        Ok(self.find(collection, filter, Some(1))?.into_iter().next())
    }

    /// Applies an update document to the first match, or every match with `multi`.
    fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        multi: bool,
    ) -> Result<UpdateOutcome>;

    /// Replaces the first match with `document`, keeping the match's identity.
    fn replace_one(&self, collection: &str, filter: &Document, document: Document) -> Result<UpdateOutcome>;

    /// Deletes the first match, or every match with `multi`. Returns the number deleted.
    fn delete(&self, collection: &str, filter: &Document, multi: bool) -> Result<u64>;

    /// Counts documents matching `filter`.
    fn count(&self, collection: &str, filter: &Document) -> Result<u64> {
        Ok(self.find(collection, filter, None)?.len() as u64)
    }

    /// Names of the collections holding at least one document, sorted.
    fn collection_names(&self) -> Result<Vec<String>>;

    /// Removes a collection. Returns false if it did not exist.
    fn drop_collection(&self, collection: &str) -> Result<bool>;
}

/// Builds the filter `{_id: id}`.
pub fn id_filter(id: Value) -> Document {
    let mut filter = Document::new();
    filter.insert(ID_FIELD.to_string(), id);
    filter
}

/// A document database held in memory, optionally journaled to disk.
///
/// # Thread Safety
///
/// `Database` can be shared across threads with `Arc<Database>`. Every write
/// holds the collection lock while it is journaled and applied, so readers
/// only ever see documents whose journal entry is already durable.
///
/// # Example
///
/// ```rust
/// use docsaga::store::{Database, Store};
/// use serde_json::json;
///
/// # fn main() -> docsaga::Result<()> {
/// let db = Database::in_memory();
/// let doc = json!({"name": "X"}).as_object().cloned().unwrap_or_default();
/// let stored = db.insert_one("users", doc)?;
/// assert!(stored.contains_key("_id"));
/// assert_eq!(db.count("users", &Default::default())?, 1);
/// # Ok(())
/// # }
/// ```
pub struct Database {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    journal: Option<Mutex<Journal>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Creates an empty, non-durable database.
    pub fn in_memory() -> Self {
        Self { collections: RwLock::new(HashMap::new()), journal: None, path: None }
    }

    /// Opens a durable database in `path`, replaying its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the directory is missing and `create_if_missing` is off
    /// - the directory exists and `error_if_exists` is on
    /// - the journal is corrupted before its final record
    pub fn open<P: AsRef<Path>>(path: P, options: &Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            if options.create_if_missing {
                std::fs::create_dir_all(&path)?;
            } else {
                return Err(Error::NotFound(format!("Database directory does not exist: {:?}", path)));
            }
        } else if options.error_if_exists {
            return Err(Error::InvalidState(format!("Database already exists: {:?}", path)));
        }

        let journal_path = path.join(JOURNAL_FILE);
        let entries = Journal::recover(&journal_path)?;

        let mut collections = HashMap::new();
        let replayed = entries.len();
        for entry in entries {
            replay(&mut collections, entry)?;
        }
        if replayed > 0 {
            log::info!("Replayed {} journal entries from {:?}", replayed, journal_path);
        }

        let journal = Journal::open(&journal_path, options.sync_journal)?;

        Ok(Self {
            collections: RwLock::new(collections),
            journal: Some(Mutex::new(journal)),
            path: Some(path),
        })
    }

    /// Directory of a durable database.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Rewrites the journal as one insert per live document.
    ///
    /// Does nothing for an in-memory database.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let collections = self.collections.write();

        let mut names: Vec<&String> = collections.keys().collect();
        names.sort();
        let entries: Vec<JournalEntry> = names
            .into_iter()
            .flat_map(|name| {
                collections[name].iter().map(move |document| JournalEntry::Insert {
                    collection: name.clone(),
                    document: document.clone(),
                })
            })
            .collect();

        journal.lock().rewrite(&entries)?;
        log::info!("Checkpointed {} documents", entries.len());
        Ok(())
    }

    /// Size in bytes of the journal, 0 for an in-memory database.
    pub fn journal_size(&self) -> u64 {
        self.journal.as_ref().map(|j| j.lock().size()).unwrap_or(0)
    }

    fn log_write(&self, entry: JournalEntry) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.lock().append(&entry),
            None => Ok(()),
        }
    }

    fn matching_positions(docs: &[Document], filter: &Document, multi: bool) -> Result<Vec<usize>> {
        let mut positions = Vec::new();
        for (pos, document) in docs.iter().enumerate() {
            if matches(document, filter)? {
                positions.push(pos);
                if !multi {
                    break;
                }
            }
        }
        Ok(positions)
    }
}

fn replay(collections: &mut HashMap<String, Vec<Document>>, entry: JournalEntry) -> Result<()> {
    match entry {
        JournalEntry::Insert { collection, document } => {
            collections.entry(collection).or_default().push(document);
        }
        JournalEntry::Replace { collection, document } => {
            let id = document.get(ID_FIELD).cloned().unwrap_or(Value::Null);
            let docs = collections.entry(collection.clone()).or_default();
            match docs.iter_mut().find(|d| d.get(ID_FIELD).is_some_and(|v| values_equal(v, &id))) {
                Some(slot) => *slot = document,
                None => {
                    return Err(Error::corruption(format!(
                        "journal replaces missing document {} in {}",
                        id, collection
                    )))
                }
            }
        }
        JournalEntry::Delete { collection, id } => {
            if let Some(docs) = collections.get_mut(&collection) {
                docs.retain(|d| !d.get(ID_FIELD).is_some_and(|v| values_equal(v, &id)));
            }
        }
        JournalEntry::DropCollection { collection } => {
            collections.remove(&collection);
        }
    }
    Ok(())
}

impl Store for Database {
    fn insert_one(&self, collection: &str, mut document: Document) -> Result<Document> {
        validate_collection_name(collection)?;
        let id = ensure_identity(&mut document);
        validate_document(&document)?;

        let mut collections = self.collections.write();
        let docs = collections.get(collection).map(Vec::as_slice).unwrap_or_default();
        if docs.iter().any(|d| d.get(ID_FIELD).is_some_and(|v| values_equal(v, &id))) {
            return Err(Error::DuplicateKey(format!("{} already holds _id {}", collection, id)));
        }

        self.log_write(JournalEntry::Insert {
            collection: collection.to_string(),
            document: document.clone(),
        })?;
        collections.entry(collection.to_string()).or_default().push(document.clone());
        Ok(document)
    }

    fn find(&self, collection: &str, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>> {
        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let limit = limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        for document in docs {
            if found.len() >= limit {
                break;
            }
            if matches(document, filter)? {
                found.push(document.clone());
            }
        }
        Ok(found)
    }

    fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        multi: bool,
    ) -> Result<UpdateOutcome> {
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(UpdateOutcome::default());
        };

        let mut outcome = UpdateOutcome::default();
        for pos in Self::matching_positions(docs, filter, multi)? {
            outcome.matched += 1;

            let mut updated = docs[pos].clone();
            if !apply_update(&mut updated, update)? {
                continue;
            }
            validate_document(&updated)?;

            self.log_write(JournalEntry::Replace {
                collection: collection.to_string(),
                document: updated.clone(),
            })?;
            docs[pos] = updated;
            outcome.modified += 1;
        }
        Ok(outcome)
    }

    fn replace_one(&self, collection: &str, filter: &Document, mut document: Document) -> Result<UpdateOutcome> {
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(UpdateOutcome::default());
        };
        let Some(pos) = Self::matching_positions(docs, filter, false)?.into_iter().next() else {
            return Ok(UpdateOutcome::default());
        };

        let id = docs[pos].get(ID_FIELD).cloned().unwrap_or(Value::Null);
        if let Some(given) = document.get(ID_FIELD) {
            if !values_equal(given, &id) {
                return Err(Error::invalid_document(
                    "replacement would modify the immutable field '_id'",
                ));
            }
        }
        document.insert(ID_FIELD.to_string(), id);
        validate_document(&document)?;

        if values_equal(&Value::Object(docs[pos].clone()), &Value::Object(document.clone())) {
            return Ok(UpdateOutcome { matched: 1, modified: 0 });
        }

        self.log_write(JournalEntry::Replace {
            collection: collection.to_string(),
            document: document.clone(),
        })?;
        docs[pos] = document;
        Ok(UpdateOutcome { matched: 1, modified: 1 })
    }

    fn delete(&self, collection: &str, filter: &Document, multi: bool) -> Result<u64> {
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let positions = Self::matching_positions(docs, filter, multi)?;
        let mut deleted = 0;
        // Highest position first so earlier positions stay valid.
        for pos in positions.into_iter().rev() {
            let id = docs[pos].get(ID_FIELD).cloned().unwrap_or(Value::Null);
            self.log_write(JournalEntry::Delete { collection: collection.to_string(), id })?;
            docs.remove(pos);
            deleted += 1;
        }
        Ok(deleted)
    }

    fn collection_names(&self) -> Result<Vec<String>> {
        let collections = self.collections.read();
        let mut names: Vec<String> =
            collections.iter().filter(|(_, docs)| !docs.is_empty()).map(|(name, _)| name.clone()).collect();
        names.sort();
        Ok(names)
    }

    fn drop_collection(&self, collection: &str) -> Result<bool> {
        let mut collections = self.collections.write();
        if !collections.contains_key(collection) {
            return Ok(false);
        }
        self.log_write(JournalEntry::DropCollection { collection: collection.to_string() })?;
        collections.remove(collection);
        Ok(true)
    }
}
