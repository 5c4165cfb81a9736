// Shared helpers for docsaga integration tests

#![allow(dead_code)]

use docsaga::{Document, Error, Result, Store, UpdateOutcome};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Store operations a [`FaultyStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Wraps a store and injects write failures.
///
/// `crash_after(n)` lets `n` more writes through and fails every write after
/// that, which is what a process dying mid-task looks like from the store's
/// side. `fail_on` fails one kind of write on one collection until `heal`.
pub struct FaultyStore {
    inner: Arc<dyn Store>,
    writes_left: AtomicUsize,
    failing: Mutex<Vec<(Op, String)>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self { inner, writes_left: AtomicUsize::new(usize::MAX), failing: Mutex::new(Vec::new()) }
    }

    pub fn crash_after(&self, writes: usize) {
        self.writes_left.store(writes, Ordering::SeqCst);
    }

    pub fn fail_on(&self, op: Op, collection: &str) {
        self.failing.lock().unwrap().push((op, collection.to_string()));
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.writes_left.store(usize::MAX, Ordering::SeqCst);
    }

    fn check(&self, op: Op, collection: &str) -> Result<()> {
        if self.failing.lock().unwrap().iter().any(|(o, c)| *o == op && c == collection) {
            return Err(Error::Io(io::Error::other(format!("injected {:?} failure on {}", op, collection))));
        }
        let granted = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if granted {
            Ok(())
        } else {
            Err(Error::Io(io::Error::other("store is gone")))
        }
    }
}

impl Store for FaultyStore {
    fn insert_one(&self, collection: &str, document: Document) -> Result<Document> {
        self.check(Op::Insert, collection)?;
        self.inner.insert_one(collection, document)
    }

    fn find(&self, collection: &str, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>> {
        self.inner.find(collection, filter, limit)
    }

    fn update(&self, collection: &str, filter: &Document, update: &Document, multi: bool) -> Result<UpdateOutcome> {
        self.check(Op::Update, collection)?;
        self.inner.update(collection, filter, update, multi)
    }

    fn replace_one(&self, collection: &str, filter: &Document, document: Document) -> Result<UpdateOutcome> {
        self.check(Op::Replace, collection)?;
        self.inner.replace_one(collection, filter, document)
    }

    fn delete(&self, collection: &str, filter: &Document, multi: bool) -> Result<u64> {
        self.check(Op::Delete, collection)?;
        self.inner.delete(collection, filter, multi)
    }

    fn collection_names(&self) -> Result<Vec<String>> {
        self.inner.collection_names()
    }

    fn drop_collection(&self, collection: &str) -> Result<bool> {
        self.inner.drop_collection(collection)
    }
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// Every document of `collection`, ordered by identity.
pub fn snapshot(store: &dyn Store, collection: &str) -> Vec<Value> {
    let mut docs: Vec<Value> =
        store.find(collection, &Document::new(), None).unwrap().into_iter().map(Value::Object).collect();
    docs.sort_by_key(|d| d["_id"].to_string());
    docs
}
