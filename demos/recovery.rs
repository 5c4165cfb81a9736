//! Crash recovery example for docsaga
//!
//! Run it once with `crash`: the process exits in the middle of a task, after
//! the stock was decremented but before the order was written. Run it again
//! without arguments: the unfinished task is found in the step log and rolled
//! back before anything else happens.
//!
//! ```text
//! cargo run --example recovery -- crash
//! cargo run --example recovery
//! ```

use docsaga::{Database, Document, Engine, ExecutionMode, Options, Result, Store, UpdateOutcome};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Exits the process once a number of writes went through.
struct ExitAfter {
    inner: Database,
    writes_left: AtomicUsize,
}

impl ExitAfter {
    fn write(&self) {
        if self.writes_left.fetch_sub(1, Ordering::SeqCst) == 1 {
            println!("Simulating a crash; run again without arguments to recover");
            std::process::exit(1);
        }
    }
}

impl Store for ExitAfter {
    fn insert_one(&self, collection: &str, document: Document) -> Result<Document> {
        let stored = self.inner.insert_one(collection, document)?;
        self.write();
        Ok(stored)
    }

    fn find(&self, collection: &str, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>> {
        self.inner.find(collection, filter, limit)
    }

    fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        multi: bool,
    ) -> Result<UpdateOutcome> {
        let outcome = self.inner.update(collection, filter, update, multi)?;
        self.write();
        Ok(outcome)
    }

    fn replace_one(&self, collection: &str, filter: &Document, document: Document) -> Result<UpdateOutcome> {
        let outcome = self.inner.replace_one(collection, filter, document)?;
        self.write();
        Ok(outcome)
    }

    fn delete(&self, collection: &str, filter: &Document, multi: bool) -> Result<u64> {
        let deleted = self.inner.delete(collection, filter, multi)?;
        self.write();
        Ok(deleted)
    }

    fn collection_names(&self) -> Result<Vec<String>> {
        self.inner.collection_names()
    }

    fn drop_collection(&self, collection: &str) -> Result<bool> {
        self.inner.drop_collection(collection)
    }
}

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init();

    let crash = std::env::args().nth(1).as_deref() == Some("crash");
    let options = Options::default();
    let database = Database::open("./recovery_data", &options)?;
    if database.find_one("stock", &doc(json!({"_id": "widget"})))?.is_none() {
        database.insert_one("stock", doc(json!({"_id": "widget", "count": 10})))?;
    }

    let store: Arc<dyn Store> = if crash {
        // Log record, pre-image, decrement: die right after the decrement
        Arc::new(ExitAfter { inner: database, writes_left: AtomicUsize::new(3) })
    } else {
        Arc::new(database)
    };
    let engine = Engine::new(store, options)?;

    // Settle whatever a previous run left behind
    let settled = engine.recover()?;
    println!("Recovered {} unfinished task(s)", settled);

    let stock = engine.store().find_one("stock", &doc(json!({"_id": "widget"})))?;
    println!("Stock before: {:?}", stock.map(Value::Object));

    let mut task = engine.task();
    task.update("stock", json!({"_id": "widget"}), json!({"$inc": {"count": -1}}))?
        .save("orders", json!({"item": "widget"}))?;
    task.run(ExecutionMode::Direct)?;

    let stock = engine.store().find_one("stock", &doc(json!({"_id": "widget"})))?;
    println!("Stock after: {:?}", stock.map(Value::Object));
    println!("Orders: {}", engine.store().count("orders", &Document::new())?);
    Ok(())
}
