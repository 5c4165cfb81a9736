//! # docsaga - All-or-nothing batches over a single-document-atomic store
//!
//! docsaga runs a sequence of saves, updates and removes across any number
//! of documents and collections as one unit. The store underneath only
//! guarantees that a single document write is atomic; docsaga builds the
//! rest out of a durable step log and compensation.
//!
//! ## Architecture
//!
//! - **Task**: queues steps and runs them strictly in order
//! - **Step log**: one record per running task, written before any step runs;
//!   each step's pre-image is stored in it right before the step mutates
//! - **Roller**: undoes completed steps last-to-first from their pre-images,
//!   both when a step fails and when recovering after a crash
//! - **Key codec**: escapes `$`-prefixed and dotted keys so user payloads can
//!   live inside the step log as plain data
//! - **Backends**: a direct backend over raw collections and a mapped one
//!   that validates documents against registered models
//! - **Store**: the [`Store`] contract, implemented by [`Database`], which is
//!   in memory or journaled to disk
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use docsaga::{Engine, ExecutionMode, Options};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), docsaga::Error> {
//! let engine = Engine::open("./data", Options::default())?;
//!
//! // Settle anything a previous process left half done
//! engine.recover()?;
//!
//! let mut task = engine.task();
//! task.save("users", json!({"name": "X"}))?
//!     .update("counters", json!({"_id": "users"}), json!({"$inc": {"n": 1}}))?;
//! let results = task.run(ExecutionMode::Direct)?;
//! println!("Saved: {:?}", results[0].id());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod backend;
pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod model;
pub mod roller;
pub mod step;
pub mod steplog;
pub mod store;
pub mod task;

// Re-exports
pub use backend::{ExecutionMode, StepResult};
pub use config::Options;
pub use document::{Document, HasCollectionName, HasIdentity, ObjectId, PersistedDocument, Record};
pub use error::{Error, Result};
pub use model::{FieldKind, Model, Schema};
pub use roller::Roller;
pub use step::{StepKind, StepState, UpdateOptions};
pub use store::{Database, Store, UpdateOutcome};
pub use task::Task;

use std::path::Path;
use std::sync::Arc;

use model::ModelRegistry;
use steplog::StepLog;

/// The context every task runs in.
///
/// An engine owns the store handle, the registered models and the options.
/// Tasks and rollers borrow it, so nothing is shared through globals and
/// several engines can run side by side.
///
/// # Thread Safety
///
/// `Engine` is `Send + Sync` and can be shared with `Arc<Engine>`. Each
/// thread builds its own [`Task`]. Tasks touching the same documents are not
/// isolated from each other.
pub struct Engine {
    /// Store the tasks and the step log write to
    store: Arc<dyn Store>,

    /// Models for the mapped backend
    models: ModelRegistry,

    /// Configuration options
    options: Options,
}

impl Engine {
    /// Creates an engine over an existing store handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn new(store: Arc<dyn Store>, options: Options) -> Result<Self> {
        options.validate()?;
        Ok(Self { store, models: ModelRegistry::new(), options })
    }

    /// Creates an engine over a fresh in-memory [`Database`].
    pub fn in_memory(options: Options) -> Result<Self> {
        Self::new(Arc::new(Database::in_memory()), options)
    }

    /// Opens a durable [`Database`] at `path` and creates an engine over it.
    ///
    /// Call [`recover`](Self::recover) afterwards, once the models are
    /// registered, to settle tasks a previous process left behind.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        options.validate()?;
        let database = Database::open(path, &options)?;
        Self::new(Arc::new(database), options)
    }

    /// Starts an empty task.
    pub fn task(&self) -> Task<'_> {
        Task::new(self)
    }

    /// Returns a roller over this engine's step log.
    pub fn roller(&self) -> Roller<'_> {
        Roller::new(self.store.as_ref(), &self.models, &self.options.log_collection)
    }

    /// Rolls back every task left in the step log. Returns how many were settled.
    ///
    /// Meant to run once at start-up, before new tasks are submitted.
    pub fn recover(&self) -> Result<usize> {
        self.roller().roll_all()
    }

    /// Number of task records currently in the step log.
    pub fn pending_tasks(&self) -> Result<usize> {
        Ok(StepLog::new(self.store.as_ref(), &self.options.log_collection).load_all()?.len())
    }

    /// Registers `schema` for the model `name`, stored in the collection of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is already registered or has already been
    /// used by the mapped backend.
    pub fn init_model(&self, name: &str, schema: Schema) -> Result<Arc<Model>> {
        self.models.init_model(name, schema)
    }

    /// Registers a model.
    pub fn register_model(&self, model: Model) -> Result<Arc<Model>> {
        self.models.register(model)
    }

    /// The store handle.
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// The registered models.
    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// The engine's options.
    pub fn options(&self) -> &Options {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_engine_rejects_bad_options() {
        assert!(Engine::in_memory(Options::default().log_collection("")).is_err());
        assert!(Engine::in_memory(Options::default()).is_ok());
    }

    #[test]
    fn test_engine_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }

    #[test]
    fn test_engine_open_and_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let engine = Engine::open(temp_dir.path(), Options::default()).unwrap();
            let mut task = engine.task();
            task.save("users", json!({"_id": 1, "name": "X"})).unwrap();
            task.run(ExecutionMode::Direct).unwrap();
        }

        let engine = Engine::open(temp_dir.path(), Options::default()).unwrap();
        assert_eq!(engine.recover().unwrap(), 0);
        assert_eq!(engine.store().count("users", &Document::new()).unwrap(), 1);
        assert_eq!(engine.pending_tasks().unwrap(), 0);
    }

    #[test]
    fn test_init_model_twice_fails() {
        let engine = Engine::in_memory(Options::default()).unwrap();
        engine.init_model("cars", Schema::new()).unwrap();
        assert!(engine.init_model("cars", Schema::new()).is_err());
        assert!(engine.models().contains("cars"));
    }
}
