//! Configuration options for docsaga.

use crate::backend::ExecutionMode;
use crate::store::query::validate_collection_name;

/// Default collection holding step log records.
pub const DEFAULT_LOG_COLLECTION: &str = "__docsaga_tasks";

/// Configuration options for an [`Engine`](crate::Engine) and the
/// [`Database`](crate::store::Database) it runs against.
#[derive(Debug, Clone)]
pub struct Options {
    /// Collection that holds the step log records of in-flight tasks.
    /// Default: "__docsaga_tasks"
    pub log_collection: String,

    /// Execution mode used by `Task::run_default`.
    /// Default: ExecutionMode::Mapped
    pub default_mode: ExecutionMode,

    /// Create the database directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Error if the database directory already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// Sync every journal append to disk before the write becomes visible.
    /// Disabling trades crash durability for throughput.
    /// Default: true
    pub sync_journal: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_collection: DEFAULT_LOG_COLLECTION.to_string(),
            default_mode: ExecutionMode::default(),
            create_if_missing: true,
            error_if_exists: false,
            sync_journal: true,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the step log collection.
    pub fn log_collection(mut self, name: impl Into<String>) -> Self {
        self.log_collection = name.into();
        self
    }

    /// Sets the execution mode used by `Task::run_default`.
    pub fn default_mode(mut self, mode: ExecutionMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Sets whether to create the database directory if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether opening an existing database directory is an error.
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Enables or disables syncing the journal on every append.
    pub fn sync_journal(mut self, value: bool) -> Self {
        self.sync_journal = value;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        validate_collection_name(&self.log_collection).map_err(|e| {
            crate::Error::invalid_argument(format!("log_collection is not usable: {}", e))
        })
    }
}
