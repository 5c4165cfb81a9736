//! Error types for docsaga.

use std::io;

use crate::step::StepKind;

/// The result type used throughout docsaga.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for docsaga operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption was detected in the journal.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// A checksum mismatch was detected.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A task builder call was rejected. Nothing was queued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store refused a document (bad identity, reserved key, schema violation).
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// A filter or update document could not be interpreted.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A document with the same identity already exists in the collection.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The requested item was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The store is in an invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A step of a running task failed. Earlier steps have been rolled back.
    #[error("step {index} ({kind} on `{target}`) failed: {source}")]
    StepFailed {
        /// Position of the failing step in its task.
        index: usize,
        /// Kind of the failing step.
        kind: StepKind,
        /// Target the failing step operated on.
        target: String,
        /// The error reported by the store or backend.
        #[source]
        source: Box<Error>,
    },

    /// Undoing a task failed. The task's log record is left for the next recovery pass.
    #[error("rollback of task {task} failed: {source}")]
    Compensation {
        /// Identity of the task record being rolled back.
        task: String,
        /// The error that stopped the rollback.
        #[source]
        source: Box<Error>,
        /// The execution error that started the rollback, if any.
        cause: Option<Box<Error>>,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Creates a new invalid document error.
    pub fn invalid_document(msg: impl Into<String>) -> Self {
        Error::InvalidDocument(msg.into())
    }

    /// Creates a new invalid query error.
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Error::InvalidQuery(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns the error that originally failed a task, looking through
    /// step and rollback wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::StepFailed { source, .. } => source.root_cause(),
            Error::Compensation { cause: Some(cause), .. } => cause.root_cause(),
            Error::Compensation { source, cause: None, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
