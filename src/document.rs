//! Documents, identities, and the capability traits the task builder accepts.
//!
//! A document is a JSON object. Every stored document carries its identity
//! under [`ID_FIELD`]; when a caller does not provide one an [`ObjectId`] is
//! generated.
//!
//! The task builder never inspects the shape of an opaque object to decide
//! what it is. It accepts anything implementing [`HasCollectionName`] as a
//! target and anything implementing [`PersistedDocument`] for the
//! single-document forms of `save`, `update` and `remove`.

use std::fmt;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A JSON document.
pub type Document = Map<String, Value>;

/// Field holding a document's identity.
pub const ID_FIELD: &str = "_id";

/// Something that names the collection an operation targets.
pub trait HasCollectionName {
    /// The collection (or model) name.
    fn collection_name(&self) -> &str;
}

/// Something that carries a stored document's identity.
pub trait HasIdentity {
    /// The identity value, if one has been assigned.
    fn identity(&self) -> Option<&Value>;
}

/// A document that knows where it lives and who it is.
pub trait PersistedDocument: HasCollectionName + HasIdentity {
    /// The plain document, identity included.
    fn to_document(&self) -> Document;
}

impl HasCollectionName for str {
    fn collection_name(&self) -> &str {
        self
    }
}

impl HasCollectionName for String {
    fn collection_name(&self) -> &str {
        self.as_str()
    }
}

impl<T: HasCollectionName + ?Sized> HasCollectionName for &T {
    fn collection_name(&self) -> &str {
        (**self).collection_name()
    }
}

impl HasIdentity for Document {
    fn identity(&self) -> Option<&Value> {
        self.get(ID_FIELD)
    }
}

/// A generated identity: a random (v4) UUID, stored in its 32-character hex form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generates a new identity.
    pub fn new() -> Self {
        ObjectId(Uuid::new_v4())
    }

    /// Returns the raw bytes.
    pub fn bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Returns the 32-character lowercase hex form.
    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }

    /// Parses the 32-character hex form.
    pub fn parse_hex(text: &str) -> Result<Self> {
        if text.len() != 32 {
            return Err(Error::invalid_argument(format!("not an object id: {:?}", text)));
        }
        Uuid::try_parse(text)
            .map(ObjectId)
            .map_err(|e| Error::invalid_argument(format!("not an object id: {:?}: {}", text, e)))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::String(id.to_hex())
    }
}

/// Returns the document's identity, assigning a fresh [`ObjectId`] first if it has none.
pub fn ensure_identity(document: &mut Document) -> Value {
    document.entry(ID_FIELD).or_insert_with(|| ObjectId::new().into()).clone()
}

/// Converts a JSON value into a document, failing for anything but an object.
pub fn into_document(value: Value, what: &str) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::validation(format!(
            "Invalid {}: expected an object, got {}",
            what,
            kind_name(&other)
        ))),
    }
}

pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A document as it exists in a collection.
///
/// Records are what [`Store`](crate::store::Store) lookups hand back when the
/// caller wants to keep working with a document, and what the task builder's
/// single-document forms take.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    collection: String,
    document: Document,
}

impl Record {
    /// Wraps `document` as a member of `collection`, assigning an identity if it has none.
    pub fn new(collection: impl Into<String>, document: Value) -> Result<Self> {
        let mut document = into_document(document, "doc")?;
        ensure_identity(&mut document);
        Ok(Self { collection: collection.into(), document })
    }

    /// Wraps a document already read from `collection`.
    pub fn from_document(collection: impl Into<String>, document: Document) -> Self {
        Self { collection: collection.into(), document }
    }

    /// The record's identity.
    pub fn id(&self) -> Option<&Value> {
        self.document.get(ID_FIELD)
    }

    /// Reads a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.document.get(field)
    }

    /// Sets a top-level field on the local copy. The store is not touched.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.document.insert(field.into(), value);
    }

    /// The underlying document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Consumes the record, returning the document.
    pub fn into_document(self) -> Document {
        self.document
    }
}

impl HasCollectionName for Record {
    fn collection_name(&self) -> &str {
        &self.collection
    }
}

impl HasIdentity for Record {
    fn identity(&self) -> Option<&Value> {
        self.id()
    }
}

impl PersistedDocument for Record {
    fn to_document(&self) -> Document {
        self.document.clone()
    }
}
