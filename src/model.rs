//! Models used by the mapped execution backend.
//!
//! A model gives a name to a collection and, optionally, a [`Schema`] that
//! documents written through the mapped backend must satisfy. Names that
//! were never registered resolve to a permissive model whose collection has
//! the same name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::document::{kind_name, Document, HasCollectionName, ID_FIELD};
use crate::error::{Error, Result};
use crate::store::query::validate_collection_name;

/// Type a schema field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Any JSON value.
    Any,
    /// A string.
    String,
    /// A number.
    Number,
    /// A boolean.
    Bool,
    /// A nested object.
    Object,
    /// An array.
    Array,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::Any => true,
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Top-level field name.
    pub name: String,
    /// Expected type.
    pub kind: FieldKind,
    /// Whether the field must be present and non-null.
    pub required: bool,
}

/// The shape documents of a model must have.
///
/// A strict schema drops undeclared fields before a write; a permissive one
/// keeps them. The default schema is permissive, like the one unregistered
/// names resolve to.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    fields: Vec<Field>,
    strict: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Self::permissive()
    }
}

impl Schema {
    /// A strict schema with no fields yet.
    pub fn new() -> Self {
        Self { fields: Vec::new(), strict: true }
    }

    /// A schema that accepts any document.
    pub fn permissive() -> Self {
        Self { fields: Vec::new(), strict: false }
    }

    /// Declares an optional field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field { name: name.into(), kind, required: false });
        self
    }

    /// Declares a required field.
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field { name: name.into(), kind, required: true });
        self
    }

    /// Sets whether undeclared fields are dropped.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Declared fields.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Whether undeclared fields are dropped.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Checks a whole document, returning it with undeclared fields removed
    /// if the schema is strict.
    pub fn validate(&self, model: &str, mut document: Document) -> Result<Document> {
        for field in &self.fields {
            match document.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(Error::invalid_document(format!(
                        "{} validation failed: path `{}` is required",
                        model, field.name
                    )));
                }
                Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                    return Err(type_error(model, field, value));
                }
                _ => {}
            }
        }
        if self.strict {
            document.retain(|key, _| key == ID_FIELD || self.fields.iter().any(|f| &f.name == key));
        }
        Ok(document)
    }

    /// Checks the fields a patch sets. Fields the patch does not mention are
    /// not looked at; a required field may not be set to null.
    pub fn validate_patch(&self, model: &str, fields: &Document) -> Result<()> {
        for (path, value) in fields {
            let top = path.split('.').next().unwrap_or(path);
            let Some(field) = self.fields.iter().find(|f| f.name == top) else {
                continue;
            };
            if top != path {
                continue;
            }
            if value.is_null() && field.required {
                return Err(Error::invalid_document(format!(
                    "{} validation failed: path `{}` is required",
                    model, field.name
                )));
            }
            if !value.is_null() && !field.kind.accepts(value) {
                return Err(type_error(model, field, value));
            }
        }
        Ok(())
    }
}

fn type_error(model: &str, field: &Field, value: &Value) -> Error {
    Error::invalid_document(format!(
        "{} validation failed: path `{}` expects {:?}, got {}",
        model,
        field.name,
        field.kind,
        kind_name(value)
    ))
}

/// A named collection with a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    name: String,
    collection: String,
    schema: Schema,
}

impl Model {
    /// Creates a model stored in the collection of the same name.
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        let name = name.into();
        Self { collection: name.clone(), name, schema }
    }

    /// Stores the model's documents in `collection` instead.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection the model's documents live in.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The model's schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

impl HasCollectionName for Model {
    fn collection_name(&self) -> &str {
        &self.name
    }
}

/// Models known to an engine.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<Model>>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model. A name can only be registered once, and not after
    /// it has already been resolved to a permissive model.
    pub fn register(&self, model: Model) -> Result<Arc<Model>> {
        validate_collection_name(model.name())?;
        validate_collection_name(model.collection())?;

        let mut models = self.models.write();
        if models.contains_key(model.name()) {
            return Err(Error::invalid_argument(format!(
                "the schema for model `{}` has already been set",
                model.name()
            )));
        }
        let model = Arc::new(model);
        models.insert(model.name().to_string(), Arc::clone(&model));
        Ok(model)
    }

    /// Registers `name` with `schema`, stored in the collection of the same name.
    pub fn init_model(&self, name: &str, schema: Schema) -> Result<Arc<Model>> {
        self.register(Model::new(name, schema))
    }

    /// Resolves a model, creating a permissive one for an unknown name.
    pub fn get(&self, name: &str) -> Result<Arc<Model>> {
        if let Some(model) = self.models.read().get(name) {
            return Ok(Arc::clone(model));
        }
        validate_collection_name(name)?;
        let mut models = self.models.write();
        let model = models
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Model::new(name, Schema::permissive())));
        Ok(Arc::clone(model))
    }

    /// Whether `name` has been registered or resolved.
    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }
}
