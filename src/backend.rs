//! Operation backends that carry out a step's mutation.
//!
//! Two backends implement the same three operations:
//!
//! - [`DirectBackend`] works on raw collections: the step target is the
//!   collection name and documents are written as given.
//! - [`MappedBackend`] works through [`Model`](crate::model::Model)s: the
//!   target names a model, documents are validated against its schema, and
//!   the model decides which collection is written.
//!
//! The backend is chosen per run with [`ExecutionMode`] and recorded on each
//! step so recovery resolves the same collections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::model::ModelRegistry;
use crate::store::query::{apply_update, format_update};
use crate::store::{id_filter, Store, UpdateOutcome};
use crate::step::Step;

/// Which backend performs a run's mutations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Raw collections, no schema.
    Direct,
    /// Registered models with schema validation.
    #[default]
    Mapped,
}

impl ExecutionMode {
    /// Returns the backend for this mode.
    pub fn backend<'a>(self, store: &'a dyn Store, models: &'a ModelRegistry) -> Box<dyn Backend + 'a> {
        match self {
            ExecutionMode::Direct => Box::new(DirectBackend { store }),
            ExecutionMode::Mapped => Box::new(MappedBackend { store, models }),
        }
    }
}

/// Result of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepResult {
    /// The inserted document, identity included.
    Saved(Document),
    /// Counts reported by the update.
    Updated(UpdateOutcome),
    /// Number of documents deleted.
    Removed {
        /// Documents deleted.
        deleted: u64,
    },
}

impl StepResult {
    /// The inserted document of a SAVE.
    pub fn saved(&self) -> Option<&Document> {
        match self {
            StepResult::Saved(document) => Some(document),
            _ => None,
        }
    }

    /// Identity of the document inserted by a SAVE.
    pub fn id(&self) -> Option<&Value> {
        self.saved().and_then(|d| d.get(ID_FIELD))
    }
}

/// The operations a step needs from a backend.
pub trait Backend {
    /// Collection that `target` resolves to.
    fn collection_for(&self, target: &str) -> Result<String>;

    /// Returns `document` as [`perform_save`](Backend::perform_save) will
    /// insert it, failing with [`Error::DuplicateKey`] if its identity is
    /// already taken. Runs before the pre-image is logged.
    fn prepare_save(&self, step: &Step, document: Document) -> Result<Document>;

    /// Inserts `document` (identity already assigned).
    fn perform_save(&self, step: &Step, document: Document) -> Result<StepResult>;

    /// Applies `data` to the documents matching `condition`.
    fn perform_update(&self, step: &Step, condition: &Document, data: Document) -> Result<StepResult>;

    /// Deletes every document matching `condition`.
    fn perform_remove(&self, step: &Step, condition: &Document) -> Result<StepResult>;

    /// Reads the documents a step is about to change.
    fn capture(&self, step: &Step, condition: &Document) -> Result<Vec<Document>>;
}

/// Backend writing straight to collections.
pub struct DirectBackend<'a> {
    store: &'a dyn Store,
}

impl Backend for DirectBackend<'_> {
    fn collection_for(&self, target: &str) -> Result<String> {
        Ok(target.to_string())
    }

    fn prepare_save(&self, step: &Step, document: Document) -> Result<Document> {
        ensure_unclaimed(self.store, &step.target, &document)?;
        Ok(document)
    }

    fn perform_save(&self, step: &Step, document: Document) -> Result<StepResult> {
        Ok(StepResult::Saved(self.store.insert_one(&step.target, document)?))
    }

    fn perform_update(&self, step: &Step, condition: &Document, data: Document) -> Result<StepResult> {
        let outcome = self.store.update(&step.target, condition, &format_update(data), step.is_multi())?;
        Ok(StepResult::Updated(outcome))
    }

    fn perform_remove(&self, step: &Step, condition: &Document) -> Result<StepResult> {
        let deleted = self.store.delete(&step.target, condition, true)?;
        Ok(StepResult::Removed { deleted })
    }

    fn capture(&self, step: &Step, condition: &Document) -> Result<Vec<Document>> {
        let limit = if step.is_multi() { None } else { Some(1) };
        self.store.find(&step.target, condition, limit)
    }
}

/// Backend writing through registered models.
pub struct MappedBackend<'a> {
    store: &'a dyn Store,
    models: &'a ModelRegistry,
}

impl Backend for MappedBackend<'_> {
    fn collection_for(&self, target: &str) -> Result<String> {
        Ok(self.models.get(target)?.collection().to_string())
    }

    fn prepare_save(&self, step: &Step, document: Document) -> Result<Document> {
        let model = self.models.get(&step.target)?;
        let document = model.schema().validate(model.name(), document)?;
        ensure_unclaimed(self.store, model.collection(), &document)?;
        Ok(document)
    }

    fn perform_save(&self, step: &Step, document: Document) -> Result<StepResult> {
        let model = self.models.get(&step.target)?;
        let document = model.schema().validate(model.name(), document)?;
        Ok(StepResult::Saved(self.store.insert_one(model.collection(), document)?))
    }

    fn perform_update(&self, step: &Step, condition: &Document, data: Document) -> Result<StepResult> {
        let model = self.models.get(&step.target)?;
        let update = format_update(data);

        if let Some(Value::Object(fields)) = update.get("$set") {
            model.schema().validate_patch(model.name(), fields)?;
        }

        if !step.options.is_some_and(|o| o.via_save) {
            let outcome = self.store.update(model.collection(), condition, &update, step.is_multi())?;
            return Ok(StepResult::Updated(outcome));
        }

        let limit = if step.is_multi() { None } else { Some(1) };
        let mut outcome = UpdateOutcome::default();
        for current in self.store.find(model.collection(), condition, limit)? {
            let Some(id) = current.get(ID_FIELD).cloned() else {
                continue;
            };
            let mut patched = current;
            apply_update(&mut patched, &update)?;
            let patched = model.schema().validate(model.name(), patched)?;

            let replaced = self.store.replace_one(model.collection(), &id_filter(id), patched)?;
            outcome.matched += replaced.matched;
            outcome.modified += replaced.modified;
        }
        Ok(StepResult::Updated(outcome))
    }

    fn perform_remove(&self, step: &Step, condition: &Document) -> Result<StepResult> {
        let model = self.models.get(&step.target)?;
        let deleted = self.store.delete(model.collection(), condition, true)?;
        Ok(StepResult::Removed { deleted })
    }

    fn capture(&self, step: &Step, condition: &Document) -> Result<Vec<Document>> {
        let model = self.models.get(&step.target)?;
        let limit = if step.is_multi() { None } else { Some(1) };
        self.store.find(model.collection(), condition, limit)
    }
}

fn ensure_unclaimed(store: &dyn Store, collection: &str, document: &Document) -> Result<()> {
    let Some(id) = document.get(ID_FIELD) else {
        return Ok(());
    };
    if store.find_one(collection, &id_filter(id.clone()))?.is_some() {
        return Err(Error::DuplicateKey(format!("{} already holds _id {}", collection, id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldKind, Model, Schema};
    use crate::step::{StepKind, UpdateOptions};
    use crate::store::Database;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn step(kind: StepKind, target: &str) -> Step {
        Step::new(0, kind, target.to_string())
    }

    #[test]
    fn test_direct_update_formats_plain_keys() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        db.insert_one("a", doc(json!({"_id": 1, "name": "B", "age": 18}))).unwrap();

        let backend = ExecutionMode::Direct.backend(&db, &models);
        let result = backend
            .perform_update(
                &step(StepKind::Update, "a"),
                &doc(json!({"_id": 1})),
                doc(json!({"name": "Yo momma", "$inc": {"age": 20}})),
            )
            .unwrap();
        assert_eq!(result, StepResult::Updated(UpdateOutcome { matched: 1, modified: 1 }));
        assert_eq!(
            Value::Object(db.find_one("a", &id_filter(json!(1))).unwrap().unwrap()),
            json!({"_id": 1, "name": "Yo momma", "age": 38})
        );
    }

    #[test]
    fn test_capture_respects_multiplicity() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        for i in 0..3 {
            db.insert_one("a", doc(json!({"_id": i, "k": 1}))).unwrap();
        }
        let backend = ExecutionMode::Direct.backend(&db, &models);

        let mut update = step(StepKind::Update, "a");
        assert_eq!(backend.capture(&update, &doc(json!({"k": 1}))).unwrap().len(), 1);
        update.options = Some(UpdateOptions { multi: true, via_save: false });
        assert_eq!(backend.capture(&update, &doc(json!({"k": 1}))).unwrap().len(), 3);
        assert_eq!(backend.capture(&step(StepKind::Remove, "a"), &doc(json!({"k": 1}))).unwrap().len(), 3);
    }

    #[test]
    fn test_mapped_save_validates_schema() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        models.init_model("dogs", Schema::new().required("name", FieldKind::String)).unwrap();

        let backend = ExecutionMode::Mapped.backend(&db, &models);
        let err = backend.perform_save(&step(StepKind::Save, "dogs"), doc(json!({"age": 4}))).unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));

        let saved = backend
            .perform_save(&step(StepKind::Save, "dogs"), doc(json!({"name": "dog1", "junk": 1})))
            .unwrap();
        let saved = saved.saved().unwrap();
        assert!(!saved.contains_key("junk"));
        assert_eq!(db.count("dogs", &Document::new()).unwrap(), 1);
    }

    #[test]
    fn test_prepare_save_rejects_taken_identity() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        models.register(Model::new("Car", Schema::new().field("make", FieldKind::String)).with_collection("cars")).unwrap();
        db.insert_one("cars", doc(json!({"_id": 1, "make": "VW"}))).unwrap();

        let mapped = ExecutionMode::Mapped.backend(&db, &models);
        let err = mapped.prepare_save(&step(StepKind::Save, "Car"), doc(json!({"_id": 1, "make": "BMW"}))).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));

        let prepared = mapped
            .prepare_save(&step(StepKind::Save, "Car"), doc(json!({"_id": 2, "make": "BMW", "junk": true})))
            .unwrap();
        assert_eq!(Value::Object(prepared), json!({"_id": 2, "make": "BMW"}));

        let direct = ExecutionMode::Direct.backend(&db, &models);
        let err = direct.prepare_save(&step(StepKind::Save, "cars"), doc(json!({"_id": 1}))).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        assert_eq!(db.count("cars", &Document::new()).unwrap(), 1);
    }

    #[test]
    fn test_mapped_model_writes_its_collection() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        models.register(Model::new("Car", Schema::permissive()).with_collection("cars")).unwrap();

        let backend = ExecutionMode::Mapped.backend(&db, &models);
        assert_eq!(backend.collection_for("Car").unwrap(), "cars");
        backend.perform_save(&step(StepKind::Save, "Car"), doc(json!({"make": "VW"}))).unwrap();
        assert_eq!(db.count("cars", &Document::new()).unwrap(), 1);
        assert_eq!(ExecutionMode::Direct.backend(&db, &models).collection_for("Car").unwrap(), "Car");
    }

    #[test]
    fn test_mapped_update_via_save_validates_whole_document() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        models
            .init_model(
                "dogs",
                Schema::new().required("name", FieldKind::String).field("age", FieldKind::Number),
            )
            .unwrap();
        db.insert_one("dogs", doc(json!({"_id": 2, "name": "dog2", "age": 3}))).unwrap();

        let backend = ExecutionMode::Mapped.backend(&db, &models);
        let mut update = step(StepKind::Update, "dogs");
        update.options = Some(UpdateOptions { multi: false, via_save: true });

        let result = backend
            .perform_update(&update, &doc(json!({"_id": 2})), doc(json!({"$inc": {"age": 2}})))
            .unwrap();
        assert_eq!(result, StepResult::Updated(UpdateOutcome { matched: 1, modified: 1 }));

        let err = backend
            .perform_update(&update, &doc(json!({"_id": 2})), doc(json!({"$unset": {"name": ""}})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
        assert_eq!(db.find_one("dogs", &id_filter(json!(2))).unwrap().unwrap()["age"], json!(5));
    }

    #[test]
    fn test_mapped_update_checks_patch_types() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        models.init_model("dogs", Schema::new().field("age", FieldKind::Number)).unwrap();
        db.insert_one("dogs", doc(json!({"_id": 1, "age": 3}))).unwrap();

        let backend = ExecutionMode::Mapped.backend(&db, &models);
        let err = backend
            .perform_update(&step(StepKind::Update, "dogs"), &doc(json!({"_id": 1})), doc(json!({"age": "old"})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
    }

    #[test]
    fn test_remove_deletes_every_match() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        for i in 0..3 {
            db.insert_one("a", doc(json!({"_id": i, "k": 1}))).unwrap();
        }
        for mode in [ExecutionMode::Direct, ExecutionMode::Mapped] {
            let result = mode.backend(&db, &models).perform_remove(&step(StepKind::Remove, "a"), &doc(json!({"k": 1}))).unwrap();
            let expected = if mode == ExecutionMode::Direct { 3 } else { 0 };
            assert_eq!(result, StepResult::Removed { deleted: expected });
        }
    }
}
