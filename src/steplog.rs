//! Durable step log.
//!
//! Each running task is one [`TaskRecord`] in the log collection. Every
//! change to the record is a single-document update, so the record always
//! reflects a state the task actually passed through.

use serde_json::Value;

use crate::codec;
use crate::document::{Document, ObjectId, ID_FIELD};
use crate::error::{Error, Result};
use crate::step::{Step, StepState, TaskRecord};
use crate::store::{id_filter, Store};

/// Reads and writes task records in one collection.
pub struct StepLog<'a> {
    store: &'a dyn Store,
    collection: &'a str,
}

impl<'a> StepLog<'a> {
    /// Creates a step log over `collection` of `store`.
    pub fn new(store: &'a dyn Store, collection: &'a str) -> Self {
        Self { store, collection }
    }

    /// Collection holding the records.
    pub fn collection(&self) -> &str {
        self.collection
    }

    /// Persists a new record holding `steps`.
    ///
    /// Nothing of the task may run before this returns.
    pub fn create(&self, steps: Vec<Step>) -> Result<TaskRecord> {
        let record = TaskRecord { id: ObjectId::new().into(), steps };
        self.store.insert_one(self.collection, record.to_document()?)?;
        Ok(record)
    }

    /// Writes `state` for step `index`, locally and in the store.
    pub fn set_state(&self, record: &mut TaskRecord, index: usize, state: StepState) -> Result<()> {
        step_mut(record, index)?;
        let mut fields = Document::new();
        fields.insert(format!("steps.{}.state", index), serde_json::to_value(state)?);
        self.write(&record.filter(), fields)?;
        step_mut(record, index)?.state = state;
        Ok(())
    }

    /// Stores the pre-images of step `index` and marks it PENDING in one write.
    pub fn record_capture(&self, record: &mut TaskRecord, index: usize, pre_images: &[Document]) -> Result<()> {
        step_mut(record, index)?;
        let encoded: Vec<Document> = pre_images.iter().cloned().map(codec::encode_document).collect();
        let mut fields = Document::new();
        fields.insert(
            format!("steps.{}.dataStore", index),
            Value::Array(encoded.iter().cloned().map(Value::Object).collect()),
        );
        fields.insert(format!("steps.{}.state", index), serde_json::to_value(StepState::Pending)?);
        self.write(&record.filter(), fields)?;

        let step = step_mut(record, index)?;
        step.data_store = encoded;
        step.state = StepState::Pending;
        Ok(())
    }

    /// Removes the record.
    pub fn delete(&self, record: &TaskRecord) -> Result<()> {
        self.store.delete(self.collection, &record.filter(), false)?;
        Ok(())
    }

    /// Reads one record by identity.
    pub fn load(&self, id: &Value) -> Result<Option<TaskRecord>> {
        self.store
            .find_one(self.collection, &id_filter(id.clone()))?
            .map(TaskRecord::from_document)
            .transpose()
    }

    /// Reads every record, oldest first.
    pub fn load_all(&self) -> Result<Vec<TaskRecord>> {
        self.store
            .find(self.collection, &Document::new(), None)?
            .into_iter()
            .map(TaskRecord::from_document)
            .collect()
    }

    fn write(&self, filter: &Document, fields: Document) -> Result<()> {
        let mut update = Document::new();
        update.insert("$set".to_string(), Value::Object(fields));
        let outcome = self.store.update(self.collection, filter, &update, false)?;
        if outcome.matched == 0 {
            return Err(Error::not_found(format!(
                "task record {} is gone from {}",
                filter_id(filter),
                self.collection
            )));
        }
        Ok(())
    }
}

fn filter_id(filter: &Document) -> String {
    filter.get(ID_FIELD).map(Value::to_string).unwrap_or_default()
}

fn step_mut(record: &mut TaskRecord, index: usize) -> Result<&mut Step> {
    let id = record.id_string();
    record
        .steps
        .get_mut(index)
        .ok_or_else(|| Error::internal(format!("task {} has no step {}", id, index)))
}
