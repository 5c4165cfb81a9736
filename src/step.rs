//! Steps and the task record they are persisted in.
//!
//! A [`TaskRecord`] is one document in the step log collection. It holds the
//! ordered [`Step`]s of a task; once written, the number of steps never
//! changes and only each step's `state` and `dataStore` are updated.
//!
//! Payloads (`condition`, `data`, `dataStore`) are kept key-encoded with
//! [`codec`](crate::codec) so they can sit inside the record as plain data.
//! The accessors on [`Step`] return them decoded.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::ExecutionMode;
use crate::codec;
use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepKind {
    /// Insert one document.
    Save,
    /// Update the documents matching a condition.
    Update,
    /// Delete the documents matching a condition.
    Remove,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::Save => "SAVE",
            StepKind::Update => "UPDATE",
            StepKind::Remove => "REMOVE",
        })
    }
}

/// How far a step has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepState {
    /// Queued, nothing done yet.
    Initial,
    /// Pre-image captured; the mutation may or may not have happened.
    Pending,
    /// Mutation applied.
    Done,
    /// Mutation undone.
    Rolled,
}

/// Options accepted by an UPDATE step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOptions {
    /// Update (and capture) every matching document instead of the first.
    pub multi: bool,
    /// Mapped backend only: load each match, apply the patch in memory,
    /// validate the whole document against its schema and write it back.
    #[serde(alias = "viaSave")]
    pub via_save: bool,
}

/// One queued save, update or remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position within the task, fixed when the step is queued.
    pub index: usize,
    /// What the step does.
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Progress marker.
    pub state: StepState,
    /// Collection or model name.
    pub target: String,
    /// Encoded filter (UPDATE, REMOVE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Document>,
    /// Encoded document or patch (SAVE, UPDATE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Document>,
    /// Encoded pre-images captured right before the mutation.
    #[serde(default, rename = "dataStore")]
    pub data_store: Vec<Document>,
    /// Options of an UPDATE step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<UpdateOptions>,
    /// Backend chosen when the task ran.
    #[serde(default, rename = "executionMode", skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
}

impl Step {
    pub(crate) fn new(index: usize, kind: StepKind, target: String) -> Self {
        Self {
            index,
            kind,
            state: StepState::Initial,
            target,
            condition: None,
            data: None,
            data_store: Vec::new(),
            options: None,
            execution_mode: None,
        }
    }

    /// The decoded filter, empty if the step has none.
    pub fn condition(&self) -> Document {
        self.condition.clone().map(codec::decode_document).unwrap_or_default()
    }

    /// The decoded document or patch, empty if the step has none.
    pub fn data(&self) -> Document {
        self.data.clone().map(codec::decode_document).unwrap_or_default()
    }

    /// The decoded pre-images.
    pub fn pre_images(&self) -> Vec<Document> {
        self.data_store.iter().cloned().map(codec::decode_document).collect()
    }

    /// Whether the pre-image capture and the mutation cover every match.
    pub fn is_multi(&self) -> bool {
        match self.kind {
            StepKind::Remove => true,
            StepKind::Update => self.options.is_some_and(|o| o.multi),
            StepKind::Save => false,
        }
    }

    /// The execution mode recorded for this step, or the default.
    pub fn mode(&self) -> ExecutionMode {
        self.execution_mode.unwrap_or_default()
    }
}

/// A task as persisted in the step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Identity of the record.
    #[serde(rename = "_id")]
    pub id: Value,
    /// The task's steps, `steps[i].index == i`.
    pub steps: Vec<Step>,
}

impl TaskRecord {
    /// Parses a record read from the step log collection.
    pub fn from_document(document: Document) -> Result<Self> {
        let record: TaskRecord = serde_json::from_value(Value::Object(document))?;
        if let Some(step) = record.steps.iter().enumerate().find(|(i, s)| s.index != *i) {
            return Err(Error::corruption(format!(
                "task {} has step {} stored at position {}",
                record.id, step.1.index, step.0
            )));
        }
        Ok(record)
    }

    /// Serializes the record for the step log collection.
    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::internal(format!("task record serialized to {}", other))),
        }
    }

    /// The record identity as text, for messages.
    pub fn id_string(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Filter selecting this record.
    pub fn filter(&self) -> Document {
        let mut filter = Document::new();
        filter.insert(ID_FIELD.to_string(), self.id.clone());
        filter
    }

    /// The first step, if any.
    pub fn first(&self) -> Option<&Step> {
        self.steps.first()
    }

    /// The last step, if any.
    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_step_serializes_with_log_field_names() {
        let mut step = Step::new(0, StepKind::Update, "users".to_string());
        step.condition = Some(codec::encode_document(doc(json!({"age": {"$gt": 3}}))));
        step.options = Some(UpdateOptions { multi: true, via_save: false });
        step.execution_mode = Some(ExecutionMode::Direct);

        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], json!("UPDATE"));
        assert_eq!(value["state"], json!("INITIAL"));
        assert_eq!(value["dataStore"], json!([]));
        assert_eq!(value["options"]["multi"], json!(true));
        assert!(value.get("data").is_none());
        assert!(!value.to_string().contains("\"$gt\""));

        assert_eq!(step.condition(), doc(json!({"age": {"$gt": 3}})));
    }

    #[test]
    fn test_update_options_accept_camel_case() {
        let options: UpdateOptions = serde_json::from_value(json!({"viaSave": true})).unwrap();
        assert!(options.via_save);
        assert!(!options.multi);
    }

    #[test]
    fn test_multiplicity() {
        let mut step = Step::new(0, StepKind::Update, "a".to_string());
        assert!(!step.is_multi());
        step.options = Some(UpdateOptions { multi: true, via_save: false });
        assert!(step.is_multi());
        assert!(Step::new(0, StepKind::Remove, "a".to_string()).is_multi());
        assert!(!Step::new(0, StepKind::Save, "a".to_string()).is_multi());
    }

    #[test]
    fn test_task_record_round_trip() {
        let record = TaskRecord {
            id: json!("abc"),
            steps: vec![
                Step::new(0, StepKind::Save, "a".to_string()),
                Step::new(1, StepKind::Remove, "b".to_string()),
            ],
        };
        let back = TaskRecord::from_document(record.to_document().unwrap()).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.id_string(), "abc");
        assert_eq!(back.first().map(|s| s.kind), Some(StepKind::Save));
        assert_eq!(back.last().map(|s| s.kind), Some(StepKind::Remove));
    }

    #[test]
    fn test_task_record_rejects_misplaced_steps() {
        let record = TaskRecord { id: json!(1), steps: vec![Step::new(1, StepKind::Save, "a".to_string())] };
        let document = record.to_document().unwrap();
        assert!(matches!(TaskRecord::from_document(document), Err(Error::Corruption(_))));
    }
}
