//! Task builder and execution.
//!
//! A [`Task`] collects saves, updates and removes, then runs them in order as
//! one unit: either every step takes effect, or every step that already ran
//! is undone before [`Task::run`] returns the error.
//!
//! # Example
//!
//! ```rust
//! use docsaga::{Engine, ExecutionMode, Options};
//! use serde_json::json;
//!
//! # fn main() -> docsaga::Result<()> {
//! let engine = Engine::in_memory(Options::default())?;
//!
//! let mut task = engine.task();
//! task.save("accounts", json!({"_id": "a", "balance": 100}))?
//!     .save("accounts", json!({"_id": "b", "balance": 0}))?
//!     .update("accounts", json!({"_id": "a"}), json!({"$inc": {"balance": -40}}))?
//!     .update("accounts", json!({"_id": "b"}), json!({"$inc": {"balance": 40}}))?;
//!
//! let results = task.run(ExecutionMode::Direct)?;
//! assert_eq!(results.len(), 4);
//! # Ok(())
//! # }
//! ```

use serde_json::Value;

use crate::backend::{Backend, ExecutionMode, StepResult};
use crate::codec;
use crate::document::{ensure_identity, into_document, HasCollectionName, PersistedDocument, ID_FIELD};
use crate::error::{Error, Result};
use crate::roller::Roller;
use crate::step::{Step, StepKind, StepState, TaskRecord, UpdateOptions};
use crate::steplog::StepLog;
use crate::store::query::validate_collection_name;
use crate::Engine;

/// A batch of steps run as a unit.
///
/// Builder calls validate their input and either queue exactly one step or
/// return [`Error::Validation`] leaving the queue untouched. Running the task
/// empties the queue, so the same builder can be reused for another batch.
pub struct Task<'a> {
    engine: &'a Engine,
    steps: Vec<Step>,
}

impl<'a> Task<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self { engine, steps: Vec::new() }
    }

    /// Queues the insertion of `document` into `target`.
    pub fn save<T: HasCollectionName + ?Sized>(&mut self, target: &T, document: Value) -> Result<&mut Self> {
        let target = target_name(target)?;
        let document = into_document(document, "doc")?;

        let mut step = Step::new(self.steps.len(), StepKind::Save, target);
        step.data = Some(codec::encode_document(document));
        Ok(self.push(step))
    }

    /// Queues the insertion of a document that knows its own collection.
    pub fn save_document<D: PersistedDocument + ?Sized>(&mut self, document: &D) -> Result<&mut Self> {
        self.save(document, Value::Object(document.to_document()))
    }

    /// Queues an update of the documents in `target` matching `condition`.
    ///
    /// `data` may mix update operators with plain fields; plain fields are
    /// set. Only the first match is updated unless [`options`](Self::options)
    /// sets `multi`.
    pub fn update<T: HasCollectionName + ?Sized>(
        &mut self,
        target: &T,
        condition: Value,
        data: Value,
    ) -> Result<&mut Self> {
        let target = target_name(target)?;
        let condition = into_document(condition, "condition")?;
        let data = into_document(data, "data")?;

        let mut step = Step::new(self.steps.len(), StepKind::Update, target);
        step.condition = Some(codec::encode_document(condition));
        step.data = Some(codec::encode_document(data));
        Ok(self.push(step))
    }

    /// Queues an update of one stored document, selected by its identity.
    pub fn update_document<D: PersistedDocument + ?Sized>(&mut self, document: &D, data: Value) -> Result<&mut Self> {
        let condition = identity_condition(document)?;
        self.update(document, condition, data)
    }

    /// Queues the removal of every document in `target` matching `condition`.
    pub fn remove<T: HasCollectionName + ?Sized>(&mut self, target: &T, condition: Value) -> Result<&mut Self> {
        let target = target_name(target)?;
        let condition = into_document(condition, "condition")?;

        let mut step = Step::new(self.steps.len(), StepKind::Remove, target);
        step.condition = Some(codec::encode_document(condition));
        Ok(self.push(step))
    }

    /// Queues the removal of one stored document, selected by its identity.
    pub fn remove_document<D: PersistedDocument + ?Sized>(&mut self, document: &D) -> Result<&mut Self> {
        let condition = identity_condition(document)?;
        self.remove(document, condition)
    }

    /// Attaches options to the most recently queued step, which must be an update.
    ///
    /// Recognised keys are `multi` and `viaSave`; others are ignored.
    pub fn options(&mut self, config: Value) -> Result<&mut Self> {
        let Some(step) = self.steps.last_mut() else {
            return Err(Error::validation("options() needs a step to attach to; queue an update first"));
        };
        if !config.is_object() {
            return Err(Error::validation(format!(
                "Invalid options: expected an object, got {}",
                crate::document::kind_name(&config)
            )));
        }
        if step.kind != StepKind::Update {
            return Err(Error::validation(format!(
                "options() only applies to UPDATE steps, the last step is {}",
                step.kind
            )));
        }

        let options: UpdateOptions =
            serde_json::from_value(config).map_err(|e| Error::validation(format!("Invalid options: {}", e)))?;
        step.options = Some(options);
        Ok(self)
    }

    /// Steps queued so far.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of queued steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the queued steps with the engine's default execution mode.
    pub fn run_default(&mut self) -> Result<Vec<StepResult>> {
        self.run(self.engine.options().default_mode)
    }

    /// Runs the queued steps in order and returns one result per step.
    ///
    /// The steps are written to the step log before the first one executes.
    /// On success the log record is deleted. If a step fails, the steps that
    /// ran before it are undone and the failure is returned as
    /// [`Error::StepFailed`]; if undoing fails as well, the result is
    /// [`Error::Compensation`] carrying the step failure as its cause and the
    /// log record stays behind for [`Engine::recover`].
    pub fn run(&mut self, mode: ExecutionMode) -> Result<Vec<StepResult>> {
        let mut steps = std::mem::take(&mut self.steps);
        if steps.is_empty() {
            return Ok(Vec::new());
        }
        for step in &mut steps {
            step.execution_mode = Some(mode);
        }

        let engine = self.engine;
        let store = engine.store();
        let log = StepLog::new(store, &engine.options().log_collection);
        let mut record = log.create(steps)?;
        log::debug!("Task {} logged with {} step(s)", record.id_string(), record.steps.len());

        let backend = mode.backend(store, engine.models());
        let mut results = Vec::with_capacity(record.steps.len());
        for index in 0..record.steps.len() {
            match execute(&log, backend.as_ref(), &mut record, index) {
                Ok(result) => results.push(result),
                Err(err) => return Err(self.abort(&mut record, index, err)),
            }
        }

        log.delete(&record)?;
        log::info!("Task {} committed {} step(s)", record.id_string(), results.len());
        Ok(results)
    }

    fn abort(&self, record: &mut TaskRecord, index: usize, err: Error) -> Error {
        let step = &record.steps[index];
        let failure = Error::StepFailed {
            index,
            kind: step.kind,
            target: step.target.clone(),
            source: Box::new(err),
        };
        log::warn!("Task {} failed, rolling back: {}", record.id_string(), failure);

        let engine = self.engine;
        let roller = Roller::new(engine.store(), engine.models(), &engine.options().log_collection);
        match roller.roll_one(record) {
            Ok(()) => failure,
            Err(Error::Compensation { task, source, .. }) => {
                Error::Compensation { task, source, cause: Some(Box::new(failure)) }
            }
            Err(other) => Error::Compensation {
                task: record.id_string(),
                source: Box::new(other),
                cause: Some(Box::new(failure)),
            },
        }
    }

    fn push(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }
}

/// Captures the pre-image of one step, applies it and marks it DONE.
fn execute(log: &StepLog<'_>, backend: &dyn Backend, record: &mut TaskRecord, index: usize) -> Result<StepResult> {
    let step = record.steps[index].clone();

    let result = match step.kind {
        StepKind::Save => {
            let mut document = step.data();
            ensure_identity(&mut document);
            let document = backend.prepare_save(&step, document)?;
            log.record_capture(record, index, std::slice::from_ref(&document))?;
            match backend.perform_save(&step, document) {
                Ok(result) => result,
                Err(err) => {
                    // Nothing was inserted, and the identity may belong to a document
                    // that was already there.
                    if let Err(reset) = log.set_state(record, index, StepState::Initial) {
                        log::warn!("Task {} could not reset failed step {}: {}", record.id_string(), index, reset);
                    }
                    return Err(err);
                }
            }
        }
        StepKind::Update => {
            let condition = step.condition();
            let pre_images = backend.capture(&step, &condition)?;
            log.record_capture(record, index, &pre_images)?;
            backend.perform_update(&step, &condition, step.data())?
        }
        StepKind::Remove => {
            let condition = step.condition();
            let pre_images = backend.capture(&step, &condition)?;
            log.record_capture(record, index, &pre_images)?;
            backend.perform_remove(&step, &condition)?
        }
    };

    log.set_state(record, index, StepState::Done)?;
    log::debug!("Task {} step {} ({} on `{}`) done", record.id_string(), index, step.kind, step.target);
    Ok(result)
}

fn target_name<T: HasCollectionName + ?Sized>(target: &T) -> Result<String> {
    let name = target.collection_name();
    validate_collection_name(name).map_err(|e| Error::validation(format!("Invalid target: {}", e)))?;
    Ok(name.to_string())
}

fn identity_condition<D: PersistedDocument + ?Sized>(document: &D) -> Result<Value> {
    let id = document.identity().ok_or_else(|| {
        Error::validation(format!(
            "document from `{}` has no {}; it must be stored before it can be targeted",
            document.collection_name(),
            ID_FIELD
        ))
    })?;
    let mut condition = serde_json::Map::new();
    condition.insert(ID_FIELD.to_string(), id.clone());
    Ok(Value::Object(condition))
}
