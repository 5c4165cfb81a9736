//! Compensation of failed or abandoned tasks.
//!
//! The [`Roller`] undoes the steps of a [`TaskRecord`] from the last to the
//! first, using the pre-images captured before each step ran, and then
//! deletes the record. Undoing a step is idempotent: a step already marked
//! ROLLED is skipped, and pre-images are only written back where the store
//! still disagrees with them, so a rollback interrupted by a crash can simply
//! be run again.

use crate::backend::ExecutionMode;
use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::model::ModelRegistry;
use crate::step::{Step, StepKind, StepState, TaskRecord};
use crate::steplog::StepLog;
use crate::store::{id_filter, Store};

/// Undoes tasks recorded in the step log.
pub struct Roller<'a> {
    store: &'a dyn Store,
    models: &'a ModelRegistry,
    log: StepLog<'a>,
}

impl<'a> Roller<'a> {
    /// Creates a roller over the step log kept in `log_collection`.
    pub fn new(store: &'a dyn Store, models: &'a ModelRegistry, log_collection: &'a str) -> Self {
        Self { store, models, log: StepLog::new(store, log_collection) }
    }

    /// Settles every record left in the step log, one at a time.
    ///
    /// Returns how many records were settled. Stops at the first record
    /// whose rollback fails; that record and the ones after it stay in the
    /// log for the next pass.
    pub fn roll_all(&self) -> Result<usize> {
        let records = self.log.load_all()?;
        if records.is_empty() {
            return Ok(0);
        }

        log::info!("Recovering {} unfinished task(s) from {}", records.len(), self.log.collection());
        let mut settled = 0;
        for mut record in records {
            self.roll_one(&mut record)?;
            settled += 1;
        }
        log::info!("Recovery settled {} task(s)", settled);
        Ok(settled)
    }

    /// Undoes one task and deletes its record.
    ///
    /// The undo loop is skipped when the last step is DONE (the task had
    /// finished) or the first step is INITIAL (the task never started); the
    /// record is deleted either way.
    pub fn roll_one(&self, record: &mut TaskRecord) -> Result<()> {
        let finished = record.last().is_some_and(|s| s.state == StepState::Done);
        let untouched = record.first().is_some_and(|s| s.state == StepState::Initial);

        if !finished && !untouched {
            for index in (0..record.steps.len()).rev() {
                let step = &record.steps[index];
                if matches!(step.state, StepState::Initial | StepState::Rolled) {
                    continue;
                }

                if let Err(err) = self.compensate(step) {
                    log::error!(
                        "Rollback of task {} failed at step {} ({} on `{}`): {}",
                        record.id_string(),
                        index,
                        step.kind,
                        step.target,
                        err
                    );
                    return Err(self.failure(record, err));
                }
                self.log.set_state(record, index, StepState::Rolled).map_err(|e| self.failure(record, e))?;
            }
        }

        self.log.delete(record).map_err(|e| self.failure(record, e))
    }

    fn failure(&self, record: &TaskRecord, source: Error) -> Error {
        Error::Compensation { task: record.id_string(), source: Box::new(source), cause: None }
    }

    fn compensate(&self, step: &Step) -> Result<()> {
        let collection = self.collection_for(step)?;
        let pre_images = step.pre_images();
        log::debug!(
            "Undoing step {} ({} on `{}`) with {} pre-image(s)",
            step.index,
            step.kind,
            collection,
            pre_images.len()
        );

        match step.kind {
            StepKind::Save => undo_save(self.store, &collection, step.state, &pre_images),
            StepKind::Update => undo_update(self.store, &collection, &pre_images),
            StepKind::Remove => undo_remove(self.store, &collection, &pre_images),
        }
    }

    fn collection_for(&self, step: &Step) -> Result<String> {
        let mode: ExecutionMode = step.mode();
        mode.backend(self.store, self.models).collection_for(&step.target)
    }
}

fn undo_save(store: &dyn Store, collection: &str, state: StepState, pre_images: &[Document]) -> Result<()> {
    let Some(pre_image) = pre_images.first() else {
        return Ok(());
    };
    let Some(id) = pre_image.get(ID_FIELD) else {
        return Ok(());
    };
    let filter = id_filter(id.clone());

    // A PENDING insert may never have happened; only remove what it would have written.
    if state == StepState::Pending {
        match store.find_one(collection, &filter)? {
            Some(current) if current == *pre_image => {}
            _ => return Ok(()),
        }
    }
    store.delete(collection, &filter, false)?;
    Ok(())
}

fn undo_update(store: &dyn Store, collection: &str, pre_images: &[Document]) -> Result<()> {
    for pre_image in pre_images {
        let Some(id) = pre_image.get(ID_FIELD) else {
            continue;
        };
        let filter = id_filter(id.clone());
        if store.find_one(collection, &filter)?.is_some() {
            store.replace_one(collection, &filter, pre_image.clone())?;
        }
    }
    Ok(())
}

fn undo_remove(store: &dyn Store, collection: &str, pre_images: &[Document]) -> Result<()> {
    for pre_image in pre_images {
        let Some(id) = pre_image.get(ID_FIELD) else {
            continue;
        };
        if store.find_one(collection, &id_filter(id.clone()))?.is_none() {
            store.insert_one(collection, pre_image.clone())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use serde_json::{json, Value};

    const LOG: &str = "tasks";

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn step(index: usize, kind: StepKind, state: StepState, pre_images: Vec<Value>) -> Step {
        let mut step = Step::new(index, kind, "people".to_string());
        step.state = state;
        step.execution_mode = Some(ExecutionMode::Direct);
        step.data_store = pre_images.into_iter().map(|v| crate::codec::encode_document(doc(v))).collect();
        step
    }

    #[test]
    fn test_roll_one_undoes_in_reverse() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        db.insert_one("people", doc(json!({"_id": 1, "name": "saved"}))).unwrap();
        db.insert_one("people", doc(json!({"_id": 2, "name": "after"}))).unwrap();

        let log = StepLog::new(&db, LOG);
        let mut record = log
            .create(vec![
                step(0, StepKind::Save, StepState::Done, vec![json!({"_id": 1, "name": "saved"})]),
                step(1, StepKind::Update, StepState::Done, vec![json!({"_id": 2, "name": "before"})]),
                step(2, StepKind::Remove, StepState::Done, vec![json!({"_id": 3, "name": "removed"})]),
                step(3, StepKind::Save, StepState::Initial, vec![]),
            ])
            .unwrap();

        let roller = Roller::new(&db, &models, LOG);
        roller.roll_one(&mut record).unwrap();

        let people = db.find("people", &Document::new(), None).unwrap();
        assert_eq!(
            people.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({"_id": 2, "name": "before"}), json!({"_id": 3, "name": "removed"})]
        );
        assert!(record.steps[..3].iter().all(|s| s.state == StepState::Rolled));
        assert_eq!(record.steps[3].state, StepState::Initial);
        assert!(log.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_pending_save_only_removes_its_own_document() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        db.insert_one("people", doc(json!({"_id": 1, "name": "Ann"}))).unwrap();
        db.insert_one("people", doc(json!({"_id": 2, "name": "New"}))).unwrap();

        let log = StepLog::new(&db, LOG);
        let mut record = log
            .create(vec![
                step(0, StepKind::Save, StepState::Pending, vec![json!({"_id": 1, "name": "Other"})]),
                step(1, StepKind::Save, StepState::Pending, vec![json!({"_id": 2, "name": "New"})]),
            ])
            .unwrap();

        Roller::new(&db, &models, LOG).roll_one(&mut record).unwrap();
        let people = db.find("people", &Document::new(), None).unwrap();
        assert_eq!(people.into_iter().map(Value::Object).collect::<Vec<_>>(), vec![json!({"_id": 1, "name": "Ann"})]);
        assert!(log.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_roll_one_skips_untouched_task() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        db.insert_one("people", doc(json!({"_id": 1}))).unwrap();

        let log = StepLog::new(&db, LOG);
        let mut record = log
            .create(vec![
                step(0, StepKind::Save, StepState::Initial, vec![]),
                step(1, StepKind::Save, StepState::Done, vec![json!({"_id": 1})]),
            ])
            .unwrap();

        Roller::new(&db, &models, LOG).roll_one(&mut record).unwrap();
        assert_eq!(db.count("people", &Document::new()).unwrap(), 1);
        assert!(log.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_roll_one_skips_finished_task() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        db.insert_one("people", doc(json!({"_id": 1}))).unwrap();

        let log = StepLog::new(&db, LOG);
        let mut record = log
            .create(vec![step(0, StepKind::Save, StepState::Done, vec![json!({"_id": 1})])])
            .unwrap();

        Roller::new(&db, &models, LOG).roll_one(&mut record).unwrap();
        assert_eq!(db.count("people", &Document::new()).unwrap(), 1);
        assert!(log.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_roll_one_is_idempotent() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        db.insert_one("people", doc(json!({"_id": 7, "v": 1}))).unwrap();

        let log = StepLog::new(&db, LOG);
        let steps = vec![
            step(0, StepKind::Remove, StepState::Rolled, vec![json!({"_id": 9, "v": 0})]),
            step(1, StepKind::Remove, StepState::Pending, vec![json!({"_id": 7, "v": 1})]),
            step(2, StepKind::Save, StepState::Initial, vec![]),
        ];
        let mut record = log.create(steps).unwrap();

        Roller::new(&db, &models, LOG).roll_one(&mut record).unwrap();
        let people = db.find("people", &Document::new(), None).unwrap();
        assert_eq!(people, vec![doc(json!({"_id": 7, "v": 1}))]);
    }

    #[test]
    fn test_roll_all_settles_every_record() {
        let db = Database::in_memory();
        let models = ModelRegistry::new();
        let log = StepLog::new(&db, LOG);
        for id in 0..3 {
            db.insert_one("people", doc(json!({"_id": id}))).unwrap();
            log.create(vec![
                step(0, StepKind::Save, StepState::Done, vec![json!({"_id": id})]),
                step(1, StepKind::Save, StepState::Initial, vec![]),
            ])
            .unwrap();
        }

        let roller = Roller::new(&db, &models, LOG);
        assert_eq!(roller.roll_all().unwrap(), 3);
        assert_eq!(db.count("people", &Document::new()).unwrap(), 0);
        assert_eq!(roller.roll_all().unwrap(), 0);
    }
}
