use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::engine::RunId;
use crate::record::{
    ExecutionRecord, NewExecutionRecord, RecordError, RecordId, StatusUpdate, Transition,
};

/// Trait for backends that persist [`ExecutionRecord`]s.
///
/// Implementors enforce the record state machine on every write:
/// [`transition`](Self::transition) rejects backwards moves with a
/// [`RecordError`] (retrievable through `anyhow::Error::downcast_ref`) and
/// reports writes against terminal records as [`Transition::Ignored`].
#[async_trait]
pub trait ExecutionRecordStore: Send + Sync {
    /// Persist a fresh `Created` record.
    async fn insert(&self, new: NewExecutionRecord) -> anyhow::Result<ExecutionRecord>;

    /// Look up a record by id.
    async fn get(&self, id: RecordId) -> anyhow::Result<Option<ExecutionRecord>>;

    /// Look up the record bound to an engine run.
    async fn find_by_run(&self, run_id: RunId) -> anyhow::Result<Option<ExecutionRecord>>;

    /// Bind an engine run id to a record. Set-once.
    async fn assign_run_id(&self, id: RecordId, run_id: RunId)
        -> anyhow::Result<ExecutionRecord>;

    /// Apply a status change and return the outcome with the resulting record.
    async fn transition(
        &self,
        id: RecordId,
        update: StatusUpdate,
    ) -> anyhow::Result<(Transition, ExecutionRecord)>;

    /// Every record, in no particular order.
    async fn list(&self) -> anyhow::Result<Vec<ExecutionRecord>>;
}

/// Order records most recently started first; records that never started
/// go last, newest creation first.
pub fn sort_most_recent_first(records: &mut [ExecutionRecord]) {
    records.sort_by(|a, b| match (a.start_time, b.start_time) {
        (Some(a_start), Some(b_start)) => b_start.cmp(&a_start),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.created_at.cmp(&a.created_at),
    });
}

/// Process-local record store.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<RecordId, ExecutionRecord>>>,
    by_run: Arc<RwLock<HashMap<RunId, RecordId>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ExecutionRecordStore for InMemoryRecordStore {
    async fn insert(&self, new: NewExecutionRecord) -> anyhow::Result<ExecutionRecord> {
        let record = ExecutionRecord::new(new);

        let mut records = self.records.write();
        if let Some(run_id) = record.run_id {
            let mut by_run = self.by_run.write();
            if let Some(existing) = by_run.get(&run_id) {
                anyhow::bail!("run {} is already bound to record {}", run_id, existing);
            }
            by_run.insert(run_id, record.id);
        }
        records.insert(record.id, record.clone());

        debug!(record_id = %record.id, business_key = %record.business_key, "record created");
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> anyhow::Result<Option<ExecutionRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn find_by_run(&self, run_id: RunId) -> anyhow::Result<Option<ExecutionRecord>> {
        let records = self.records.read();
        let by_run = self.by_run.read();
        Ok(by_run.get(&run_id).and_then(|id| records.get(id)).cloned())
    }

    async fn assign_run_id(
        &self,
        id: RecordId,
        run_id: RunId,
    ) -> anyhow::Result<ExecutionRecord> {
        let mut records = self.records.write();
        let mut by_run = self.by_run.write();

        let record = records.get_mut(&id).ok_or(RecordError::NotFound(id))?;
        if let Some(owner) = by_run.get(&run_id) {
            if *owner != id {
                anyhow::bail!("run {} is already bound to record {}", run_id, owner);
            }
        }
        record.assign_run_id(run_id)?;
        by_run.insert(run_id, id);
        Ok(record.clone())
    }

    async fn transition(
        &self,
        id: RecordId,
        update: StatusUpdate,
    ) -> anyhow::Result<(Transition, ExecutionRecord)> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(RecordError::NotFound(id))?;
        let target = update.status;
        let outcome = record.apply(update)?;

        if outcome == Transition::Ignored {
            debug!(
                record_id = %id,
                status = %record.status,
                requested = %target,
                "write to terminal record ignored"
            );
        }
        Ok((outcome, record.clone()))
    }

    async fn list(&self) -> anyhow::Result<Vec<ExecutionRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordStatus;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = InMemoryRecordStore::new();
        let run_id = RunId::new();
        let rec = store
            .insert(NewExecutionRecord::new("jobA").with_run_id(run_id))
            .await
            .unwrap();

        assert_eq!(rec.status, RecordStatus::Created);
        assert_eq!(store.get(rec.id).await.unwrap(), Some(rec.clone()));
        assert_eq!(store.find_by_run(run_id).await.unwrap(), Some(rec));
        assert!(store.find_by_run(RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_assign_run_id_indexes_record() {
        let store = InMemoryRecordStore::new();
        let rec = store.insert(NewExecutionRecord::new("jobA")).await.unwrap();
        let run_id = RunId::new();

        let updated = store.assign_run_id(rec.id, run_id).await.unwrap();
        assert_eq!(updated.run_id, Some(run_id));
        assert_eq!(store.find_by_run(run_id).await.unwrap().map(|r| r.id), Some(rec.id));

        let err = store.assign_run_id(rec.id, RunId::new()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecordError>(),
            Some(RecordError::RunIdAlreadyAssigned { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_id_cannot_be_shared() {
        let store = InMemoryRecordStore::new();
        let run_id = RunId::new();
        let first = store.insert(NewExecutionRecord::new("jobA")).await.unwrap();
        let second = store.insert(NewExecutionRecord::new("jobA")).await.unwrap();

        store.assign_run_id(first.id, run_id).await.unwrap();
        assert!(store.assign_run_id(second.id, run_id).await.is_err());
        assert!(store.get(second.id).await.unwrap().unwrap().run_id.is_none());
    }

    #[tokio::test]
    async fn test_transition_enforces_state_machine() {
        let store = InMemoryRecordStore::new();
        let rec = store.insert(NewExecutionRecord::new("jobA")).await.unwrap();

        let (outcome, rec) = store
            .transition(rec.id, StatusUpdate::now(RecordStatus::Processing))
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Applied);
        assert!(rec.start_time.is_some());

        let err = store
            .transition(rec.id, StatusUpdate::now(RecordStatus::Started))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecordError>(),
            Some(RecordError::InvalidTransition { .. })
        ));

        store
            .transition(rec.id, StatusUpdate::now(RecordStatus::Completed))
            .await
            .unwrap();
        let (outcome, rec) = store
            .transition(rec.id, StatusUpdate::failed("late"))
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Ignored);
        assert_eq!(rec.status, RecordStatus::Completed);
        assert!(rec.failure.is_none());
    }

    #[tokio::test]
    async fn test_transition_missing_record() {
        let store = InMemoryRecordStore::new();
        let err = store
            .transition(RecordId::new(), StatusUpdate::now(RecordStatus::Started))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<RecordError>(), Some(RecordError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sort_most_recent_first() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for offset in [10, 30, 20] {
            let rec = store.insert(NewExecutionRecord::new("jobA")).await.unwrap();
            let update = StatusUpdate {
                status: RecordStatus::Started,
                at: now + Duration::seconds(offset),
                failure: None,
            };
            store.transition(rec.id, update).await.unwrap();
            ids.push(rec.id);
        }
        let never_started = store.insert(NewExecutionRecord::new("jobA")).await.unwrap();

        let mut records = store.list().await.unwrap();
        sort_most_recent_first(&mut records);
        let order: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0], never_started.id]);
    }
}
