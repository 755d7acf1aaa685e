use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::engine::{ExitInfo, JobEngine, RunId, RunStatus};
use crate::events::{EventMeta, InProcEventBus, RunEvent, RunEventPayload};
use crate::record::{
    BusinessKey, NewExecutionRecord, RecordId, RecordStatus, StatusUpdate, Transition,
};
use crate::registry::{CancellationRegistry, WorkerHandle};
use crate::store::ExecutionRecordStore;
use crate::telemetry;

use super::task::{LongRunningTask, TaskContext, WorkerError};

/// What to run and which record to report into.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub job_name: String,
    pub business_key: BusinessKey,
    /// Existing record to drive; a new one is created when `None`.
    pub record_id: Option<RecordId>,
    pub run_id: RunId,
}

/// Final outcome of one worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub run_id: RunId,
    pub record_id: RecordId,
    pub status: RecordStatus,
    pub error: Option<String>,
    pub cancelled: bool,
}

/// Handle to a dispatched worker. Dropping it detaches the worker.
#[derive(Debug)]
pub struct DispatchHandle {
    run_id: RunId,
    record_id: RecordId,
    join: JoinHandle<WorkerReport>,
}

impl DispatchHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker to finish.
    pub async fn join(self) -> anyhow::Result<WorkerReport> {
        self.join
            .await
            .map_err(|err| anyhow::anyhow!("worker for run {} did not finish: {err}", self.run_id))
    }

    pub fn into_join_handle(self) -> JoinHandle<WorkerReport> {
        self.join
    }
}

/// Runs [`LongRunningTask`]s on their own tokio task and keeps the
/// execution record and the cancellation registry consistent with them.
///
/// Every worker moves its record to `Processing`, registers its
/// [`WorkerHandle`], runs the task, writes `Completed` or `Failed`, and
/// clears its registry entry last, whatever happened before. The entry is
/// cleared even when a store or engine call panics after the task.
#[derive(Clone)]
pub struct AsyncWorkerDispatcher {
    store: Arc<dyn ExecutionRecordStore>,
    registry: CancellationRegistry,
    engine: Option<Arc<dyn JobEngine>>,
    events: Option<InProcEventBus>,
    config: WorkerConfig,
}

impl fmt::Debug for AsyncWorkerDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncWorkerDispatcher")
            .field("registry", &self.registry)
            .field("engine_set", &self.engine.is_some())
            .field("events_set", &self.events.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl AsyncWorkerDispatcher {
    pub fn new(
        store: Arc<dyn ExecutionRecordStore>,
        registry: CancellationRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            engine: None,
            events: None,
            config,
        }
    }

    /// Report worker outcomes to the engine.
    pub fn with_engine(mut self, engine: Arc<dyn JobEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Publish lifecycle events on `events`.
    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start `task` for the run in `request` and return without waiting.
    ///
    /// Fails only when the record cannot be created; everything after that
    /// is reported through the record and never as an error here.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        task: Arc<dyn LongRunningTask>,
    ) -> anyhow::Result<DispatchHandle> {
        let record_id = match request.record_id {
            Some(id) => id,
            None => {
                let new = NewExecutionRecord::new(request.job_name.clone())
                    .with_business_key(request.business_key.clone())
                    .with_run_id(request.run_id);
                self.store.insert(new).await?.id
            }
        };

        let run_id = request.run_id;
        let worker = self.clone();
        let job_name = request.job_name.clone();
        let fut = async move { worker.run_worker(request, record_id, task).await };
        let join = tokio::spawn(telemetry::instrument_dispatch(run_id, job_name, fut));

        debug!(run_id = %run_id, record_id = %record_id, "worker dispatched");
        Ok(DispatchHandle {
            run_id,
            record_id,
            join,
        })
    }

    async fn run_worker(
        &self,
        request: DispatchRequest,
        record_id: RecordId,
        task: Arc<dyn LongRunningTask>,
    ) -> WorkerReport {
        let run_id = request.run_id;
        let entry = ClearOnDrop {
            registry: &self.registry,
            run_id,
        };
        let timing = telemetry::record_worker_start(&request.job_name);
        let handle = WorkerHandle::new();

        let outcome = self
            .execute(&request, record_id, handle.clone(), task)
            .await;

        let (update, label) = match &outcome {
            Ok(()) => (StatusUpdate::now(RecordStatus::Completed), "completed"),
            Err(err) if err.is_cancelled() => (StatusUpdate::failed(err.to_string()), "cancelled"),
            Err(err) => (StatusUpdate::failed(err.to_string()), "failed"),
        };
        match &outcome {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                info!(run_id = %run_id, business_key = %request.business_key, "run stopped on request");
            }
            Err(err) => {
                error!(run_id = %run_id, business_key = %request.business_key, error = %err, "run failed");
            }
        }

        let status = match self.store.transition(record_id, update).await {
            Ok((Transition::Applied, record)) => record.status,
            Ok((Transition::Ignored, record)) => {
                warn!(run_id = %run_id, status = %record.status, "record was already closed");
                record.status
            }
            Err(err) => {
                error!(run_id = %run_id, record_id = %record_id, "terminal write failed: {err:#}");
                RecordStatus::Failed
            }
        };

        self.report_to_engine(run_id, &outcome).await;
        let elapsed = telemetry::record_worker_end(timing, label);
        self.publish(
            run_id,
            record_id,
            &request.business_key,
            match &outcome {
                Ok(()) => RunEventPayload::Completed {
                    duration_ms: elapsed.as_millis() as i64,
                },
                Err(err) => RunEventPayload::Failed {
                    reason: err.to_string(),
                    cancelled: err.is_cancelled(),
                },
            },
        );
        telemetry::record_run_finished(run_id, &request.job_name, label);

        drop(entry);

        let error = outcome.as_ref().err().map(ToString::to_string);
        let cancelled = outcome.as_ref().err().map(WorkerError::is_cancelled).unwrap_or(false);
        WorkerReport {
            run_id,
            record_id,
            status,
            error,
            cancelled,
        }
    }

    async fn execute(
        &self,
        request: &DispatchRequest,
        record_id: RecordId,
        handle: WorkerHandle,
        task: Arc<dyn LongRunningTask>,
    ) -> Result<(), WorkerError> {
        let run_id = request.run_id;

        match self
            .store
            .transition(record_id, StatusUpdate::now(RecordStatus::Processing))
            .await
        {
            Ok((Transition::Applied, _)) => {}
            Ok((Transition::Ignored, record)) => {
                return Err(WorkerError::Store(format!(
                    "record {record_id} is already {}",
                    record.status
                )));
            }
            Err(err) => return Err(WorkerError::Store(format!("{err:#}"))),
        }
        self.publish(
            run_id,
            record_id,
            &request.business_key,
            RunEventPayload::Processing {
                job_name: request.job_name.clone(),
            },
        );

        if self.registry.register(run_id, handle.clone()) {
            return Err(WorkerError::Cancelled);
        }
        info!(run_id = %run_id, business_key = %request.business_key, "worker processing");

        let ctx = TaskContext::new(
            run_id,
            record_id,
            request.business_key.clone(),
            request.job_name.clone(),
            handle,
            self.registry.clone(),
            self.config.clone(),
        );

        match AssertUnwindSafe(task.run(ctx)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(WorkerError::from_task(err)),
            Err(panic) => Err(WorkerError::Panicked(panic_message(&*panic))),
        }
    }

    async fn report_to_engine(&self, run_id: RunId, outcome: &Result<(), WorkerError>) {
        let Some(engine) = &self.engine else {
            return;
        };
        let (status, exit) = match outcome {
            Ok(()) => (RunStatus::Completed, ExitInfo::completed()),
            Err(err) if err.is_cancelled() => (RunStatus::Stopped, ExitInfo::stopped(err.to_string())),
            Err(err) => (RunStatus::Failed, ExitInfo::failed(err.to_string())),
        };
        if let Err(err) = engine.finish_run(run_id, status, exit).await {
            warn!(run_id = %run_id, "engine finish_run failed: {err}");
        }
    }

    fn publish(
        &self,
        run_id: RunId,
        record_id: RecordId,
        business_key: &BusinessKey,
        payload: RunEventPayload,
    ) {
        if let Some(events) = &self.events {
            let meta = EventMeta::new(run_id, record_id, business_key.clone());
            events.publish_run(RunEvent::new(meta, payload));
        }
    }
}

/// Clears the run's registry entry when dropped, including on unwind.
struct ClearOnDrop<'a> {
    registry: &'a CancellationRegistry,
    run_id: RunId,
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.clear(self.run_id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ExecutionRecord;
    use crate::runtime::task::{task_fn, SimulatedWorkload};
    use crate::store::InMemoryRecordStore;
    use std::time::Duration;
    use tokio::time::timeout;

    fn dispatcher(store: Arc<InMemoryRecordStore>, registry: CancellationRegistry) -> AsyncWorkerDispatcher {
        let config = WorkerConfig::default()
            .with_step_interval(10)
            .with_simulation_steps(3);
        AsyncWorkerDispatcher::new(store, registry, config)
    }

    fn request(run_id: RunId) -> DispatchRequest {
        DispatchRequest {
            job_name: "testJob".to_string(),
            business_key: BusinessKey::generate(),
            record_id: None,
            run_id,
        }
    }

    #[tokio::test]
    async fn test_dispatch_creates_record_and_completes() {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = CancellationRegistry::default();
        let run_id = RunId::new();

        let handle = dispatcher(store.clone(), registry.clone())
            .dispatch(request(run_id), Arc::new(SimulatedWorkload::new()))
            .await
            .unwrap();
        let report = timeout(Duration::from_secs(2), handle.join()).await.unwrap().unwrap();

        assert_eq!(report.status, RecordStatus::Completed);
        assert!(report.error.is_none());
        let record = store.find_by_run(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert!(record.end_time.unwrap() >= record.start_time.unwrap());
        assert!(!registry.contains(run_id));
    }

    #[tokio::test]
    async fn test_stop_before_dispatch_fails_immediately() {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = CancellationRegistry::default();
        let run_id = RunId::new();
        registry.request_stop(run_id);

        let handle = dispatcher(store.clone(), registry.clone())
            .dispatch(request(run_id), Arc::new(SimulatedWorkload::new().with_steps(1_000)))
            .await
            .unwrap();
        let report = timeout(Duration::from_secs(2), handle.join()).await.unwrap().unwrap();

        assert_eq!(report.status, RecordStatus::Failed);
        assert!(report.cancelled);
        assert!(!registry.contains(run_id));
    }

    #[tokio::test]
    async fn test_task_error_is_recorded_as_failed() {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = CancellationRegistry::default();
        let run_id = RunId::new();
        let task = task_fn(|_ctx| async { Err::<(), _>(anyhow::anyhow!("upstream unavailable")) });

        let handle = dispatcher(store.clone(), registry.clone())
            .dispatch(request(run_id), Arc::new(task))
            .await
            .unwrap();
        let report = handle.join().await.unwrap();

        assert_eq!(report.status, RecordStatus::Failed);
        assert!(!report.cancelled);
        let record = store.find_by_run(run_id).await.unwrap().unwrap();
        assert!(record.failure.unwrap().contains("upstream unavailable"));
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_task_panic_is_contained() {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = CancellationRegistry::default();
        let run_id = RunId::new();
        let task = task_fn(|_ctx| async {
            if true {
                panic!("boom");
            }
            Ok::<(), anyhow::Error>(())
        });

        let handle = dispatcher(store.clone(), registry.clone())
            .dispatch(request(run_id), Arc::new(task))
            .await
            .unwrap();
        let report = handle.join().await.unwrap();

        assert_eq!(report.status, RecordStatus::Failed);
        assert!(report.error.unwrap().contains("boom"));
        assert!(!registry.contains(run_id));
    }

    /// Store whose terminal writes panic.
    struct PanicOnTerminalStore {
        inner: InMemoryRecordStore,
    }

    #[async_trait::async_trait]
    impl ExecutionRecordStore for PanicOnTerminalStore {
        async fn insert(&self, new: NewExecutionRecord) -> anyhow::Result<ExecutionRecord> {
            self.inner.insert(new).await
        }

        async fn get(&self, id: RecordId) -> anyhow::Result<Option<ExecutionRecord>> {
            self.inner.get(id).await
        }

        async fn find_by_run(&self, run_id: RunId) -> anyhow::Result<Option<ExecutionRecord>> {
            self.inner.find_by_run(run_id).await
        }

        async fn assign_run_id(
            &self,
            id: RecordId,
            run_id: RunId,
        ) -> anyhow::Result<ExecutionRecord> {
            self.inner.assign_run_id(id, run_id).await
        }

        async fn transition(
            &self,
            id: RecordId,
            update: StatusUpdate,
        ) -> anyhow::Result<(Transition, ExecutionRecord)> {
            if update.status.is_terminal() {
                panic!("terminal write exploded");
            }
            self.inner.transition(id, update).await
        }

        async fn list(&self) -> anyhow::Result<Vec<ExecutionRecord>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_registry_entry_cleared_when_terminal_write_panics() {
        let store = Arc::new(PanicOnTerminalStore {
            inner: InMemoryRecordStore::new(),
        });
        let registry = CancellationRegistry::default();
        let run_id = RunId::new();

        let dispatcher = AsyncWorkerDispatcher::new(
            store,
            registry.clone(),
            WorkerConfig::default().with_step_interval(5).with_simulation_steps(1),
        );
        let handle = dispatcher
            .dispatch(request(run_id), Arc::new(SimulatedWorkload::new()))
            .await
            .unwrap();

        let joined = timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert!(joined.is_err());
        assert!(!registry.contains(run_id));
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = CancellationRegistry::default();
        let bus = InProcEventBus::new(16);
        let mut rx = bus.subscribe();
        let run_id = RunId::new();

        let handle = dispatcher(store, registry)
            .with_events(bus.clone())
            .dispatch(request(run_id), Arc::new(SimulatedWorkload::new().with_steps(1)))
            .await
            .unwrap();
        handle.join().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.payload, RunEventPayload::Processing { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.payload, RunEventPayload::Completed { .. }));
        assert_eq!(second.run_id(), run_id);
    }
}
