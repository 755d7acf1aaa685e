use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::engine::{EngineError, ExitInfo, JobEngine, RunId, RunParameters, RunStatus};
use crate::events::{EventMeta, InProcEventBus, RunEvent, RunEventPayload};
use crate::record::{
    BusinessKey, ExecutionRecord, NewExecutionRecord, RecordId, RecordStatus, StatusUpdate,
};
use crate::registry::CancellationRegistry;
use crate::store::{sort_most_recent_first, ExecutionRecordStore};
use crate::telemetry;

use super::dispatcher::{AsyncWorkerDispatcher, DispatchRequest, WorkerReport};
use super::task::LongRunningTask;

/// Errors surfaced to callers of the [`Orchestrator`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("job {0:?} not found")]
    JobNotFound(String),

    #[error("job {0:?} is already running")]
    AlreadyRunning(String),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("record {0} not found")]
    RecordNotFound(RecordId),

    #[error("job engine error: {0}")]
    Engine(#[source] EngineError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownJob(name) => OrchestratorError::JobNotFound(name),
            EngineError::AlreadyRunning(name) => OrchestratorError::AlreadyRunning(name),
            other => OrchestratorError::Engine(other),
        }
    }
}

/// Result of a successful launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Launched {
    pub run_id: RunId,
    pub record_id: RecordId,
    pub business_key: BusinessKey,
    pub status: RecordStatus,
}

/// Launch, stop and query façade over the job engine, the record store and
/// the worker dispatcher.
pub struct Orchestrator<E, S>
where
    E: JobEngine + 'static,
    S: ExecutionRecordStore + 'static,
{
    config: OrchestratorConfig,
    engine: Arc<E>,
    store: Arc<S>,
    registry: CancellationRegistry,
    dispatcher: AsyncWorkerDispatcher,
    events: InProcEventBus,
    tasks: HashMap<String, Arc<dyn LongRunningTask>>,
    workers: Mutex<HashMap<RunId, JoinHandle<WorkerReport>>>,
}

impl<E, S> fmt::Debug for Orchestrator<E, S>
where
    E: JobEngine + 'static,
    S: ExecutionRecordStore + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut jobs: Vec<&String> = self.tasks.keys().collect();
        jobs.sort();
        let worker_count = self
            .workers
            .try_lock()
            .map(|workers| workers.len())
            .unwrap_or_default();

        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("engine_type", &type_name::<E>())
            .field("store_type", &type_name::<S>())
            .field("jobs", &jobs)
            .field("registry", &self.registry)
            .field("worker_count", &worker_count)
            .finish()
    }
}

impl<E, S> Orchestrator<E, S>
where
    E: JobEngine + 'static,
    S: ExecutionRecordStore + 'static,
{
    /// Create an orchestrator; prefer [`OrchestratorBuilder`](super::OrchestratorBuilder).
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<E>,
        store: Arc<S>,
        registry: CancellationRegistry,
        events: InProcEventBus,
        tasks: HashMap<String, Arc<dyn LongRunningTask>>,
    ) -> Self {
        let engine_dyn: Arc<dyn JobEngine> = engine.clone();
        let store_dyn: Arc<dyn ExecutionRecordStore> = store.clone();
        let dispatcher = AsyncWorkerDispatcher::new(store_dyn, registry.clone(), config.worker.clone())
            .with_engine(engine_dyn)
            .with_events(events.clone());

        Self {
            config,
            engine,
            store,
            registry,
            dispatcher,
            events,
            tasks,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<E> {
        Arc::clone(&self.engine)
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn events(&self) -> &InProcEventBus {
        &self.events
    }

    /// Subscribe to run lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Names of the jobs this orchestrator can launch, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Launch the configured default job.
    pub async fn launch_default(&self) -> Result<Launched, OrchestratorError> {
        let job = self.config.default_job.clone();
        self.launch(&job).await
    }

    /// Launch `job_name` and return as soon as its worker is dispatched.
    ///
    /// The record is created before the engine run so that a launch rejected
    /// by the engine still leaves a `Failed` trace.
    pub async fn launch(&self, job_name: &str) -> Result<Launched, OrchestratorError> {
        self.launch_inner(job_name)
            .instrument(telemetry::launch_span(job_name))
            .await
    }

    async fn launch_inner(&self, job_name: &str) -> Result<Launched, OrchestratorError> {
        let task = self
            .tasks
            .get(job_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::JobNotFound(job_name.to_string()))?;

        let running = self.engine.list_running_runs(job_name).await?;
        if !running.is_empty() {
            info!(job_name, active = running.len(), "launch rejected: run already active");
            return Err(OrchestratorError::AlreadyRunning(job_name.to_string()));
        }

        let business_key = BusinessKey::generate();
        let record = self
            .store
            .insert(NewExecutionRecord::new(job_name).with_business_key(business_key.clone()))
            .await?;

        let params = RunParameters::new()
            .with("businessKey", business_key.as_str())
            .with("time", Utc::now().timestamp_millis());
        let run_id = match self.engine.run_job(job_name, params).await {
            Ok(run_id) => run_id,
            Err(err) => {
                warn!(job_name, record_id = %record.id, "engine refused run: {err}");
                if let Err(store_err) = self
                    .store
                    .transition(record.id, StatusUpdate::failed(format!("launch rejected: {err}")))
                    .await
                {
                    error!(record_id = %record.id, "failed to close rejected record: {store_err:#}");
                }
                return Err(err.into());
            }
        };

        let started = async {
            self.store.assign_run_id(record.id, run_id).await?;
            let (_, record) = self
                .store
                .transition(record.id, StatusUpdate::now(RecordStatus::Started))
                .await?;
            Ok::<_, anyhow::Error>(record)
        }
        .await;
        let started = match started {
            Ok(record) => record,
            Err(err) => {
                self.abandon(run_id, record.id, &err).await;
                return Err(err.into());
            }
        };

        self.events.publish_run(RunEvent::new(
            EventMeta::new(run_id, record.id, business_key.clone()),
            RunEventPayload::Launched {
                job_name: job_name.to_string(),
            },
        ));

        let request = DispatchRequest {
            job_name: job_name.to_string(),
            business_key: business_key.clone(),
            record_id: Some(record.id),
            run_id,
        };
        let handle = match self.dispatcher.dispatch(request, task).await {
            Ok(handle) => handle,
            Err(err) => {
                self.abandon(run_id, record.id, &err).await;
                return Err(err.into());
            }
        };
        {
            let mut workers = self.workers.lock();
            workers.retain(|_, join| !join.is_finished());
            workers.insert(run_id, handle.into_join_handle());
        }
        telemetry::record_run_launched(run_id, job_name);

        Ok(Launched {
            run_id,
            record_id: record.id,
            business_key,
            status: started.status,
        })
    }

    /// Close out a launch that got an engine run but could not dispatch.
    async fn abandon(&self, run_id: RunId, record_id: RecordId, cause: &anyhow::Error) {
        error!(run_id = %run_id, record_id = %record_id, "launch abandoned: {cause:#}");
        if let Err(err) = self
            .store
            .transition(record_id, StatusUpdate::failed(format!("dispatch failed: {cause}")))
            .await
        {
            error!(record_id = %record_id, "failed to close abandoned record: {err:#}");
        }
        let exit = ExitInfo::failed(format!("dispatch failed: {cause}"));
        if let Err(err) = self
            .engine
            .finish_run(run_id, RunStatus::Failed, exit)
            .await
        {
            warn!(run_id = %run_id, "engine finish_run failed: {err}");
        }
        self.registry.clear(run_id);
    }

    /// Request that `run_id` stop.
    ///
    /// Returns `false` only when neither a record nor an engine run exists.
    /// A run that already finished yields `true` without side effects. The
    /// request itself is best-effort: the worker fails with a cancellation at
    /// its next suspension point.
    pub async fn stop(&self, run_id: RunId) -> Result<bool, OrchestratorError> {
        self.stop_inner(run_id)
            .instrument(telemetry::stop_span(run_id))
            .await
    }

    async fn stop_inner(&self, run_id: RunId) -> Result<bool, OrchestratorError> {
        let record = self.store.find_by_run(run_id).await?;
        if let Some(record) = &record {
            if record.is_terminal() {
                telemetry::record_stop_request(run_id, "noop");
                return Ok(true);
            }
        }

        match self.engine.get_run(run_id).await {
            Ok(None) if record.is_none() => {
                telemetry::record_stop_request(run_id, "not_found");
                return Ok(false);
            }
            Ok(Some(run)) if record.is_none() && run.status.is_terminal() => {
                telemetry::record_stop_request(run_id, "noop");
                return Ok(true);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(run_id = %run_id, "engine lookup failed, flagging run anyway: {err}");
            }
        }

        self.registry.request_stop(run_id);
        let engine_accepted = match self.engine.stop_run(run_id).await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(run_id = %run_id, "engine stop failed: {err}");
                false
            }
        };
        debug!(run_id = %run_id, engine_accepted, "stop forwarded to engine");

        if let Some(record) = record {
            self.events.publish_run(RunEvent::new(
                EventMeta::new(run_id, record.id, record.business_key),
                RunEventPayload::StopRequested { engine_accepted },
            ));
        }
        telemetry::record_stop_request(run_id, "flagged");
        Ok(true)
    }

    /// Record for an engine run.
    pub async fn status(&self, run_id: RunId) -> Result<ExecutionRecord, OrchestratorError> {
        self.store
            .find_by_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// Record by its own id.
    pub async fn record(&self, record_id: RecordId) -> Result<ExecutionRecord, OrchestratorError> {
        self.store
            .get(record_id)
            .await?
            .ok_or(OrchestratorError::RecordNotFound(record_id))
    }

    /// Every record, most recently started first.
    pub async fn list_all(&self) -> Result<Vec<ExecutionRecord>, OrchestratorError> {
        let mut records = self.store.list().await?;
        sort_most_recent_first(&mut records);
        Ok(records)
    }

    /// Records that have not reached a terminal status, most recent first.
    pub async fn list_running(&self) -> Result<Vec<ExecutionRecord>, OrchestratorError> {
        let mut records = self.list_all().await?;
        records.retain(|record| !record.is_terminal());
        Ok(records)
    }

    /// Whether the engine reports an active run of `job_name`.
    pub async fn has_running(&self, job_name: &str) -> Result<bool, OrchestratorError> {
        Ok(!self.engine.list_running_runs(job_name).await?.is_empty())
    }

    /// Number of workers still tracked. Finished workers are dropped here and
    /// on every launch.
    pub fn tracked_workers(&self) -> usize {
        let mut workers = self.workers.lock();
        workers.retain(|_, join| !join.is_finished());
        workers.len()
    }

    /// Wait for the worker of a run launched by this orchestrator.
    ///
    /// Returns `None` when no worker is tracked for `run_id`: it was already
    /// awaited, or it finished before a later launch dropped its handle. The
    /// record still carries the outcome in that case.
    pub async fn wait(&self, run_id: RunId) -> Result<Option<WorkerReport>, OrchestratorError> {
        let join = self.workers.lock().remove(&run_id);
        let Some(join) = join else {
            return Ok(None);
        };
        let report = join
            .await
            .map_err(|err| anyhow::anyhow!("worker for run {run_id} did not finish: {err}"))?;
        Ok(Some(report))
    }

    /// Stop every tracked worker and wait for each up to the shutdown timeout.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Initiating graceful shutdown of orchestrator");

        let workers: Vec<(RunId, JoinHandle<WorkerReport>)> = {
            let mut guard = self.workers.lock();
            guard.drain().collect()
        };

        for (run_id, join) in &workers {
            if !join.is_finished() {
                self.registry.request_stop(*run_id);
                if let Err(err) = self.engine.stop_run(*run_id).await {
                    debug!(run_id = %run_id, "engine stop during shutdown failed: {err}");
                }
            }
        }

        let timeout = self.config.shutdown_timeout();
        for (run_id, join) in workers {
            match tokio::time::timeout(timeout, join).await {
                Ok(Ok(report)) => {
                    debug!(run_id = %run_id, status = %report.status, "worker finished")
                }
                Ok(Err(e)) => warn!(run_id = %run_id, "Worker task failed: {:?}", e),
                Err(_) => warn!(run_id = %run_id, "Worker task timed out during shutdown"),
            }
        }

        info!("Orchestrator shutdown complete");
        Ok(())
    }
}
