use async_trait::async_trait;
use chrono::Utc;
use conductor::{
    EngineError, ExitInfo, JobEngine, RunId, RunInfo, RunParameters, RunStatus, RunSummary,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Barrier;

/// In-memory [`JobEngine`] with a fixed job catalog.
///
/// Refuses a second active run of the same job, the way a real engine
/// arbitrates racing launches. Lookup and stop failures can be injected.
#[derive(Clone, Default)]
pub struct InMemoryJobEngine {
    catalog: Arc<Mutex<HashSet<String>>>,
    runs: Arc<Mutex<HashMap<RunId, StoredRun>>>,
    stop_calls: Arc<Mutex<Vec<RunId>>>,
    faults: Arc<Mutex<Faults>>,
    lookup_gate: Arc<Mutex<Option<LookupGate>>>,
}

#[derive(Debug)]
struct LookupGate {
    barrier: Arc<Barrier>,
    remaining: usize,
}

#[derive(Clone, Debug)]
struct StoredRun {
    info: RunInfo,
    params: RunParameters,
}

#[derive(Clone, Copy, Debug, Default)]
struct Faults {
    fail_lookups: bool,
    fail_stops: bool,
    allow_concurrent: bool,
}

impl InMemoryJobEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that knows the given job names.
    pub fn with_jobs<I, N>(jobs: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let engine = Self::new();
        for job in jobs {
            engine.register_job(job);
        }
        engine
    }

    pub fn register_job(&self, name: impl Into<String>) {
        self.catalog.lock().insert(name.into());
    }

    /// Make `get_run` fail until reset.
    pub fn set_lookup_failure(&self, fail: bool) {
        self.faults.lock().fail_lookups = fail;
    }

    /// Make `stop_run` fail until reset.
    pub fn set_stop_failure(&self, fail: bool) {
        self.faults.lock().fail_stops = fail;
    }

    /// Stop refusing concurrent runs of the same job.
    pub fn set_allow_concurrent(&self, allow: bool) {
        self.faults.lock().allow_concurrent = allow;
    }

    /// Hold the next `parties` calls to `list_running_runs` until all of
    /// them have taken their snapshot, then release them together.
    ///
    /// Concurrent launches all pass the running-run check this way and race
    /// into `run_job`. The gate disarms itself after `parties` calls.
    pub fn hold_running_lookups(&self, parties: usize) {
        *self.lookup_gate.lock() = Some(LookupGate {
            barrier: Arc::new(Barrier::new(parties)),
            remaining: parties,
        });
    }

    /// Insert a run directly, bypassing `run_job`.
    pub fn insert_run(&self, info: RunInfo) {
        self.runs.lock().insert(
            info.run_id,
            StoredRun {
                info,
                params: RunParameters::new(),
            },
        );
    }

    /// Run ids passed to `stop_run`, in call order.
    pub fn stop_calls(&self) -> Vec<RunId> {
        self.stop_calls.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn run(&self, run_id: RunId) -> Option<RunInfo> {
        self.runs.lock().get(&run_id).map(|run| run.info.clone())
    }

    pub fn params(&self, run_id: RunId) -> Option<RunParameters> {
        self.runs.lock().get(&run_id).map(|run| run.params.clone())
    }
}

#[async_trait]
impl JobEngine for InMemoryJobEngine {
    async fn run_job(&self, name: &str, params: RunParameters) -> Result<RunId, EngineError> {
        if !self.catalog.lock().contains(name) {
            return Err(EngineError::UnknownJob(name.to_string()));
        }
        let allow_concurrent = self.faults.lock().allow_concurrent;

        let mut runs = self.runs.lock();
        let active = runs
            .values()
            .any(|run| run.info.job_name == name && run.info.status.is_running());
        if active && !allow_concurrent {
            return Err(EngineError::AlreadyRunning(name.to_string()));
        }

        let run_id = RunId::new();
        runs.insert(
            run_id,
            StoredRun {
                info: RunInfo {
                    run_id,
                    job_name: name.to_string(),
                    status: RunStatus::Started,
                    start_time: Some(Utc::now()),
                    end_time: None,
                    exit: None,
                },
                params,
            },
        );
        tracing::debug!(run_id = %run_id, job_name = name, "engine run created");
        Ok(run_id)
    }

    async fn stop_run(&self, run_id: RunId) -> Result<bool, EngineError> {
        self.stop_calls.lock().push(run_id);
        if self.faults.lock().fail_stops {
            return Err(EngineError::Other(anyhow::anyhow!("injected stop failure")));
        }

        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if !run.info.status.is_running() {
            return Ok(false);
        }
        run.info.status = RunStatus::Stopping;
        Ok(true)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunInfo>, EngineError> {
        if self.faults.lock().fail_lookups {
            return Err(EngineError::Other(anyhow::anyhow!("injected lookup failure")));
        }
        Ok(self.run(run_id))
    }

    async fn list_running_runs(&self, name: &str) -> Result<HashSet<RunId>, EngineError> {
        let running: HashSet<RunId> = self
            .runs
            .lock()
            .values()
            .filter(|run| run.info.job_name == name && run.info.status.is_running())
            .map(|run| run.info.run_id)
            .collect();

        let barrier = {
            let mut gate = self.lookup_gate.lock();
            match gate.as_mut() {
                Some(held) => {
                    let barrier = Arc::clone(&held.barrier);
                    held.remaining -= 1;
                    if held.remaining == 0 {
                        *gate = None;
                    }
                    Some(barrier)
                }
                None => None,
            }
        };
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        Ok(running)
    }

    async fn list_all_runs(&self, name: &str) -> Result<Vec<RunSummary>, EngineError> {
        let mut runs: Vec<RunSummary> = self
            .runs
            .lock()
            .values()
            .filter(|run| run.info.job_name == name)
            .map(|run| RunSummary::from(&run.info))
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(runs)
    }

    async fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        exit: ExitInfo,
    ) -> Result<(), EngineError> {
        let mut runs = self.runs.lock();
        let run = runs.get_mut(&run_id).ok_or(EngineError::UnknownRun(run_id))?;
        if run.info.status.is_terminal() {
            return Ok(());
        }
        run.info.status = status;
        run.info.end_time = Some(Utc::now());
        run.info.exit = Some(exit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_job_is_rejected() {
        let engine = InMemoryJobEngine::with_jobs(["jobA"]);
        let err = engine.run_job("ghost", RunParameters::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownJob(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_concurrent_run_is_refused_until_finished() {
        let engine = InMemoryJobEngine::with_jobs(["jobA"]);
        let first = engine.run_job("jobA", RunParameters::new()).await.unwrap();
        let err = engine.run_job("jobA", RunParameters::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));

        engine
            .finish_run(first, RunStatus::Completed, ExitInfo::completed())
            .await
            .unwrap();
        assert!(engine.list_running_runs("jobA").await.unwrap().is_empty());
        engine.run_job("jobA", RunParameters::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_marks_run_stopping() {
        let engine = InMemoryJobEngine::with_jobs(["jobA"]);
        let run_id = engine.run_job("jobA", RunParameters::new()).await.unwrap();

        assert!(engine.stop_run(run_id).await.unwrap());
        assert_eq!(engine.run(run_id).unwrap().status, RunStatus::Stopping);
        // Still counts as active until the worker reports back.
        assert!(engine.list_running_runs("jobA").await.unwrap().contains(&run_id));

        engine
            .finish_run(run_id, RunStatus::Stopped, ExitInfo::stopped("stop requested"))
            .await
            .unwrap();
        assert!(!engine.stop_run(run_id).await.unwrap());
        assert_eq!(engine.stop_calls(), vec![run_id, run_id]);
    }

    #[tokio::test]
    async fn test_held_lookups_release_together() {
        let engine = InMemoryJobEngine::with_jobs(["jobA"]);
        engine.hold_running_lookups(2);

        let (first, second) = tokio::join!(
            engine.list_running_runs("jobA"),
            engine.list_running_runs("jobA")
        );
        assert!(first.unwrap().is_empty());
        assert!(second.unwrap().is_empty());

        // Disarmed: a third call does not wait.
        engine.run_job("jobA", RunParameters::new()).await.unwrap();
        assert_eq!(engine.list_running_runs("jobA").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let engine = InMemoryJobEngine::with_jobs(["jobA"]);
        engine.set_lookup_failure(true);
        engine.set_stop_failure(true);
        assert!(engine.get_run(RunId::new()).await.is_err());
        assert!(engine.stop_run(RunId::new()).await.is_err());
    }
}
