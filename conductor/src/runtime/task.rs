use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::engine::RunId;
use crate::record::{BusinessKey, RecordId};
use crate::registry::{CancellationRegistry, WorkerHandle};

/// Why a worker ended without completing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// A stop was requested and observed at a suspension point.
    #[error("run was cancelled")]
    Cancelled,

    /// The task returned an error.
    #[error("task failed: {0}")]
    Task(String),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The record store rejected a write the worker depends on.
    #[error("record store failed: {0}")]
    Store(String),
}

impl WorkerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }

    /// Classify an error returned by a task.
    pub(crate) fn from_task(err: anyhow::Error) -> Self {
        match err.downcast::<WorkerError>() {
            Ok(worker_err) => worker_err,
            Err(err) => WorkerError::Task(format!("{err:#}")),
        }
    }
}

/// Execution context handed to a [`LongRunningTask`].
///
/// Every suspension point goes through [`pause`](Self::pause), which returns
/// [`WorkerError::Cancelled`] as soon as a stop is requested for the run.
#[derive(Clone)]
pub struct TaskContext {
    run_id: RunId,
    record_id: RecordId,
    business_key: BusinessKey,
    job_name: String,
    handle: WorkerHandle,
    registry: CancellationRegistry,
    config: WorkerConfig,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("run_id", &self.run_id)
            .field("record_id", &self.record_id)
            .field("business_key", &self.business_key)
            .field("job_name", &self.job_name)
            .field("interrupted", &self.handle.is_interrupted())
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(
        run_id: RunId,
        record_id: RecordId,
        business_key: BusinessKey,
        job_name: String,
        handle: WorkerHandle,
        registry: CancellationRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            run_id,
            record_id,
            business_key,
            job_name,
            handle,
            registry,
            config,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn business_key(&self) -> &BusinessKey {
        &self.business_key
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn worker_config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Whether a stop has been requested for this run.
    pub fn should_stop(&self) -> bool {
        self.handle.is_interrupted() || self.registry.should_stop(self.run_id)
    }

    /// Fail with [`WorkerError::Cancelled`] if a stop has been requested.
    pub fn checkpoint(&self) -> Result<(), WorkerError> {
        if self.should_stop() {
            debug!(run_id = %self.run_id, "stop observed at checkpoint");
            return Err(WorkerError::Cancelled);
        }
        Ok(())
    }

    /// Sleep for `duration` unless woken by a stop request first.
    pub async fn pause(&self, duration: Duration) -> Result<(), WorkerError> {
        self.checkpoint()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.handle.interrupted() => {}
        }
        self.checkpoint()
    }

    /// Spend `total` in interruptible steps of the configured interval.
    pub async fn steps(&self, total: Duration) -> Result<(), WorkerError> {
        let step = self.config.step_interval().max(Duration::from_millis(1));
        let mut remaining = total;
        let mut done: u32 = 0;
        while !remaining.is_zero() {
            let slice = remaining.min(step);
            self.pause(slice).await?;
            remaining -= slice;
            done += 1;
            debug!(run_id = %self.run_id, step = done, "step finished");
        }
        Ok(())
    }
}

/// A unit of long-running work executed by the dispatcher.
///
/// Return errors with `?`; a [`WorkerError::Cancelled`] from
/// [`TaskContext::pause`] or [`TaskContext::checkpoint`] is reported as a
/// cancellation rather than a failure.
#[async_trait]
pub trait LongRunningTask: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;
}

/// Adapter returned by [`task_fn`].
pub struct FnTask<F> {
    f: F,
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").finish_non_exhaustive()
    }
}

/// Wrap an async closure as a [`LongRunningTask`].
///
/// ```ignore
/// let task = task_fn(|ctx| async move {
///     ctx.pause(Duration::from_secs(1)).await?;
///     Ok::<(), anyhow::Error>(())
/// });
/// ```
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnTask { f }
}

#[async_trait]
impl<F, Fut> LongRunningTask for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        (self.f)(ctx).await
    }
}

/// Stand-in business workload: a fixed number of interruptible steps.
///
/// Unset fields fall back to the dispatcher's [`WorkerConfig`].
#[derive(Clone, Debug, Default)]
pub struct SimulatedWorkload {
    steps: Option<u32>,
    step_interval: Option<Duration>,
}

impl SimulatedWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = Some(interval);
        self
    }
}

#[async_trait]
impl LongRunningTask for SimulatedWorkload {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        let total = self.steps.unwrap_or(ctx.worker_config().simulation_steps);
        let interval = self
            .step_interval
            .unwrap_or_else(|| ctx.worker_config().step_interval());

        info!(
            run_id = %ctx.run_id(),
            business_key = %ctx.business_key(),
            steps = total,
            "simulated workload started"
        );
        for step in 1..=total {
            ctx.pause(interval).await?;
            debug!(
                run_id = %ctx.run_id(),
                business_key = %ctx.business_key(),
                step,
                total,
                "simulated workload progressing"
            );
        }
        info!(run_id = %ctx.run_id(), business_key = %ctx.business_key(), "simulated workload finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::{timeout, Instant};

    fn context(registry: &CancellationRegistry, config: WorkerConfig) -> (TaskContext, WorkerHandle) {
        let run_id = RunId::new();
        let handle = WorkerHandle::new();
        registry.register(run_id, handle.clone());
        let ctx = TaskContext::new(
            run_id,
            RecordId::new(),
            BusinessKey::generate(),
            "testJob".to_string(),
            handle.clone(),
            registry.clone(),
            config,
        );
        (ctx, handle)
    }

    #[tokio::test]
    async fn test_pause_is_interrupted_by_stop() {
        let registry = CancellationRegistry::default();
        let (ctx, _handle) = context(&registry, WorkerConfig::default());
        let run_id = ctx.run_id();

        let stopper = tokio::spawn({
            let registry = registry.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                registry.request_stop(run_id);
            }
        });

        let started = Instant::now();
        let result = timeout(Duration::from_secs(2), ctx.pause(Duration::from_secs(60)))
            .await
            .expect("pause should be interrupted");
        assert_eq!(result, Err(WorkerError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_reflects_registry_flag() {
        let registry = CancellationRegistry::default();
        let (ctx, _handle) = context(&registry, WorkerConfig::default());
        assert!(ctx.checkpoint().is_ok());

        registry.request_stop(ctx.run_id());
        assert!(ctx.should_stop());
        assert_eq!(ctx.checkpoint(), Err(WorkerError::Cancelled));
    }

    #[tokio::test]
    async fn test_steps_decomposes_duration() {
        let registry = CancellationRegistry::default();
        let config = WorkerConfig::default().with_step_interval(10);
        let (ctx, _handle) = context(&registry, config);

        let started = Instant::now();
        ctx.steps(Duration::from_millis(35)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn test_simulated_workload_uses_config() {
        let registry = CancellationRegistry::default();
        let config = WorkerConfig::default()
            .with_step_interval(5)
            .with_simulation_steps(3);
        let (ctx, _handle) = context(&registry, config);

        let started = Instant::now();
        SimulatedWorkload::new().run(ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_task_fn_adapts_closure() {
        let registry = CancellationRegistry::default();
        let (ctx, _handle) = context(&registry, WorkerConfig::default());
        let calls = Arc::new(AtomicU32::new(0));

        let task = task_fn({
            let calls = calls.clone();
            move |ctx: TaskContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ctx.checkpoint()?;
                    Ok::<(), anyhow::Error>(())
                }
            }
        });
        task.run(ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_error_classification() {
        let cancelled = WorkerError::from_task(anyhow::Error::new(WorkerError::Cancelled));
        assert!(cancelled.is_cancelled());

        let failed = WorkerError::from_task(anyhow::anyhow!("disk full"));
        assert_eq!(failed, WorkerError::Task("disk full".to_string()));
    }
}
