use async_trait::async_trait;
use conductor::runtime::{LongRunningTask, TaskContext};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Task that fails with a fixed message.
#[derive(Clone, Debug)]
pub struct FailingTask {
    message: String,
}

impl FailingTask {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl LongRunningTask for FailingTask {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        ctx.checkpoint()?;
        Err(anyhow::anyhow!("{}", self.message))
    }
}

/// Task that panics with a fixed message.
#[derive(Clone, Debug)]
pub struct PanickingTask {
    message: String,
}

impl PanickingTask {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl LongRunningTask for PanickingTask {
    async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
        panic!("{}", self.message);
    }
}

/// Task that pauses `steps` times and counts each finished step.
#[derive(Clone, Debug)]
pub struct CountingTask {
    steps: u32,
    interval: Duration,
    completed: Arc<AtomicU32>,
}

impl CountingTask {
    pub fn new(steps: u32, interval: Duration) -> Self {
        Self {
            steps,
            interval,
            completed: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Steps finished so far, shared across clones.
    pub fn completed_steps(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LongRunningTask for CountingTask {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        for _ in 0..self.steps {
            ctx.pause(self.interval).await?;
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Task that stays in progress until released or stopped.
///
/// Polls in short interruptible pauses, so a stop is observed promptly.
#[derive(Clone, Debug, Default)]
pub struct GatedTask {
    released: Arc<AtomicBool>,
    started: Arc<AtomicU32>,
    seen_runs: Arc<Mutex<Vec<conductor::RunId>>>,
}

impl GatedTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let every current and future run finish successfully.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// How many runs have entered the task.
    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn seen_runs(&self) -> Vec<conductor::RunId> {
        self.seen_runs.lock().clone()
    }
}

#[async_trait]
impl LongRunningTask for GatedTask {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.seen_runs.lock().push(ctx.run_id());
        while !self.released.load(Ordering::SeqCst) {
            ctx.pause(Duration::from_millis(5)).await?;
        }
        Ok(())
    }
}
