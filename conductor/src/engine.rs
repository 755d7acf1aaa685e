//! Interface to the external job-run engine.
//!
//! The engine owns the catalog of job names and the bookkeeping of runs.
//! Conductor only consumes it through [`JobEngine`]; an in-memory
//! implementation lives in `conductor-testkit`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Display};
use uuid::Uuid;

/// Identifier of a run in the external engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Status of a run as the engine tracks it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            RunStatus::Starting | RunStatus::Started | RunStatus::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "STARTING",
            RunStatus::Started => "STARTED",
            RunStatus::Stopping => "STOPPING",
            RunStatus::Stopped => "STOPPED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code and description attached to a finished run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: String,
    pub description: Option<String>,
}

impl ExitInfo {
    pub fn completed() -> Self {
        Self {
            code: "COMPLETED".to_string(),
            description: None,
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            code: "FAILED".to_string(),
            description: Some(description.into()),
        }
    }

    pub fn stopped(description: impl Into<String>) -> Self {
        Self {
            code: "STOPPED".to_string(),
            description: Some(description.into()),
        }
    }
}

/// Point-in-time view of one engine run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: RunId,
    pub job_name: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit: Option<ExitInfo>,
}

/// Entry of [`JobEngine::list_all_runs`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
}

impl From<&RunInfo> for RunSummary {
    fn from(info: &RunInfo) -> Self {
        Self {
            run_id: info.run_id,
            status: info.status,
            start_time: info.start_time,
        }
    }
}

/// Parameters handed to the engine when a run is created.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunParameters(BTreeMap<String, serde_json::Value>);

impl RunParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("job {0:?} is not registered")]
    UnknownJob(String),

    #[error("job {0:?} already has an active run")]
    AlreadyRunning(String),

    #[error("run {0} does not exist")]
    UnknownRun(RunId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The external job-run engine.
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Create a run of `name`.
    ///
    /// Fails with [`EngineError::UnknownJob`] for an unregistered name and
    /// [`EngineError::AlreadyRunning`] when the engine refuses a concurrent run.
    async fn run_job(&self, name: &str, params: RunParameters) -> Result<RunId, EngineError>;

    /// Ask the engine to stop a run. Returns whether the engine accepted.
    async fn stop_run(&self, run_id: RunId) -> Result<bool, EngineError>;

    /// Look up a run.
    async fn get_run(&self, run_id: RunId) -> Result<Option<RunInfo>, EngineError>;

    /// Runs of `name` that are still active.
    async fn list_running_runs(&self, name: &str) -> Result<HashSet<RunId>, EngineError>;

    /// All runs of `name`, most recent first.
    async fn list_all_runs(&self, name: &str) -> Result<Vec<RunSummary>, EngineError>;

    /// Report the outcome of the work backing a run.
    async fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        exit: ExitInfo,
    ) -> Result<(), EngineError>;
}
