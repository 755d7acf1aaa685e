use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

use crate::engine::RunId;

/// Identity of an [`ExecutionRecord`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-meaningful identifier of a business batch run.
///
/// Formatted as `BATCH_<yyyyMMddHHmmss>_<8 hex chars>`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BusinessKey(String);

impl BusinessKey {
    /// Generate a fresh key from the current time and a random suffix.
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    pub fn generate_at(at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("BATCH_{}_{}", at.format("%Y%m%d%H%M%S"), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BusinessKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for BusinessKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of an [`ExecutionRecord`].
///
/// Ordered: a record only ever moves forward, and `Completed` and `Failed`
/// are absorbing.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Created,
    Started,
    Processing,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Created => "CREATED",
            RecordStatus::Started => "STARTED",
            RecordStatus::Processing => "PROCESSING",
            RecordStatus::Completed => "COMPLETED",
            RecordStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    ///
    /// Terminal states accept nothing. Skipping intermediate states is
    /// allowed; re-entering the current non-terminal state is allowed.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Completion is only reachable from work that actually ran.
            (RecordStatus::Created | RecordStatus::Started, RecordStatus::Completed) => false,
            (current, next) => next >= *current,
        }
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(RecordStatus::Created),
            "STARTED" => Ok(RecordStatus::Started),
            "PROCESSING" => Ok(RecordStatus::Processing),
            "COMPLETED" => Ok(RecordStatus::Completed),
            "FAILED" => Ok(RecordStatus::Failed),
            other => Err(RecordError::UnknownStatus(other.to_string())),
        }
    }
}

/// Persisted record of one business batch run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: RecordId,
    pub business_key: BusinessKey,
    pub job_name: String,
    pub run_id: Option<RunId>,
    pub status: RecordStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub failure: Option<String>,
}

impl ExecutionRecord {
    /// Build a fresh `Created` record.
    pub fn new(new: NewExecutionRecord) -> Self {
        Self {
            id: RecordId::new(),
            business_key: new.business_key,
            job_name: new.job_name,
            run_id: new.run_id,
            status: RecordStatus::Created,
            start_time: None,
            end_time: None,
            created_at: Utc::now(),
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Set the engine run id; the field is write-once.
    pub fn assign_run_id(&mut self, run_id: RunId) -> Result<(), RecordError> {
        match self.run_id {
            None => {
                self.run_id = Some(run_id);
                Ok(())
            }
            Some(existing) if existing == run_id => Ok(()),
            Some(existing) => Err(RecordError::RunIdAlreadyAssigned {
                record_id: self.id,
                existing,
                attempted: run_id,
            }),
        }
    }

    /// Apply a status change, enforcing the state machine.
    ///
    /// Writes against a terminal record are ignored rather than rejected,
    /// so late writers cannot disturb a finished run.
    pub fn apply(&mut self, update: StatusUpdate) -> Result<Transition, RecordError> {
        if self.status.is_terminal() {
            return Ok(Transition::Ignored);
        }
        if !self.status.can_transition_to(update.status) {
            return Err(RecordError::InvalidTransition {
                record_id: self.id,
                from: self.status,
                to: update.status,
            });
        }

        match update.status {
            RecordStatus::Started => {
                self.start_time.get_or_insert(update.at);
            }
            RecordStatus::Processing => {
                self.start_time = Some(update.at);
            }
            RecordStatus::Completed | RecordStatus::Failed => {
                self.end_time = Some(update.at);
                self.failure = update.failure;
            }
            RecordStatus::Created => {}
        }
        self.status = update.status;
        Ok(Transition::Applied)
    }
}

/// Input for creating an [`ExecutionRecord`].
#[derive(Clone, Debug)]
pub struct NewExecutionRecord {
    pub business_key: BusinessKey,
    pub job_name: String,
    pub run_id: Option<RunId>,
}

impl NewExecutionRecord {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            business_key: BusinessKey::generate(),
            job_name: job_name.into(),
            run_id: None,
        }
    }

    pub fn with_business_key(mut self, key: BusinessKey) -> Self {
        self.business_key = key;
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// A requested status change.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub status: RecordStatus,
    pub at: DateTime<Utc>,
    pub failure: Option<String>,
}

impl StatusUpdate {
    pub fn now(status: RecordStatus) -> Self {
        Self {
            status,
            at: Utc::now(),
            failure: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Failed,
            at: Utc::now(),
            failure: Some(reason.into()),
        }
    }
}

/// Whether a status update changed the record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    Applied,
    /// The record was already terminal; nothing changed.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record {record_id} cannot move from {from} to {to}")]
    InvalidTransition {
        record_id: RecordId,
        from: RecordStatus,
        to: RecordStatus,
    },

    #[error("record {record_id} already belongs to run {existing}, refusing {attempted}")]
    RunIdAlreadyAssigned {
        record_id: RecordId,
        existing: RunId,
        attempted: RunId,
    },

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("unknown record status {0:?}")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(NewExecutionRecord::new("testJob"))
    }

    #[test]
    fn test_business_key_format() {
        let at = DateTime::parse_from_rfc3339("2026-10-19T08:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let key = BusinessKey::generate_at(at);
        let s = key.as_str();
        assert!(s.starts_with("BATCH_20261019083005_"), "{s}");
        assert_eq!(s.len(), "BATCH_20261019083005_".len() + 8);
    }

    #[test]
    fn test_business_keys_are_unique() {
        let a = BusinessKey::generate();
        let b = BusinessKey::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_forward_lifecycle() {
        let mut rec = record();
        assert_eq!(rec.status, RecordStatus::Created);

        assert_eq!(rec.apply(StatusUpdate::now(RecordStatus::Started)).unwrap(), Transition::Applied);
        let started_at = rec.start_time.unwrap();

        rec.apply(StatusUpdate::now(RecordStatus::Processing)).unwrap();
        assert!(rec.start_time.unwrap() >= started_at);
        assert!(rec.end_time.is_none());

        rec.apply(StatusUpdate::now(RecordStatus::Completed)).unwrap();
        assert_eq!(rec.status, RecordStatus::Completed);
        assert!(rec.end_time.unwrap() >= rec.start_time.unwrap());
    }

    #[test]
    fn test_terminal_is_absorbing() {
        let mut rec = record();
        rec.apply(StatusUpdate::now(RecordStatus::Processing)).unwrap();
        rec.apply(StatusUpdate::failed("cancelled")).unwrap();
        let end = rec.end_time;

        let outcome = rec.apply(StatusUpdate::now(RecordStatus::Completed)).unwrap();
        assert_eq!(outcome, Transition::Ignored);
        assert_eq!(rec.status, RecordStatus::Failed);
        assert_eq!(rec.end_time, end);
        assert_eq!(rec.failure.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut rec = record();
        rec.apply(StatusUpdate::now(RecordStatus::Processing)).unwrap();
        let err = rec.apply(StatusUpdate::now(RecordStatus::Started)).unwrap_err();
        assert!(matches!(err, RecordError::InvalidTransition { .. }));
        assert_eq!(rec.status, RecordStatus::Processing);
    }

    #[test]
    fn test_completion_requires_processing() {
        let mut rec = record();
        let err = rec.apply(StatusUpdate::now(RecordStatus::Completed)).unwrap_err();
        assert!(matches!(err, RecordError::InvalidTransition { .. }));

        // A rejected launch may close a record straight from Created.
        rec.apply(StatusUpdate::failed("rejected")).unwrap();
        assert_eq!(rec.status, RecordStatus::Failed);
        assert!(rec.start_time.is_none());
    }

    #[test]
    fn test_run_id_is_set_once() {
        let mut rec = record();
        let first = RunId::new();
        rec.assign_run_id(first).unwrap();
        rec.assign_run_id(first).unwrap();

        let err = rec.assign_run_id(RunId::new()).unwrap_err();
        assert!(matches!(err, RecordError::RunIdAlreadyAssigned { .. }));
        assert_eq!(rec.run_id, Some(first));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RecordStatus::Created,
            RecordStatus::Started,
            RecordStatus::Processing,
            RecordStatus::Completed,
            RecordStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("JOB_COMPLETED".parse::<RecordStatus>().is_err());
    }
}
