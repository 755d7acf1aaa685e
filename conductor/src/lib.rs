//! Conductor - asynchronous job orchestration with cooperative cancellation.
//!
//! Launches named long-running jobs through an external job engine, runs
//! their work on dedicated tokio tasks, and lets any caller stop a specific
//! run while it is in flight.
//!
//! # Core Concepts
//!
//! - **Engine**: The [`JobEngine`] trait abstracts the external job-run
//!   engine that owns the job catalog and the bookkeeping of runs.
//!
//! - **Record**: Each launch owns an [`ExecutionRecord`] whose status moves
//!   forward through `Created → Started → Processing → Completed | Failed`.
//!   The [`ExecutionRecordStore`] trait abstracts where records live.
//!
//! - **Registry**: The [`CancellationRegistry`] bridges stop requests to the
//!   [`WorkerHandle`] of the worker that must observe them, including
//!   requests that arrive before the worker registers.
//!
//! - **Tasks**: A [`LongRunningTask`](runtime::LongRunningTask) performs the
//!   work and suspends only through its [`TaskContext`](runtime::TaskContext),
//!   which is where cancellation is observed.
//!
//! - **Runtime**: The [`Orchestrator`](runtime::Orchestrator) ties the pieces
//!   together behind `launch`, `stop`, `status` and `list_*`.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL record store via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use conductor::runtime::{OrchestratorBuilder, SimulatedWorkload};
//! use conductor::*;
//!
//! let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
//!     .with_engine(engine)
//!     .with_store(Arc::new(InMemoryRecordStore::new()))
//!     .with_task("singleAsyncJob", SimulatedWorkload::new())
//!     .build()?;
//!
//! let launched = orchestrator.launch_default().await?;
//! orchestrator.stop(launched.run_id).await?;
//! ```

/// Configuration structures for workers, the registry and persistence.
pub mod config;

/// The external job-run engine interface.
pub mod engine;

/// Run lifecycle events and the in-process event bus.
pub mod events;

/// Execution records and their status state machine.
pub mod record;

/// Cancellation registry and worker wake-up handles.
pub mod registry;

/// Record store trait and the in-memory implementation.
pub mod store;

/// Tracing spans and telemetry helpers.
pub mod telemetry;

/// Prometheus collectors, compiled with the `metrics` feature.
#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides a PostgreSQL-backed record store when
/// the `postgres` feature is enabled.
pub mod persistence;

/// Dispatcher, orchestrator and task abstractions.
pub mod runtime;

pub use config::*;
pub use engine::*;
pub use events::*;
pub use record::*;
pub use registry::*;
pub use store::*;
