/// Builder for constructing orchestrator instances.
pub mod builder;
/// Worker dispatch: runs tasks off the caller's task and records their outcome.
pub mod dispatcher;
/// Launch, stop and query façade.
pub mod orchestrator;
/// Long-running task abstraction and its execution context.
pub mod task;

pub use builder::OrchestratorBuilder;
pub use dispatcher::{AsyncWorkerDispatcher, DispatchHandle, DispatchRequest, WorkerReport};
pub use orchestrator::{Launched, Orchestrator, OrchestratorError};
pub use task::{task_fn, FnTask, LongRunningTask, SimulatedWorkload, TaskContext, WorkerError};
