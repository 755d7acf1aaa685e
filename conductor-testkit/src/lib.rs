//! Test support for conductor: an in-memory job engine, scripted tasks and
//! fast configuration presets.

pub mod engine;
pub mod task;

pub use engine::InMemoryJobEngine;
pub use task::{CountingTask, FailingTask, GatedTask, PanickingTask};

use conductor::{OrchestratorConfig, WorkerConfig};

/// Configuration with millisecond steps so simulated runs finish quickly.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_shutdown_timeout(5)
        .with_worker(
            WorkerConfig::default()
                .with_step_interval(10)
                .with_simulation_steps(3),
        )
}
