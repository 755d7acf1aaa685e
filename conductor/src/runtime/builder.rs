use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::engine::JobEngine;
use crate::events::InProcEventBus;
use crate::registry::CancellationRegistry;
use crate::store::ExecutionRecordStore;

use super::orchestrator::Orchestrator;
use super::task::LongRunningTask;

/// Builder for constructing an [`Orchestrator`] with explicit dependencies.
///
/// The engine and the store are required. The registry and the event bus
/// default to fresh instances sized from the configuration.
///
/// # Example
///
/// ```ignore
/// use conductor::*;
///
/// let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
///     .with_engine(engine)
///     .with_store(store)
///     .with_task("singleAsyncJob", SimulatedWorkload::new())
///     .build()?;
/// ```
pub struct OrchestratorBuilder<E, S>
where
    E: JobEngine + 'static,
    S: ExecutionRecordStore + 'static,
{
    config: OrchestratorConfig,
    engine: Option<Arc<E>>,
    store: Option<Arc<S>>,
    registry: Option<CancellationRegistry>,
    events: Option<InProcEventBus>,
    tasks: HashMap<String, Arc<dyn LongRunningTask>>,
}

impl<E, S> fmt::Debug for OrchestratorBuilder<E, S>
where
    E: JobEngine + 'static,
    S: ExecutionRecordStore + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("OrchestratorBuilder");
        debug.field("config", &self.config);
        debug.field("engine_set", &self.engine.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("registry_set", &self.registry.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("task_count", &self.tasks.len());

        if self.engine.is_some() {
            debug.field("engine_type", &type_name::<E>());
        }
        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }

        debug.finish()
    }
}

impl<E, S> OrchestratorBuilder<E, S>
where
    E: JobEngine + 'static,
    S: ExecutionRecordStore + 'static,
{
    /// Create a new builder with the given configuration.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            engine: None,
            store: None,
            registry: None,
            events: None,
            tasks: HashMap::new(),
        }
    }

    /// Set the job engine.
    pub fn with_engine(mut self, engine: Arc<E>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the record store.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing cancellation registry.
    pub fn with_registry(mut self, registry: CancellationRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share an existing event bus.
    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Register the task that backs `job_name`. A later registration for
    /// the same name replaces the earlier one.
    pub fn with_task(mut self, job_name: impl Into<String>, task: impl LongRunningTask + 'static) -> Self {
        self.tasks.insert(job_name.into(), Arc::new(task));
        self
    }

    /// Register an already shared task.
    pub fn with_shared_task(mut self, job_name: impl Into<String>, task: Arc<dyn LongRunningTask>) -> Self {
        self.tasks.insert(job_name.into(), task);
        self
    }

    /// Build the `Orchestrator` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine or the store is missing, or if no task
    /// is registered at all.
    pub fn build(self) -> anyhow::Result<Orchestrator<E, S>> {
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine dependency missing"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        if self.tasks.is_empty() {
            anyhow::bail!("no tasks registered");
        }
        let registry = self
            .registry
            .unwrap_or_else(|| CancellationRegistry::new(self.config.registry.clone()));
        let events = self
            .events
            .unwrap_or_else(|| InProcEventBus::new(self.config.event_capacity));

        Ok(Orchestrator::new(
            self.config,
            engine,
            store,
            registry,
            events,
            self.tasks,
        ))
    }
}
