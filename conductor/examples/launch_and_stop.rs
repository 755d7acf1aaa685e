//! Launch a simulated batch job, stop it mid-flight, and list the records.
//!
//! Uses conductor-testkit's InMemoryJobEngine in place of a real job engine.
//! Run with `RUST_LOG=conductor=debug` to see worker and registry logs.

use std::sync::Arc;
use std::time::Duration;

use conductor::runtime::{OrchestratorBuilder, SimulatedWorkload};
use conductor::*;
use conductor_testkit::InMemoryJobEngine;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::default()
        .with_worker(WorkerConfig::default().with_step_interval(100).with_simulation_steps(50));
    let engine = Arc::new(InMemoryJobEngine::with_jobs([config.default_job.clone()]));

    let orchestrator = OrchestratorBuilder::new(config)
        .with_engine(engine)
        .with_store(Arc::new(InMemoryRecordStore::new()))
        .with_task("singleAsyncJob", SimulatedWorkload::new())
        .build()?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[EVENT] {}", serde_json::to_string(&event).unwrap_or_default());
        }
    });

    let launched = orchestrator.launch_default().await?;
    println!("Launched run {} ({})", launched.run_id, launched.business_key.as_str());

    tokio::time::sleep(Duration::from_millis(350)).await;
    let record = orchestrator.status(launched.run_id).await?;
    println!("Status before stop: {}", record.status);

    let accepted = orchestrator.stop(launched.run_id).await?;
    println!("Stop accepted: {accepted}");

    if let Some(report) = orchestrator.wait(launched.run_id).await? {
        println!(
            "Worker finished: status={} cancelled={} error={:?}",
            report.status, report.cancelled, report.error
        );
    }

    for record in orchestrator.list_all().await? {
        println!(
            "{} {} {} started={:?} ended={:?}",
            record.business_key.as_str(),
            record.job_name,
            record.status,
            record.start_time,
            record.end_time
        );
    }

    orchestrator.shutdown().await
}
