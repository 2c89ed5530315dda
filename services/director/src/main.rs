//! drydock director
//!
//! Reads a deployment plan and reconciles it against the in-memory cloud
//! and agents. Ctrl-C cancels the run between units of work.

use std::sync::Arc;

use anyhow::{Context, Result};
use drydock_director::lock::InMemoryLeaseStore;
use drydock_director::plan::spec::PlanSpec;
use drydock_director::records::InMemoryRecordStore;
use drydock_director::sim::{SimAgentFactory, SimCloud};
use drydock_director::{DirectorConfig, Reconciler};
use drydock_reconcile::Cancellation;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DirectorConfig::from_env()?;

    // Prefer RUST_LOG, fall back to DRYDOCK_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting drydock director");
    info!(
        max_threads = config.max_threads,
        dns_enabled = config.dns_enabled,
        "Configuration loaded"
    );

    let path = config
        .plan_path
        .clone()
        .context("DRYDOCK_PLAN must point at a plan file")?;
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read plan {}", path))?;
    let spec: PlanSpec =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse plan {}", path))?;

    let (cancel, cancellation) = Cancellation::pair();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    let reconciler = Reconciler::new(
        config,
        Arc::new(SimCloud::new()),
        Arc::new(SimAgentFactory::new()),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(InMemoryLeaseStore::new()),
        cancellation,
    );

    match reconciler.run(&spec).await {
        Ok(report) => {
            for pool in &report.pools {
                info!(pool = %pool.pool, created = pool.created, recreated = pool.recreated, "Pool summary");
            }
            for job in &report.jobs {
                info!(
                    job = %job.job,
                    updated = job.updated,
                    unchanged = job.unchanged,
                    deleted = job.deleted,
                    update_errors = job.update_errors,
                    "Job summary"
                );
            }
            info!(deployment = %report.deployment, "Done");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Deployment failed");
            Err(e.into())
        }
    }
}
