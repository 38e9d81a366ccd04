//! idled - idle resource lifecycle manager daemon
//!
//! Samples utilization for configured research instances, stops or
//! hibernates instances that stay idle, and serves the control API.

use anyhow::{Context, Result};
use idle_lib::store::{JsonHistoryLog, JsonPolicyStore, JsonStateStore};
use idle_lib::Manager;
use idled::api::{self, AppState};
use idled::config::DaemonConfig;
use idled::driver::{DriverConfig, PollingDriver};
use idled::providers::{HttpLifecycleController, LogNotifier, SpoolMetricsProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting idled");

    let config = DaemonConfig::load()?;
    info!(
        node_name = %config.node_name,
        state_dir = %config.state_dir.display(),
        instances = config.instances.len(),
        dry_run = config.manager.dry_run,
        "Daemon configured"
    );

    let provider = Arc::new(SpoolMetricsProvider::new(&config.metrics_spool_dir));
    let controller = Arc::new(HttpLifecycleController::new(
        &config.control_plane_url,
        Duration::from_secs(config.manager.action_timeout_secs),
    )?);

    let manager = Manager::builder(provider, controller, Arc::new(LogNotifier))
        .config(config.manager.clone())
        .node_name(&config.node_name)
        .policy_store(Arc::new(JsonPolicyStore::new(config.policy_path())))
        .state_store(Arc::new(JsonStateStore::new(config.instance_state_dir())))
        .history_log(Arc::new(JsonHistoryLog::new(config.history_path())))
        .build()
        .await
        .context("Failed to initialize idle manager")?;
    let manager = Arc::new(manager);

    for instance in config.instances.iter().cloned() {
        manager.register_instance(instance.into());
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let app_state = Arc::new(AppState::new(manager.clone()));
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    let driver = PollingDriver::new(
        manager.clone(),
        DriverConfig {
            interval: Duration::from_secs(config.poll_interval_secs),
            worker_pool_size: config.worker_pool_size,
        },
    );
    let driver_handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    manager.health().set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    manager.shutdown("SIGINT received");
    manager.health().set_ready(false).await;
    let _ = shutdown_tx.send(());

    if let Err(e) = driver_handle.await {
        error!(error = %e, "Polling loop task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
