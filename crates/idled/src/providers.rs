//! Collaborator adapters used by the daemon
//!
//! - `SpoolMetricsProvider` reads snapshots written by the on-instance agent
//! - `HttpLifecycleController` drives instances through the control plane
//! - `LogNotifier` turns notices into structured log events

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use idle_lib::{LifecycleController, MetricsProvider, NotificationSink, Severity, UsageMetrics};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Metrics provider backed by `<spool>/<instance_id>.json` snapshots
pub struct SpoolMetricsProvider {
    spool_dir: PathBuf,
}

impl SpoolMetricsProvider {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
        }
    }

    fn snapshot_path(&self, instance_id: &str) -> Result<PathBuf> {
        if instance_id.is_empty()
            || instance_id.contains(['/', '\\'])
            || instance_id.starts_with('.')
        {
            bail!("invalid instance id '{}'", instance_id);
        }
        Ok(self.spool_dir.join(format!("{}.json", instance_id)))
    }
}

#[async_trait]
impl MetricsProvider for SpoolMetricsProvider {
    async fn get_metrics(&self, instance_id: &str, window: Duration) -> Result<UsageMetrics> {
        let path = self.snapshot_path(instance_id)?;
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read metrics snapshot {:?}", path))?;
        let metrics: UsageMetrics = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse metrics snapshot {:?}", path))?;

        let age = Utc::now() - metrics.timestamp;
        let max_age = chrono::Duration::from_std(window).context("Metrics window out of range")?;
        if age > max_age {
            bail!(
                "snapshot for {} is {}s old, older than the {}s window",
                instance_id,
                age.num_seconds(),
                window.as_secs()
            );
        }

        debug!(instance_id = %instance_id, age_secs = age.num_seconds(), "Read metrics snapshot");
        Ok(metrics)
    }
}

/// Lifecycle controller calling `POST {base}/instances/{id}/{operation}`
pub struct HttpLifecycleController {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpLifecycleController {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("Invalid control plane URL '{}'", base_url))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, instance_id: &str, operation: &str) -> Result<Url> {
        let mut url = self.base_url.join("instances/")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("control plane URL cannot be a base"))?
            .pop_if_empty()
            .push(instance_id)
            .push(operation);
        Ok(url)
    }

    async fn post(&self, instance_id: &str, operation: &str) -> Result<StatusCode> {
        let url = self.endpoint(instance_id, operation)?;
        debug!(url = %url, "Calling control plane");

        let response = self
            .client
            .post(url.clone())
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;
        Ok(response.status())
    }

    async fn expect_success(&self, instance_id: &str, operation: &str) -> Result<()> {
        let status = self.post(instance_id, operation).await?;
        if !status.is_success() {
            bail!("{} {} returned {}", operation, instance_id, status);
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleController for HttpLifecycleController {
    async fn hibernate(&self, instance_id: &str) -> Result<bool> {
        let status = self.post(instance_id, "hibernate").await?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                info!(instance_id = %instance_id, status = %status, "Control plane rejected hibernation");
                Ok(false)
            }
            s => bail!("hibernate {} returned {}", instance_id, s),
        }
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        self.expect_success(instance_id, "stop").await
    }

    async fn start(&self, instance_id: &str) -> Result<()> {
        self.expect_success(instance_id, "start").await
    }
}

/// Notification sink that writes notices to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, instance_id: &str, message: &str, severity: Severity) -> Result<()> {
        warn!(
            event = "idle_notification",
            instance_id = %instance_id,
            severity = %severity,
            message = %message,
            "Idle notification"
        );
        Ok(())
    }
}
