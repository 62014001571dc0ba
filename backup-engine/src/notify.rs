//! Run completion notifications.

use crate::registry::{BackupRun, RunStatus};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait RunNotifier: Send + Sync {
    async fn on_run_completed(&self, run: &BackupRun) -> anyhow::Result<()>;
}

/// Writes the outcome to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl RunNotifier for LogNotifier {
    async fn on_run_completed(&self, run: &BackupRun) -> anyhow::Result<()> {
        if run.status == RunStatus::Failed {
            tracing::error!(
                run_id = %run.id,
                target_id = %run.target_id,
                error = run.error.as_deref().unwrap_or("-"),
                "[Notify] Backup run failed"
            );
        } else {
            tracing::warn!(
                run_id = %run.id,
                target_id = %run.target_id,
                status = %run.status,
                failures = run.failures.len(),
                "[Notify] Backup run finished with file failures"
            );
        }
        Ok(())
    }
}

/// POSTs the run record as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RunNotifier for WebhookNotifier {
    async fn on_run_completed(&self, run: &BackupRun) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(run).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook {} answered {}", self.url, response.status());
        }
        tracing::info!(run_id = %run.id, url = %self.url, "[Notify] Webhook delivered");
        Ok(())
    }
}

/// Whether a finished run warrants a notification.
pub fn should_notify(run: &BackupRun, failure_threshold: usize) -> bool {
    match run.status {
        RunStatus::Failed => true,
        _ => failure_threshold > 0 && run.failures.len() >= failure_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::registry::FileFailure;
    use chrono::Utc;

    fn run(status: RunStatus, failures: usize) -> BackupRun {
        BackupRun {
            id: "r".into(),
            target_id: "t".into(),
            status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            manifests: vec![],
            failures: (0..failures)
                .map(|i| FileFailure {
                    domain: Domain::Archives,
                    path: format!("f{i}"),
                    error: "timeout".into(),
                    attempts: 3,
                })
                .collect(),
            files_transferred: 0,
            bytes_transferred: 0,
            error: None,
        }
    }

    #[test]
    fn test_should_notify() {
        assert!(should_notify(&run(RunStatus::Failed, 0), 5));
        assert!(!should_notify(&run(RunStatus::Succeeded, 0), 1));
        assert!(!should_notify(&run(RunStatus::Partial, 2), 3));
        assert!(should_notify(&run(RunStatus::Partial, 3), 3));
        // Zero disables failure-count notifications
        assert!(!should_notify(&run(RunStatus::Partial, 10), 0));
    }

    #[tokio::test]
    async fn test_webhook_to_unreachable_host_errors() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        assert!(notifier.on_run_completed(&run(RunStatus::Failed, 0)).await.is_err());
    }
}
