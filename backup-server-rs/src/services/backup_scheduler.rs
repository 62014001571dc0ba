use backup_engine::{BackupService, BackupTarget, EngineError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    service: Arc<BackupService>,
    jobs: Mutex<HashMap<String, Uuid>>,
}

impl BackupScheduler {
    pub async fn new(service: Arc<BackupService>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            service,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn schedule_target(&self, target_id: &str, cron_expression: &str) -> anyhow::Result<()> {
        let service = self.service.clone();
        let tid = target_id.to_string();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let service = service.clone();
            let tid = tid.clone();
            Box::pin(async move {
                tracing::info!(target_id = %tid, "Starting scheduled backup");
                match service.run_backup(&tid).await {
                    Ok(run) => {
                        tracing::info!(target_id = %tid, run_id = %run.id, status = %run.status, "Scheduled backup finished")
                    }
                    Err(EngineError::AlreadyRunning(_)) => {
                        tracing::warn!(target_id = %tid, "Skipping scheduled run: target already running")
                    }
                    Err(e) => tracing::error!(target_id = %tid, error = %e, "Scheduled backup failed"),
                }
            })
        })?;

        let guid = self.scheduler.lock().await.add(job).await?;
        if let Some(previous) = self.jobs.lock().await.insert(target_id.to_string(), guid) {
            self.scheduler.lock().await.remove(&previous).await?;
        }
        tracing::info!(target_id = %target_id, cron = %cron_expression, "Target scheduled");
        Ok(())
    }

    pub async fn unschedule_target(&self, target_id: &str) -> anyhow::Result<()> {
        if let Some(guid) = self.jobs.lock().await.remove(target_id) {
            self.scheduler.lock().await.remove(&guid).await?;
            tracing::info!(target_id = %target_id, "Target unscheduled");
        }
        Ok(())
    }

    /// Bring the schedule of one target in line with its configuration.
    pub async fn apply(&self, target: &BackupTarget) -> anyhow::Result<()> {
        match target.schedule.as_deref().map(str::trim) {
            Some(cron) if target.enabled && !cron.is_empty() => self.schedule_target(&target.id, cron).await,
            _ => self.unschedule_target(&target.id).await,
        }
    }

    pub async fn init_schedules(&self) -> anyhow::Result<()> {
        let mut count = 0;
        for target in self.service.targets().await {
            if let Err(e) = self.apply(&target).await {
                tracing::error!(target_id = %target.id, error = %e, "Failed to schedule target");
            } else if self.jobs.lock().await.contains_key(&target.id) {
                count += 1;
            }
        }

        tracing::info!(count, "Cron schedules initialized");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
