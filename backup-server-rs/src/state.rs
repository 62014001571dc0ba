use crate::config::AppConfig;
use crate::services::backup_scheduler::BackupScheduler;
use backup_engine::BackupService;
use std::sync::Arc;

pub struct AppState {
    pub service: Arc<BackupService>,
    pub config: AppConfig,
    /// Absent when the cron scheduler failed to start
    pub scheduler: Option<Arc<BackupScheduler>>,
}

impl AppState {
    pub fn new(service: Arc<BackupService>, config: AppConfig, scheduler: Option<Arc<BackupScheduler>>) -> Self {
        Self {
            service,
            config,
            scheduler,
        }
    }
}
