use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// TOML file with the registry settings and backup targets
    pub config_path: PathBuf,
    /// Overrides `[log] level` from the engine configuration
    pub log_level: Option<String>,
    pub notify_webhook_url: Option<String>,
    /// How long shutdown waits for in-flight runs
    pub shutdown_grace_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            config_path: PathBuf::from(
                std::env::var("BACKUP_CONFIG").unwrap_or_else(|_| "backup.toml".into()),
            ),
            log_level: std::env::var("LOG_LEVEL").ok(),
            notify_webhook_url: std::env::var("NOTIFY_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            shutdown_grace_secs: std::env::var("SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}
