use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub exports: ExportsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub mail: Option<MailConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_database_name")]
    pub name: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    pub log_file: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_seconds: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
    #[serde(default = "default_tracker_row_limit")]
    pub tracker_row_limit: usize,
    #[serde(default = "default_preview_row_limit")]
    pub preview_row_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportsConfig {
    pub directory: PathBuf,
    #[serde(default = "default_exports_base_url")]
    pub base_url: String,
    /// How long a successful result stays downloadable, counted from the end of the run.
    #[serde(default = "default_result_valid_seconds")]
    pub result_valid_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Secret the stored connection passwords are encrypted with.
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    #[serde(default = "default_starttls")]
    pub starttls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_trackers_snapshot_size")]
    pub trackers_snapshot_size: usize,
}

fn default_database_name() -> String {
    "querycron".to_string()
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_http_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_check_interval() -> u64 {
    1
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_query_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_result_rows() -> usize {
    100_000
}

fn default_tracker_row_limit() -> usize {
    100
}

fn default_preview_row_limit() -> usize {
    10
}

fn default_exports_base_url() -> String {
    "/trackers".to_string()
}

fn default_trackers_snapshot_size() -> usize {
    20
}

fn default_result_valid_seconds() -> u64 {
    86_400
}

fn default_smtp_port() -> u16 {
    587
}

fn default_starttls() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            query_timeout_seconds: default_query_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            max_result_rows: default_max_result_rows(),
            tracker_row_limit: default_tracker_row_limit(),
            preview_row_limit: default_preview_row_limit(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            trackers_snapshot_size: default_trackers_snapshot_size(),
        }
    }
}

impl ExecutorConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl ExportsConfig {
    pub fn result_validity(&self) -> Duration {
        Duration::from_secs(self.result_valid_seconds)
    }
}

impl LocalConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: LocalConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseFailed(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.host.is_empty() {
            return Err(
                ConfigError::ValidationFailed("database.host cannot be empty".to_string()).into(),
            );
        }

        if self.database.user.is_empty() {
            return Err(
                ConfigError::ValidationFailed("database.user cannot be empty".to_string()).into(),
            );
        }

        if self.server.log_file.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "server.log_file cannot be empty".to_string(),
            )
            .into());
        }

        if self.scheduler.check_interval_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler.check_interval_seconds must be positive".to_string(),
            )
            .into());
        }

        if self.executor.workers == 0 || self.executor.queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "executor.workers and executor.queue_capacity must be positive".to_string(),
            )
            .into());
        }

        if PgSslMode::from_str(&self.database.ssl_mode).is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "database.ssl_mode '{}' is not a valid SSL mode",
                self.database.ssl_mode
            ))
            .into());
        }

        if self.executor.connect_timeout_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "executor.connect_timeout_seconds must be positive".to_string(),
            )
            .into());
        }

        if self.executor.query_timeout_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "executor.query_timeout_seconds must be positive".to_string(),
            )
            .into());
        }

        if self.exports.directory.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "exports.directory cannot be empty".to_string(),
            )
            .into());
        }

        if self.exports.result_valid_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "exports.result_valid_seconds must be positive".to_string(),
            )
            .into());
        }

        if self.credentials.secret.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "credentials.secret cannot be empty".to_string(),
            )
            .into());
        }

        if let Some(mail) = &self.mail {
            if mail.smtp_host.is_empty() || mail.from.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "mail.smtp_host and mail.from cannot be empty".to_string(),
                )
                .into());
            }
        }

        Ok(())
    }

    /// Builds the store connection field by field, so credentials never pass through a URL.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let ssl_mode = PgSslMode::from_str(&self.database.ssl_mode).map_err(|e| {
            ConfigError::ValidationFailed(format!("Invalid database.ssl_mode: {}", e))
        })?;

        Ok(PgConnectOptions::new()
            .host(&self.database.host)
            .port(self.database.port)
            .username(&self.database.user)
            .password(&self.database.password)
            .database(&self.database.name)
            .ssl_mode(ssl_mode))
    }
}
