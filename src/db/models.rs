use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: i32,
    pub name: String,
    pub driver: String,
    pub host: String,
    pub port: Option<i32>,
    pub user_name: String,
    /// Stored credential. Never serialized back to a client.
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    pub database: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: i32,
    pub name: String,
    pub annotation: Option<String>,
    pub query_text: String,
    pub connection_id: Option<i32>,
    pub schedule_type: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub interval_seconds: Option<i32>,
    pub export_csv: bool,
    pub export_xlsx: bool,
    pub query_timeout_seconds: Option<i32>,
    pub mail_to: Vec<String>,
    pub enabled: bool,
    pub is_deleted: bool,
    pub schedule_status: String,
    pub schedule_error: Option<String>,
    pub no_of_executed: i32,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tracker {
    pub id: i64,
    pub job_id: i32,
    pub scheduled_on: Option<DateTime<Utc>>,
    pub triggered_by: String,
    pub status: String,
    pub ran_on: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub header: Option<serde_json::Value>,
    pub rows_preview: Option<serde_json::Value>,
    pub row_count: Option<i64>,
    pub error_message: Option<String>,
    pub error_ext: Option<serde_json::Value>,
    pub csv_path: Option<String>,
    pub xlsx_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A tracker joined with the owning job's name and target database.
#[derive(Debug, Clone, FromRow)]
pub struct TrackerWithJob {
    #[sqlx(flatten)]
    pub tracker: Tracker,
    pub job_name: String,
    pub database_name: String,
}

/// When and how often a job is fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScheduleSpec {
    Cron {
        expression: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    Interval {
        seconds: i32,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFlags {
    #[serde(default)]
    pub csv: bool,
    #[serde(default)]
    pub xlsx: bool,
}

impl ExportFlags {
    pub fn any(&self) -> bool {
        self.csv || self.xlsx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// A success whose result outlived its validity window.
    Expired,
}

impl TrackerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerStatus::Pending => "pending",
            TrackerStatus::Running => "running",
            TrackerStatus::Success => "success",
            TrackerStatus::Failed => "failed",
            TrackerStatus::Expired => "expired",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, TrackerStatus::Pending | TrackerStatus::Running)
    }
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TrackerStatus::Pending),
            "running" => Ok(TrackerStatus::Running),
            "success" => Ok(TrackerStatus::Success),
            "failed" => Ok(TrackerStatus::Failed),
            "expired" => Ok(TrackerStatus::Expired),
            other => Err(format!("unknown tracker status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Schedule,
    Manual,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Schedule => "schedule",
            TriggeredBy::Manual => "manual",
        }
    }
}

impl Job {
    pub fn schedule(&self) -> Option<ScheduleSpec> {
        match self.schedule_type.as_deref() {
            Some("cron") => Some(ScheduleSpec::Cron {
                expression: self.cron_expression.clone().unwrap_or_default(),
                timezone: self.timezone.clone(),
            }),
            Some("interval") => Some(ScheduleSpec::Interval {
                seconds: self.interval_seconds.unwrap_or(0),
            }),
            _ => None,
        }
    }

    pub fn export_flags(&self) -> ExportFlags {
        ExportFlags {
            csv: self.export_csv,
            xlsx: self.export_xlsx,
        }
    }
}

impl Tracker {
    pub fn status(&self) -> TrackerStatus {
        self.status.parse().unwrap_or(TrackerStatus::Failed)
    }

    pub fn is_running(&self) -> bool {
        self.status() == TrackerStatus::Running
    }

    pub fn is_success(&self) -> bool {
        self.status() == TrackerStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status() == TrackerStatus::Failed
    }

    pub fn error_lines(&self) -> Vec<String> {
        string_array(self.error_ext.as_ref())
    }

    /// Column names of the stored result, empty before the run completes.
    pub fn header_names(&self) -> Vec<String> {
        string_array(self.header.as_ref())
    }
}

fn string_array(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Connection fields accepted from clients on create and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDraft {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub user_name: String,
    /// On update, `None` keeps the stored password.
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
}

/// Job fields accepted from clients on create and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDraft {
    pub name: String,
    #[serde(default)]
    pub annotation: Option<String>,
    pub query: String,
    pub connection_id: i32,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub export_flags: ExportFlags,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub query_timeout_seconds: Option<i32>,
    /// Recipients of the result mail sent after each successful run.
    #[serde(default)]
    pub mail_to: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// Final state written to a tracker when its run completes.
#[derive(Debug, Clone)]
pub struct TrackerOutcome {
    pub status: TrackerStatus,
    pub duration_ms: i64,
    pub header: Option<serde_json::Value>,
    pub rows_preview: Option<serde_json::Value>,
    pub row_count: Option<i64>,
    pub error_message: Option<String>,
    pub error_ext: Option<serde_json::Value>,
}

/// Job record as exchanged with clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: i32,
    pub name: String,
    pub annotation: Option<String>,
    pub query: String,
    pub connection_id: Option<i32>,
    pub schedule: Option<ScheduleSpec>,
    pub export_flags: ExportFlags,
    pub enabled: bool,
    pub query_timeout_seconds: Option<i32>,
    pub mail_to: Vec<String>,
    pub schedule_status: String,
    pub schedule_error: Option<String>,
    pub no_of_executed: i32,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        JobRecord {
            id: job.id,
            name: job.name.clone(),
            annotation: job.annotation.clone(),
            query: job.query_text.clone(),
            connection_id: job.connection_id,
            schedule: job.schedule(),
            export_flags: job.export_flags(),
            enabled: job.enabled,
            query_timeout_seconds: job.query_timeout_seconds,
            mail_to: job.mail_to.clone(),
            schedule_status: job.schedule_status.clone(),
            schedule_error: job.schedule_error.clone(),
            no_of_executed: job.no_of_executed,
            next_run_at: job.next_run_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn job(id: i32) -> Job {
        Job {
            id,
            name: format!("job-{}", id),
            annotation: None,
            query_text: "SELECT 1 AS id".to_string(),
            connection_id: Some(1),
            schedule_type: Some("cron".to_string()),
            cron_expression: Some("0 2 * * *".to_string()),
            timezone: "UTC".to_string(),
            interval_seconds: None,
            export_csv: false,
            export_xlsx: false,
            query_timeout_seconds: None,
            mail_to: Vec::new(),
            enabled: true,
            is_deleted: false,
            schedule_status: "valid".to_string(),
            schedule_error: None,
            no_of_executed: 0,
            last_fired_at: None,
            next_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn tracker(id: i64, job_id: i32, status: TrackerStatus) -> Tracker {
        Tracker {
            id,
            job_id,
            scheduled_on: None,
            triggered_by: "manual".to_string(),
            status: status.as_str().to_string(),
            ran_on: Some(Utc::now()),
            duration_ms: 12,
            header: None,
            rows_preview: None,
            row_count: None,
            error_message: None,
            error_ext: None,
            csv_path: None,
            xlsx_path: None,
            created_at: Utc::now(),
        }
    }
}
