use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Database(DatabaseError),
    Validation(ValidationError),
    Connection(ConnectionError),
    Scheduler(SchedulerError),
    Execution(ExecutionError),
    Export(ExportError),
    Credential(CredentialError),
    Mail(MailError),
    Api(ApiError),
}

#[derive(Debug)]
#[allow(clippy::enum_variant_names)]
pub enum ConfigError {
    LoadFailed(String),
    ParseFailed(String),
    ValidationFailed(String),
}

#[derive(Debug)]
pub enum DatabaseError {
    ConnectionFailed(sqlx::Error),
    QueryFailed(sqlx::Error),
    MigrationFailed(sqlx::Error),
    NotFound(String),
}

/// Rejected user input. Surfaced to the caller as-is and never retried.
#[derive(Debug)]
pub enum ValidationError {
    MissingField(String),
    InvalidField { field: String, reason: String },
    UnsupportedDriver(String),
    UnknownConnection(i32),
    ConnectionInUse { id: i32, jobs: i64 },
}

#[derive(Debug)]
pub enum ConnectionError {
    Unreachable(String),
    Timeout(u64),
}

#[derive(Debug)]
pub enum SchedulerError {
    InvalidCronExpression(String),
    InvalidInterval(String),
    InvalidTimezone(String),
    QueueClosed,
}

#[derive(Debug)]
pub enum ExecutionError {
    QueryFailed {
        message: String,
        details: Vec<String>,
    },
    Timeout(u64),
}

#[derive(Debug)]
pub enum ExportError {
    Io(String),
    Csv(String),
    Xlsx(String),
}

#[derive(Debug)]
pub enum CredentialError {
    InvalidKey,
    EncryptFailed,
    Malformed(String),
    DecryptFailed,
}

#[derive(Debug)]
pub enum MailError {
    InvalidAddress { address: String, reason: String },
    BuildFailed(String),
    SendFailed(String),
}

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    NotFound(String),
}

impl AppError {
    /// Extended diagnostic lines recorded as `error_ext` on a failed tracker.
    pub fn diagnostics(&self) -> Vec<String> {
        match self {
            AppError::Execution(ExecutionError::QueryFailed { details, .. }) => details.clone(),
            AppError::Connection(ConnectionError::Unreachable(reason)) => vec![reason.clone()],
            _ => Vec::new(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::Database(DatabaseError::NotFound(_)) | AppError::Api(ApiError::NotFound(_))
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::Database(e) => write!(f, "Database error: {}", e),
            AppError::Validation(e) => write!(f, "Validation error: {}", e),
            AppError::Connection(e) => write!(f, "Connection error: {}", e),
            AppError::Scheduler(e) => write!(f, "Scheduler error: {}", e),
            AppError::Execution(e) => write!(f, "Execution error: {}", e),
            AppError::Export(e) => write!(f, "Export error: {}", e),
            AppError::Credential(e) => write!(f, "Credential error: {}", e),
            AppError::Mail(e) => write!(f, "Mail error: {}", e),
            AppError::Api(e) => write!(f, "API error: {}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::LoadFailed(msg) => write!(f, "Failed to load configuration: {}", msg),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse configuration: {}", msg),
            ConfigError::ValidationFailed(msg) => {
                write!(f, "Configuration validation failed: {}", msg)
            }
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::ConnectionFailed(e) => write!(f, "Database connection failed: {}", e),
            DatabaseError::QueryFailed(e) => write!(f, "Database query failed: {}", e),
            DatabaseError::MigrationFailed(e) => write!(f, "Database migration failed: {}", e),
            DatabaseError::NotFound(what) => write!(f, "{} not found", what),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingField(field) => write!(f, "{} is required", field),
            ValidationError::InvalidField { field, reason } => write!(f, "{}: {}", field, reason),
            ValidationError::UnsupportedDriver(driver) => {
                write!(f, "Unsupported database driver: {}", driver)
            }
            ValidationError::UnknownConnection(id) => write!(f, "Connection {} does not exist", id),
            ValidationError::ConnectionInUse { id, jobs } => {
                write!(f, "Connection {} is still used by {} job(s)", id, jobs)
            }
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Unreachable(reason) => {
                write!(f, "Could not connect to the database: {}", reason)
            }
            ConnectionError::Timeout(secs) => {
                write!(f, "Connection attempt timed out after {}s", secs)
            }
        }
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::InvalidCronExpression(msg) => {
                write!(f, "Invalid cron expression: {}", msg)
            }
            SchedulerError::InvalidInterval(msg) => write!(f, "Invalid interval: {}", msg),
            SchedulerError::InvalidTimezone(tz) => write!(f, "Invalid timezone: {}", tz),
            SchedulerError::QueueClosed => write!(f, "Executor queue is closed"),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::QueryFailed { message, .. } => write!(f, "Query failed: {}", message),
            ExecutionError::Timeout(secs) => write!(f, "Query timed out after {}s", secs),
        }
    }
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Io(msg) => write!(f, "Failed to write export file: {}", msg),
            ExportError::Csv(msg) => write!(f, "Failed to write CSV: {}", msg),
            ExportError::Xlsx(msg) => write!(f, "Failed to write XLSX: {}", msg),
        }
    }
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::InvalidKey => write!(f, "Credential key could not be derived"),
            CredentialError::EncryptFailed => write!(f, "Failed to encrypt credential"),
            CredentialError::Malformed(msg) => write!(f, "Stored credential is malformed: {}", msg),
            CredentialError::DecryptFailed => {
                write!(f, "Stored credential could not be decrypted with the configured secret")
            }
        }
    }
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailError::InvalidAddress { address, reason } => {
                write!(f, "Invalid mail address '{}': {}", address, reason)
            }
            MailError::BuildFailed(msg) => write!(f, "Failed to build mail: {}", msg),
            MailError::SendFailed(msg) => write!(f, "Failed to send mail: {}", msg),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for DatabaseError {}
impl std::error::Error for ValidationError {}
impl std::error::Error for ConnectionError {}
impl std::error::Error for SchedulerError {}
impl std::error::Error for ExecutionError {}
impl std::error::Error for ExportError {}
impl std::error::Error for CredentialError {}
impl std::error::Error for MailError {}
impl std::error::Error for ApiError {}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::Database(err)
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err)
    }
}

impl From<ConnectionError> for AppError {
    fn from(err: ConnectionError) -> Self {
        AppError::Connection(err)
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        AppError::Scheduler(err)
    }
}

impl From<ExecutionError> for AppError {
    fn from(err: ExecutionError) -> Self {
        AppError::Execution(err)
    }
}

impl From<ExportError> for AppError {
    fn from(err: ExportError) -> Self {
        AppError::Export(err)
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        AppError::Credential(err)
    }
}

impl From<MailError> for AppError {
    fn from(err: MailError) -> Self {
        AppError::Mail(err)
    }
}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        AppError::Api(err)
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::QueryFailed(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(DatabaseError::QueryFailed(err))
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::LoadFailed(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseFailed(err.to_string())
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::Io(err.to_string())
    }
}

impl From<csv::Error> for ExportError {
    fn from(err: csv::Error) -> Self {
        ExportError::Csv(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for ExportError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        ExportError::Xlsx(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_failure_exposes_details() {
        let err: AppError = ExecutionError::QueryFailed {
            message: "syntax error at or near \"SELEC\"".to_string(),
            details: vec!["code: 42601".to_string()],
        }
        .into();

        assert_eq!(err.diagnostics(), vec!["code: 42601".to_string()]);
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn test_timeout_has_no_details() {
        let err: AppError = ExecutionError::Timeout(30).into();

        assert!(err.diagnostics().is_empty());
        assert_eq!(err.to_string(), "Execution error: Query timed out after 30s");
    }

    #[test]
    fn test_not_found_detection() {
        let err: AppError = DatabaseError::NotFound("Job 7".to_string()).into();
        assert!(err.is_not_found());

        let err: AppError = ValidationError::MissingField("name".to_string()).into();
        assert!(!err.is_not_found());
    }
}
