use crate::credentials::CredentialCipher;
use crate::db::models::{Connection, ConnectionDraft};
use crate::db::queries;
use crate::error::{ConnectionError, DatabaseError, Result, ValidationError};
use serde::Serialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection as _, Executor, PgPool};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Postgres,
    MySql,
    Sqlite,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Postgres => "postgres",
            DriverKind::MySql => "mysql",
            DriverKind::Sqlite => "sqlite",
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            DriverKind::Postgres => Some(5432),
            DriverKind::MySql => Some(3306),
            DriverKind::Sqlite => None,
        }
    }

    fn is_networked(&self) -> bool {
        self.default_port().is_some()
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DriverKind::Postgres),
            "mysql" | "mariadb" => Ok(DriverKind::MySql),
            "sqlite" => Ok(DriverKind::Sqlite),
            other => Err(ValidationError::UnsupportedDriver(other.to_string())),
        }
    }
}

/// Everything needed to open a connection to a target database.
#[derive(Clone)]
pub struct ConnectionDescriptor {
    pub driver: DriverKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

fn required(field: &str, value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field.to_string()));
    }
    Ok(())
}

/// Checks the fields each driver needs and builds a descriptor.
pub fn validate(draft: &ConnectionDraft) -> Result<ConnectionDescriptor> {
    required("name", &draft.name)?;
    required("database", &draft.database)?;
    let driver: DriverKind = draft.driver.parse()?;

    let port = if driver.is_networked() {
        required("host", &draft.host)?;
        required("userName", &draft.user_name)?;
        match draft.port {
            None => driver.default_port().unwrap_or_default(),
            Some(port) => u16::try_from(port)
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| ValidationError::InvalidField {
                    field: "port".to_string(),
                    reason: format!("{} is not a valid TCP port", port),
                })?,
        }
    } else {
        0
    };

    Ok(ConnectionDescriptor {
        driver,
        host: draft.host.trim().to_string(),
        port,
        user: draft.user_name.clone(),
        password: draft.password.clone().unwrap_or_default(),
        database: draft.database.trim().to_string(),
    })
}

impl ConnectionDescriptor {
    /// Rebuilds a descriptor from a stored row, decrypting its password.
    pub fn from_stored(connection: &Connection, cipher: &CredentialCipher) -> Result<Self> {
        let password = connection
            .password
            .as_deref()
            .map(|stored| cipher.decrypt(stored))
            .transpose()?;

        validate(&ConnectionDraft {
            name: connection.name.clone(),
            driver: connection.driver.clone(),
            host: connection.host.clone(),
            port: connection.port,
            user_name: connection.user_name.clone(),
            password,
            database: connection.database.clone(),
        })
    }
}

/// An open connection to a target database, scoped to one run.
pub enum DbHandle {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

impl DbHandle {
    pub async fn ping(&mut self) -> std::result::Result<(), sqlx::Error> {
        match self {
            DbHandle::Postgres(conn) => conn.execute("SELECT 1").await.map(|_| ()),
            DbHandle::MySql(conn) => conn.execute("SELECT 1").await.map(|_| ()),
            DbHandle::Sqlite(conn) => conn.execute("SELECT 1").await.map(|_| ()),
        }
    }

    /// Closes the connection gracefully. Dropping a handle also releases it.
    pub async fn close(self) {
        let result = match self {
            DbHandle::Postgres(conn) => conn.close().await,
            DbHandle::MySql(conn) => conn.close().await,
            DbHandle::Sqlite(conn) => conn.close().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "Error while closing target connection");
        }
    }
}

async fn open(descriptor: &ConnectionDescriptor) -> std::result::Result<DbHandle, sqlx::Error> {
    match descriptor.driver {
        DriverKind::Postgres => {
            let options = PgConnectOptions::new()
                .host(&descriptor.host)
                .port(descriptor.port)
                .username(&descriptor.user)
                .password(&descriptor.password)
                .database(&descriptor.database);
            Ok(DbHandle::Postgres(options.connect().await?))
        }
        DriverKind::MySql => {
            let options = MySqlConnectOptions::new()
                .host(&descriptor.host)
                .port(descriptor.port)
                .username(&descriptor.user)
                .password(&descriptor.password)
                .database(&descriptor.database);
            Ok(DbHandle::MySql(options.connect().await?))
        }
        DriverKind::Sqlite => {
            let options = if descriptor.database == ":memory:" {
                SqliteConnectOptions::from_str("sqlite::memory:")?
            } else {
                SqliteConnectOptions::new().filename(&descriptor.database)
            };
            Ok(DbHandle::Sqlite(options.connect().await?))
        }
    }
}

/// Opens a handle, giving up after `timeout`.
pub async fn acquire(descriptor: &ConnectionDescriptor, timeout: Duration) -> Result<DbHandle> {
    match tokio::time::timeout(timeout, open(descriptor)).await {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(e)) => Err(ConnectionError::Unreachable(e.to_string()).into()),
        Err(_) => Err(ConnectionError::Timeout(timeout.as_secs()).into()),
    }
}

/// Result of a connectivity check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestOutcome {
    pub fn connected(latency_ms: u64) -> Self {
        TestOutcome {
            connected: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        TestOutcome {
            connected: false,
            latency_ms: None,
            error: Some(reason.into()),
        }
    }
}

/// Opens a short-lived connection, runs `SELECT 1` and closes it.
pub async fn test_connect(descriptor: &ConnectionDescriptor, timeout: Duration) -> TestOutcome {
    let start = Instant::now();

    let attempt = async {
        let mut handle = match open(descriptor).await {
            Ok(handle) => handle,
            Err(e) => return Err(e.to_string()),
        };
        let pinged = handle.ping().await;
        handle.close().await;
        pinged.map_err(|e| e.to_string())
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => TestOutcome::connected(start.elapsed().as_millis() as u64),
        Ok(Err(reason)) => TestOutcome::unreachable(reason),
        Err(_) => TestOutcome::unreachable(ConnectionError::Timeout(timeout.as_secs()).to_string()),
    }
}

/// Stored connections plus connectivity checks. Passwords are sealed at rest.
#[derive(Clone)]
pub struct ConnectionRegistry {
    pool: PgPool,
    connect_timeout: Duration,
    cipher: Arc<CredentialCipher>,
}

impl ConnectionRegistry {
    pub fn new(pool: PgPool, connect_timeout: Duration, cipher: Arc<CredentialCipher>) -> Self {
        Self {
            pool,
            connect_timeout,
            cipher,
        }
    }

    fn sealed(&self, draft: &ConnectionDraft) -> Result<ConnectionDraft> {
        Ok(ConnectionDraft {
            password: self.cipher.seal_optional(draft.password.as_deref())?,
            ..draft.clone()
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub async fn list(&self) -> Result<Vec<Connection>> {
        queries::list_connections(&self.pool).await
    }

    pub async fn get(&self, id: i32) -> Result<Connection> {
        queries::get_connection(&self.pool, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Connection {}", id)).into())
    }

    pub async fn create(&self, draft: &ConnectionDraft) -> Result<Connection> {
        let descriptor = validate(draft)?;
        let connection = queries::insert_connection(&self.pool, &self.sealed(draft)?).await?;
        info!(
            connection_id = connection.id,
            driver = %descriptor.driver,
            "Connection created"
        );
        Ok(connection)
    }

    pub async fn update(&self, id: i32, draft: &ConnectionDraft) -> Result<Connection> {
        validate(draft)?;
        let connection = queries::update_connection(&self.pool, id, &self.sealed(draft)?)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Connection {}", id)))?;
        info!(connection_id = id, "Connection updated");
        Ok(connection)
    }

    /// Deletes a connection no live job uses. Returns `false` if it did not exist.
    pub async fn delete(&self, id: i32) -> Result<bool> {
        let jobs = queries::count_jobs_using_connection(&self.pool, id).await?;
        if jobs > 0 {
            return Err(ValidationError::ConnectionInUse { id, jobs }.into());
        }
        let deleted = queries::delete_connection(&self.pool, id).await?;
        if deleted {
            info!(connection_id = id, "Connection deleted");
        }
        Ok(deleted)
    }

    pub async fn descriptor(&self, id: i32) -> Result<ConnectionDescriptor> {
        let connection = self.get(id).await?;
        ConnectionDescriptor::from_stored(&connection, &self.cipher)
    }

    pub async fn test_draft(&self, draft: &ConnectionDraft) -> Result<TestOutcome> {
        let descriptor = validate(draft)?;
        Ok(self.test(&descriptor).await)
    }

    pub async fn test_saved(&self, id: i32) -> Result<TestOutcome> {
        let descriptor = self.descriptor(id).await?;
        Ok(self.test(&descriptor).await)
    }

    async fn test(&self, descriptor: &ConnectionDescriptor) -> TestOutcome {
        let outcome = test_connect(descriptor, self.connect_timeout).await;
        match &outcome.error {
            None => debug!(
                driver = %descriptor.driver,
                host = %descriptor.host,
                latency_ms = outcome.latency_ms,
                "Connection test succeeded"
            ),
            Some(reason) => warn!(
                driver = %descriptor.driver,
                host = %descriptor.host,
                reason = %reason,
                "Connection test failed"
            ),
        }
        outcome
    }

    pub async fn acquire(&self, descriptor: &ConnectionDescriptor) -> Result<DbHandle> {
        acquire(descriptor, self.connect_timeout).await
    }
}
