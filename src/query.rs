pub mod decode;

use crate::connection::DbHandle;
use crate::error::{AppError, ExecutionError, Result};
use futures_util::TryStreamExt;
use serde_json::{Map, Value};
use sqlx::postgres::PgDatabaseError;
use sqlx::{Column, Executor, Row, Statement};
use std::time::Duration;

/// Column-name fragments whose values are never stored, streamed or exported.
pub const SENSITIVE_COLUMN_MARKERS: [&str; 4] = ["password", "secret", "userpass", "confidential"];

pub type ResultRow = Map<String, Value>;

/// Rows fetched by one query run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub header: Vec<String>,
    pub rows: Vec<ResultRow>,
    /// Set when more rows were available than the fetch limit.
    pub truncated: bool,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn header_json(&self) -> Value {
        Value::from(self.header.clone())
    }

    pub fn preview(&self, limit: usize) -> Vec<ResultRow> {
        self.rows.iter().take(limit).cloned().collect()
    }

    pub fn preview_json(&self, limit: usize) -> Value {
        Value::Array(self.preview(limit).into_iter().map(Value::Object).collect())
    }

    /// Removes sensitive columns from the header and from every row.
    pub fn strip_sensitive(&mut self) {
        let hidden: Vec<String> = self
            .header
            .iter()
            .filter(|name| is_sensitive_column(name))
            .cloned()
            .collect();
        if hidden.is_empty() {
            return;
        }

        self.header.retain(|name| !is_sensitive_column(name));
        for row in &mut self.rows {
            for name in &hidden {
                row.remove(name);
            }
        }
    }

    /// Cell values of a row in header order, nulls for missing keys.
    pub fn ordered_cells<'a>(&'a self, row: &'a ResultRow) -> impl Iterator<Item = &'a Value> {
        self.header
            .iter()
            .map(move |name| row.get(name).unwrap_or(&Value::Null))
    }
}

/// Makes column names usable as row keys: a repeated name gets a `_2`,
/// `_3`, ... suffix, skipping names the query already uses.
pub fn unique_column_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let names: Vec<&str> = names.into_iter().collect();
    let mut taken: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(names.len());

    for (index, name) in names.iter().enumerate() {
        let repeated = names[..index].contains(name);
        let mut candidate = name.to_string();
        if repeated || taken.contains(&candidate) {
            let mut suffix = 2;
            loop {
                candidate = format!("{}_{}", name, suffix);
                if !taken.contains(&candidate) && !names.contains(&candidate.as_str()) {
                    break;
                }
                suffix += 1;
            }
        }
        taken.insert(candidate.clone());
        unique.push(candidate);
    }
    unique
}

pub fn is_sensitive_column(name: &str) -> bool {
    let lower = name.to_lowercase();
    SENSITIVE_COLUMN_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Turns a driver error into an execution failure with diagnostic lines.
pub fn query_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let mut details = Vec::new();
            if let Some(code) = db_err.code() {
                details.push(format!("code: {}", code));
            }
            if let Some(pg) = db_err.try_downcast_ref::<PgDatabaseError>() {
                if let Some(detail) = pg.detail() {
                    details.push(format!("detail: {}", detail));
                }
                if let Some(hint) = pg.hint() {
                    details.push(format!("hint: {}", hint));
                }
                if let Some(location) = pg.r#where() {
                    details.push(format!("where: {}", location));
                }
            }
            ExecutionError::QueryFailed {
                message: db_err.message().to_string(),
                details,
            }
            .into()
        }
        _ => ExecutionError::QueryFailed {
            message: err.to_string(),
            details: Vec::new(),
        }
        .into(),
    }
}

/// Streams rows into a `QueryResult`, stopping after `max_rows`. The header
/// of an empty result comes from the prepared statement. Rows are keyed by
/// the de-duplicated header, by column position.
macro_rules! collect_rows {
    ($conn:expr, $sql:expr, $max_rows:expr, $decode:path) => {{
        let mut header: Vec<String> = Vec::new();
        let mut rows: Vec<ResultRow> = Vec::new();
        let mut truncated = false;
        {
            let mut stream = sqlx::query($sql).fetch(&mut *$conn);
            while let Some(row) = stream.try_next().await.map_err(query_error)? {
                if header.is_empty() {
                    header = unique_column_names(row.columns().iter().map(|c| c.name()));
                }
                if rows.len() >= $max_rows {
                    truncated = true;
                    break;
                }
                let mut record = ResultRow::new();
                for (index, name) in header.iter().enumerate() {
                    record.insert(name.clone(), $decode(&row, index));
                }
                rows.push(record);
            }
        }
        if header.is_empty() {
            if let Ok(statement) = (&mut *$conn).prepare($sql).await {
                header = unique_column_names(statement.columns().iter().map(|c| c.name()));
            }
        }
        QueryResult {
            header,
            rows,
            truncated,
        }
    }};
}

/// Runs `sql` on an open handle and decodes at most `max_rows` rows.
pub async fn fetch(handle: &mut DbHandle, sql: &str, max_rows: usize) -> Result<QueryResult> {
    let result = match handle {
        DbHandle::Postgres(conn) => collect_rows!(conn, sql, max_rows, decode::pg_cell),
        DbHandle::MySql(conn) => collect_rows!(conn, sql, max_rows, decode::mysql_cell),
        DbHandle::Sqlite(conn) => collect_rows!(conn, sql, max_rows, decode::sqlite_cell),
    };
    Ok(result)
}

/// `fetch` bounded by `timeout`, with sensitive columns removed.
pub async fn fetch_with_timeout(
    handle: &mut DbHandle,
    sql: &str,
    max_rows: usize,
    timeout: Duration,
) -> Result<QueryResult> {
    let mut result = tokio::time::timeout(timeout, fetch(handle, sql, max_rows))
        .await
        .map_err(|_| ExecutionError::Timeout(timeout.as_secs()))??;
    result.strip_sensitive();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{acquire, validate};
    use crate::db::models::ConnectionDraft;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> ResultRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_sensitive_column_detection() {
        assert!(is_sensitive_column("password"));
        assert!(is_sensitive_column("User_Password_Hash"));
        assert!(is_sensitive_column("api_secret"));
        assert!(is_sensitive_column("CONFIDENTIAL_notes"));
        assert!(!is_sensitive_column("name"));
        assert!(!is_sensitive_column("pass"));
    }

    #[test]
    fn test_strip_sensitive_columns() {
        let mut result = QueryResult {
            header: vec!["id".to_string(), "password".to_string(), "name".to_string()],
            rows: vec![row(&[
                ("id", json!(1)),
                ("password", json!("x")),
                ("name", json!("a")),
            ])],
            truncated: false,
        };

        result.strip_sensitive();

        assert_eq!(result.header, vec!["id", "name"]);
        assert_eq!(result.rows[0], row(&[("id", json!(1)), ("name", json!("a"))]));
    }

    #[test]
    fn test_preview_is_capped() {
        let result = QueryResult {
            header: vec!["n".to_string()],
            rows: (0..5).map(|n| row(&[("n", json!(n))])).collect(),
            truncated: false,
        };

        assert_eq!(result.preview(2).len(), 2);
        assert_eq!(result.preview_json(10).as_array().map(Vec::len), Some(5));
    }

    #[test]
    fn test_repeated_column_names_get_suffixes() {
        assert_eq!(unique_column_names(["a", "b", "a", "a"]), vec!["a", "b", "a_2", "a_3"]);
        assert_eq!(unique_column_names(["a", "a", "a_2"]), vec!["a", "a_3", "a_2"]);
        assert_eq!(unique_column_names(["id", "name"]), vec!["id", "name"]);
    }

    #[test]
    fn test_non_database_error_has_no_details() {
        let err = query_error(sqlx::Error::RowNotFound);
        assert!(err.diagnostics().is_empty());
    }

    async fn sqlite() -> DbHandle {
        let descriptor = validate(&ConnectionDraft {
            name: "mem".to_string(),
            driver: "sqlite".to_string(),
            host: String::new(),
            port: None,
            user_name: String::new(),
            password: None,
            database: ":memory:".to_string(),
        })
        .expect("valid descriptor");
        acquire(&descriptor, Duration::from_secs(5))
            .await
            .expect("Failed to open sqlite")
    }

    #[tokio::test]
    async fn test_fetch_sqlite_rows() {
        let mut handle = sqlite().await;
        let result = fetch(&mut handle, "SELECT 1 AS id, 'a' AS name", 100)
            .await
            .expect("query should succeed");

        assert_eq!(result.header, vec!["id", "name"]);
        assert_eq!(result.rows, vec![row(&[("id", json!(1)), ("name", json!("a"))])]);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_fetch_keeps_every_column_of_a_repeated_name() {
        let mut handle = sqlite().await;
        let result = fetch(&mut handle, "SELECT 1 AS a, 2 AS a", 100)
            .await
            .expect("query should succeed");

        assert_eq!(result.header, vec!["a", "a_2"]);
        assert_eq!(result.rows, vec![row(&[("a", json!(1)), ("a_2", json!(2))])]);

        let cells: Vec<&Value> = result.ordered_cells(&result.rows[0]).collect();
        assert_eq!(cells, vec![&json!(1), &json!(2)]);
    }

    #[tokio::test]
    async fn test_fetch_respects_row_cap() {
        let mut handle = sqlite().await;
        let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 50) SELECT x FROM n";
        let result = fetch(&mut handle, sql, 10).await.expect("query should succeed");

        assert_eq!(result.row_count(), 10);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_fetch_reports_syntax_error() {
        let mut handle = sqlite().await;
        let err = fetch(&mut handle, "SELEC 1", 10).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::Execution(ExecutionError::QueryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_strips_sensitive_columns() {
        let mut handle = sqlite().await;
        let result = fetch_with_timeout(
            &mut handle,
            "SELECT 'bob' AS login, 'pw' AS password",
            10,
            Duration::from_secs(5),
        )
        .await
        .expect("query should succeed");

        assert_eq!(result.header, vec!["login"]);
        assert!(!result.rows[0].contains_key("password"));
    }
}
