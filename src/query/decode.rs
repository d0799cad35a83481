use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo};
use uuid::Uuid;

/// Returns from the enclosing function if the cell decodes as `$ty`.
macro_rules! try_decode {
    ($row:expr, $index:expr, $ty:ty, $map:expr) => {
        if let Ok(cell) = $row.try_get::<Option<$ty>, _>($index) {
            return cell.map($map).unwrap_or(Value::Null);
        }
    };
}

/// Generic attempts for types the name match did not cover.
macro_rules! decode_fallback {
    ($row:expr, $index:expr, $type_name:expr) => {{
        try_decode!($row, $index, i64, Value::from);
        try_decode!($row, $index, f64, float);
        try_decode!($row, $index, bool, Value::Bool);
        try_decode!($row, $index, String, Value::String);
        try_decode!($row, $index, Vec<u8>, bytes);
        Value::String(format!("<{}>", $type_name))
    }};
}

fn float(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(v.to_string()))
}

fn decimal(v: Decimal) -> Value {
    Value::String(v.normalize().to_string())
}

fn bytes(v: Vec<u8>) -> Value {
    Value::String(format!("\\x{}", hex::encode(v)))
}

fn timestamp_tz(v: DateTime<Utc>) -> Value {
    Value::String(v.to_rfc3339())
}

fn timestamp(v: NaiveDateTime) -> Value {
    Value::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string())
}

fn date(v: NaiveDate) -> Value {
    Value::String(v.to_string())
}

fn time(v: NaiveTime) -> Value {
    Value::String(v.to_string())
}

pub(crate) fn pg_cell(row: &PgRow, index: usize) -> Value {
    let type_name = row.column(index).type_info().name().to_uppercase();

    match type_name.as_str() {
        "BOOL" => try_decode!(row, index, bool, Value::Bool),
        "INT2" => try_decode!(row, index, i16, Value::from),
        "INT4" => try_decode!(row, index, i32, Value::from),
        "INT8" => try_decode!(row, index, i64, Value::from),
        "FLOAT4" => try_decode!(row, index, f32, |v| float(v as f64)),
        "FLOAT8" => try_decode!(row, index, f64, float),
        "NUMERIC" => try_decode!(row, index, Decimal, decimal),
        "UUID" => try_decode!(row, index, Uuid, |v| Value::String(v.to_string())),
        "JSON" | "JSONB" => try_decode!(row, index, Value, |v| v),
        "TIMESTAMPTZ" => try_decode!(row, index, DateTime<Utc>, timestamp_tz),
        "TIMESTAMP" => try_decode!(row, index, NaiveDateTime, timestamp),
        "DATE" => try_decode!(row, index, NaiveDate, date),
        "TIME" => try_decode!(row, index, NaiveTime, time),
        "BYTEA" => try_decode!(row, index, Vec<u8>, bytes),
        _ => {}
    }

    decode_fallback!(row, index, type_name)
}

pub(crate) fn mysql_cell(row: &MySqlRow, index: usize) -> Value {
    let type_name = row.column(index).type_info().name().to_uppercase();

    match type_name.as_str() {
        "BOOLEAN" => try_decode!(row, index, bool, Value::Bool),
        "TINYINT" => try_decode!(row, index, i8, Value::from),
        "SMALLINT" => try_decode!(row, index, i16, Value::from),
        "INT" | "MEDIUMINT" => try_decode!(row, index, i32, Value::from),
        "BIGINT" => try_decode!(row, index, i64, Value::from),
        "TINYINT UNSIGNED" => try_decode!(row, index, u8, Value::from),
        "SMALLINT UNSIGNED" => try_decode!(row, index, u16, Value::from),
        "INT UNSIGNED" | "MEDIUMINT UNSIGNED" => try_decode!(row, index, u32, Value::from),
        "BIGINT UNSIGNED" => try_decode!(row, index, u64, Value::from),
        "FLOAT" => try_decode!(row, index, f32, |v| float(v as f64)),
        "DOUBLE" => try_decode!(row, index, f64, float),
        "DECIMAL" => try_decode!(row, index, Decimal, decimal),
        "JSON" => try_decode!(row, index, Value, |v| v),
        "TIMESTAMP" => try_decode!(row, index, DateTime<Utc>, timestamp_tz),
        "DATETIME" => try_decode!(row, index, NaiveDateTime, timestamp),
        "DATE" => try_decode!(row, index, NaiveDate, date),
        "TIME" => try_decode!(row, index, NaiveTime, time),
        _ => {}
    }

    decode_fallback!(row, index, type_name)
}

pub(crate) fn sqlite_cell(row: &SqliteRow, index: usize) -> Value {
    let type_name = row.column(index).type_info().name().to_uppercase();

    match type_name.as_str() {
        "BOOLEAN" => try_decode!(row, index, bool, Value::Bool),
        "INTEGER" => try_decode!(row, index, i64, Value::from),
        "REAL" => try_decode!(row, index, f64, float),
        "TEXT" => try_decode!(row, index, String, Value::String),
        "BLOB" => try_decode!(row, index, Vec<u8>, bytes),
        "DATETIME" => try_decode!(row, index, NaiveDateTime, timestamp),
        "DATE" => try_decode!(row, index, NaiveDate, date),
        "TIME" => try_decode!(row, index, NaiveTime, time),
        _ => {}
    }

    decode_fallback!(row, index, type_name)
}
