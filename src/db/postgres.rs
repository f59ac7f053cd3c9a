//! PostgreSQL backend using sqlx
//!
//! Every statement runs on its own pooled connection inside a read-only
//! transaction with a `statement_timeout`; the transaction is rolled back on
//! every exit path. Rows are streamed and decoded up to the row cap. Only the
//! first result set is returned, matching SQLite, which prepares only the
//! first statement.

use crate::db::{RowSet, SqlBackend};
use crate::error::{Result, Text2SqlError};
use crate::metadata::{ColumnDescriptor, SchemaEntry};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use itertools::Itertools;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Either, Executor, Row, Statement, TypeInfo};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

const COLUMNS_SQL: &str = r#"
    SELECT c.table_name::text, c.column_name::text, c.data_type::text
    FROM information_schema.columns c
    JOIN information_schema.tables t
      ON t.table_schema = c.table_schema AND t.table_name = c.table_name
    WHERE c.table_schema = $1 AND t.table_type IN ('BASE TABLE', 'VIEW')
    ORDER BY c.table_name, c.ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
    SELECT kcu.table_name::text, kcu.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT kcu.table_name::text, kcu.column_name::text, ccu.table_name::text, ccu.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
      ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1
"#;

pub struct PostgresBackend {
    pool: PgPool,
    schema: String,
}

impl PostgresBackend {
    /// Creates the pool without connecting; connections open on first use.
    pub fn connect_lazy(database_url: &str, schema: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(database_url)
            .map_err(|e| Text2SqlError::Config(format!("invalid PostgreSQL URL: {}", e)))?;
        Ok(Self::from_pool(pool, schema))
    }

    pub fn from_pool(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }
}

#[async_trait]
impl SqlBackend for PostgresBackend {
    fn dialect(&self) -> &str {
        "PostgreSQL"
    }

    async fn introspect(&self) -> Result<Vec<SchemaEntry>> {
        let introspection = |e: sqlx::Error| Text2SqlError::Introspection(e.to_string());
        let columns: Vec<(String, String, String)> = sqlx::query_as(COLUMNS_SQL)
            .bind(&self.schema)
            .fetch_all(&self.pool)
            .await
            .map_err(introspection)?;
        let primary_keys: HashSet<(String, String)> = sqlx::query_as::<_, (String, String)>(PRIMARY_KEYS_SQL)
            .bind(&self.schema)
            .fetch_all(&self.pool)
            .await
            .map_err(introspection)?
            .into_iter()
            .collect();
        let foreign_keys: HashMap<(String, String), (String, String)> =
            sqlx::query_as::<_, (String, String, String, String)>(FOREIGN_KEYS_SQL)
                .bind(&self.schema)
                .fetch_all(&self.pool)
                .await
                .map_err(introspection)?
                .into_iter()
                .map(|(table, column, ref_table, ref_column)| ((table, column), (ref_table, ref_column)))
                .collect();

        let mut entries = Vec::new();
        for (table, rows) in &columns.into_iter().group_by(|(table, _, _)| table.clone()) {
            let descriptors = rows
                .map(|(_, column, data_type)| {
                    let key = (table.clone(), column.clone());
                    let mut descriptor = ColumnDescriptor::new(column, data_type);
                    if primary_keys.contains(&key) {
                        descriptor = descriptor.primary_key();
                    }
                    if let Some((ref_table, ref_column)) = foreign_keys.get(&key) {
                        descriptor = descriptor.foreign_key(ref_table.clone(), ref_column.clone());
                    }
                    descriptor
                })
                .collect();
            entries.push(SchemaEntry::new(table, descriptors));
        }
        debug!("Introspected {} tables in schema '{}'", entries.len(), self.schema);
        Ok(entries)
    }

    async fn fetch(&self, sql: &str, max_rows: usize, timeout: Duration) -> std::result::Result<RowSet, String> {
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;

        let result = read_rows(&mut tx, sql, max_rows).await;
        if let Err(e) = tx.rollback().await {
            debug!("Rollback of read-only transaction failed: {}", e);
        }
        result
    }
}

async fn read_rows(conn: &mut PgConnection, sql: &str, max_rows: usize) -> std::result::Result<RowSet, String> {
    // simple protocol: every value arrives as text
    let stream = sqlx::raw_sql(sql).fetch_many(&mut *conn);
    let mut set = first_result_set(stream, max_rows, column_names, decode_row)
        .await
        .map_err(|e| e.to_string())?;

    if set.columns.is_empty() {
        // no row carried the column names; describing the statement does
        match (&mut *conn).prepare(sql).await {
            Ok(statement) => {
                set.columns = statement.columns().iter().map(|c| c.name().to_string()).collect();
            }
            Err(e) => debug!("Could not describe result columns: {}", e),
        }
    }
    Ok(set)
}

/// Reads rows until the first statement completes or the cap is hit.
async fn first_result_set<S, Q, R, E>(
    mut stream: S,
    max_rows: usize,
    columns: impl Fn(&R) -> Vec<String>,
    values: impl Fn(&R) -> Vec<Value>,
) -> std::result::Result<RowSet, E>
where
    S: Stream<Item = std::result::Result<Either<Q, R>, E>> + Unpin,
{
    let mut set = RowSet::default();
    while let Some(item) = stream.try_next().await? {
        let row = match item {
            Either::Left(_) => break,
            Either::Right(row) => row,
        };
        if set.rows.len() == max_rows {
            set.truncated = true;
            break;
        }
        if set.columns.is_empty() {
            set.columns = columns(&row);
        }
        set.rows.push(values(&row));
    }
    Ok(set)
}

fn column_names(row: &PgRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn decode_row(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .map(|column| {
            let text = row.try_get_unchecked::<Option<String>, _>(column.ordinal()).ok().flatten();
            text_to_json(text, column.type_info().name())
        })
        .collect()
}

fn text_to_json(text: Option<String>, type_name: &str) -> Value {
    let Some(text) = text else {
        return Value::Null;
    };
    match type_name {
        "INT2" | "INT4" | "INT8" | "OID" => text.parse::<i64>().map(Value::from).unwrap_or(Value::String(text)),
        "FLOAT4" | "FLOAT8" => float_to_json(text),
        "NUMERIC" if fits_f64(&text) => float_to_json(text),
        "BOOL" => Value::Bool(text == "t"),
        "JSON" | "JSONB" => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        _ => Value::String(text),
    }
}

fn float_to_json(text: String) -> Value {
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::String(text))
}

/// At most 15 significant digits, which an f64 round-trips exactly.
fn fits_f64(numeric: &str) -> bool {
    let unsigned = numeric.strip_prefix('-').unwrap_or(numeric);
    if unsigned.is_empty() || !unsigned.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return false;
    }
    let digits: String = unsigned.chars().filter(char::is_ascii_digit).collect();
    digits.trim_start_matches('0').trim_end_matches('0').len() <= 15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_decoding_by_type() {
        assert_eq!(text_to_json(Some("3".into()), "INT8"), Value::from(3));
        assert_eq!(text_to_json(Some("2.5".into()), "NUMERIC"), Value::from(2.5));
        assert_eq!(text_to_json(Some("t".into()), "BOOL"), Value::Bool(true));
        assert_eq!(text_to_json(Some("f".into()), "BOOL"), Value::Bool(false));
        assert_eq!(text_to_json(Some(r#"{"a":1}"#.into()), "JSONB")["a"], 1);
        assert_eq!(text_to_json(Some("2024-05-01".into()), "DATE"), Value::from("2024-05-01"));
        assert_eq!(text_to_json(Some("NaN".into()), "FLOAT8"), Value::from("NaN"));
        assert_eq!(text_to_json(None, "TEXT"), Value::Null);
    }

    #[test]
    fn test_numeric_keeps_precision() {
        assert_eq!(text_to_json(Some("10.00".into()), "NUMERIC"), Value::from(10.0));
        assert_eq!(text_to_json(Some("-0.001".into()), "NUMERIC"), Value::from(-0.001));
        assert_eq!(
            text_to_json(Some("12345678901234567890.123".into()), "NUMERIC"),
            Value::from("12345678901234567890.123")
        );
        assert_eq!(text_to_json(Some("0.1000000000000001".into()), "NUMERIC"), Value::from("0.1000000000000001"));
        assert_eq!(text_to_json(Some("NaN".into()), "NUMERIC"), Value::from("NaN"));
    }

    type Item = std::result::Result<Either<(), Vec<Value>>, String>;

    async fn collect(items: Vec<Item>, max_rows: usize) -> std::result::Result<RowSet, String> {
        let width = |row: &Vec<Value>| -> Vec<String> { (0..row.len()).map(|i| format!("c{}", i)).collect() };
        first_result_set(futures::stream::iter(items), max_rows, width, |row| row.clone()).await
    }

    #[tokio::test]
    async fn test_only_first_result_set_is_read() {
        let set = collect(
            vec![
                Ok(Either::Right(vec![Value::from(1)])),
                Ok(Either::Left(())),
                Ok(Either::Right(vec![Value::from("x"), Value::from(2)])),
                Ok(Either::Left(())),
            ],
            10,
        )
        .await
        .unwrap();
        assert_eq!(set.columns, vec!["c0"]);
        assert_eq!(set.rows, vec![vec![Value::from(1)]]);
        assert!(!set.truncated);
    }

    #[tokio::test]
    async fn test_row_cap_marks_truncation() {
        let rows: Vec<Item> = (0..3).map(|i| Ok(Either::Right(vec![Value::from(i)]))).collect();
        let set = collect(rows, 2).await.unwrap();
        assert_eq!(set.rows.len(), 2);
        assert!(set.truncated);

        let exact = vec![Ok(Either::Right(vec![Value::from(1)])), Ok(Either::Left(()))];
        assert!(!collect(exact, 1).await.unwrap().truncated);
    }

    #[tokio::test]
    async fn test_stream_error_is_returned() {
        let items = vec![Ok(Either::Right(vec![Value::from(1)])), Err("connection reset".to_string())];
        assert_eq!(collect(items, 10).await.unwrap_err(), "connection reset");
    }

    #[tokio::test]
    async fn test_connect_lazy_rejects_bad_url() {
        assert!(PostgresBackend::connect_lazy("not a url", "public").is_err());
        assert!(PostgresBackend::connect_lazy("postgres://u:p@localhost:1/db", "public").is_ok());
    }
}
