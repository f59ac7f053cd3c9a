//! SQLite backend using rusqlite
//!
//! Opens a fresh read-only connection per call on the blocking pool. The
//! connection's interrupt handle is held by the async side so a timeout or a
//! dropped future aborts the running statement.

use crate::db::{RowSet, SqlBackend};
use crate::error::{Result, Text2SqlError};
use crate::metadata::{ColumnDescriptor, SchemaEntry};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    /// Accepts a plain path or a `sqlite://` URL.
    pub fn new(location: &str) -> Self {
        let path = location
            .strip_prefix("sqlite://")
            .or_else(|| location.strip_prefix("sqlite:"))
            .unwrap_or(location);
        Self { path: PathBuf::from(path) }
    }

    fn open_read_only(&self) -> rusqlite::Result<Connection> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )
    }
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    fn dialect(&self) -> &str {
        "SQLite"
    }

    async fn introspect(&self) -> Result<Vec<SchemaEntry>> {
        let conn = self
            .open_read_only()
            .map_err(|e| Text2SqlError::Introspection(e.to_string()))?;
        tokio::task::spawn_blocking(move || read_schema(&conn))
            .await
            .map_err(|e| Text2SqlError::Introspection(format!("introspection task failed: {}", e)))?
            .map_err(|e| Text2SqlError::Introspection(e.to_string()))
    }

    async fn fetch(&self, sql: &str, max_rows: usize, timeout: Duration) -> std::result::Result<RowSet, String> {
        let conn = self.open_read_only().map_err(|e| e.to_string())?;
        let mut guard = InterruptOnDrop(Some(conn.get_interrupt_handle()));
        let sql = sql.to_string();
        let task = tokio::task::spawn_blocking(move || read_rows(&conn, &sql, max_rows));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result.map_err(|e| e.to_string())
            }
            Ok(Err(e)) => Err(format!("query task failed: {}", e)),
            Err(_) => Err(format!("statement timed out after {} ms", timeout.as_millis())),
        }
    }
}

/// Interrupts the connection unless disarmed.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            debug!("Interrupting SQLite statement");
            handle.interrupt();
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn read_schema(conn: &Connection) -> rusqlite::Result<Vec<SchemaEntry>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY rowid",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut entries = Vec::with_capacity(tables.len());
    for table in tables {
        let mut fk_stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(&table)))?;
        let foreign_keys = fk_stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut col_stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))?;
        let columns = col_stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let data_type: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
                let pk: i64 = row.get(5)?;
                let mut column = ColumnDescriptor::new(name, data_type);
                if pk > 0 {
                    column = column.primary_key();
                }
                if let Some((_, target, to)) = foreign_keys.iter().find(|(from, _, _)| *from == column.name) {
                    // a NULL target column means the parent's primary key
                    let to = to.clone().unwrap_or_else(|| "rowid".to_string());
                    column = column.foreign_key(target.clone(), to);
                }
                Ok(column)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        entries.push(SchemaEntry::new(table, columns));
    }
    Ok(entries)
}

/// Only the first statement of `sql` is prepared and run.
fn read_rows(conn: &Connection, sql: &str, max_rows: usize) -> rusqlite::Result<RowSet> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut set = RowSet {
        columns,
        ..RowSet::default()
    };
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if set.rows.len() == max_rows {
            set.truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i)?));
        }
        set.rows.push(values);
    }
    Ok(set)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}
