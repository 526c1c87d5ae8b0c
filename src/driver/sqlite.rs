use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, Statement, ToSql};

use crate::config::{DatabaseTarget, TargetLocation};
use crate::error::SqlMultiplexError;
use crate::results::ResultSet;
use crate::types::RowValues;

use super::{NativeConnection, NativeDriver};

/// rusqlite-backed driver. Only file-mode targets are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl NativeDriver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn open(
        &self,
        connection_name: &str,
        target: &DatabaseTarget,
    ) -> Result<Box<dyn NativeConnection>, SqlMultiplexError> {
        let TargetLocation::File { path } = target.location() else {
            return Err(SqlMultiplexError::ConfigError(format!(
                "sqlite connection {connection_name} needs a file target"
            )));
        };
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        tracing::debug!(connection = connection_name, path = %path, "sqlite connection opened");
        Ok(Box::new(SqliteNativeConnection { conn }))
    }
}

pub(crate) struct SqliteNativeConnection {
    conn: Connection,
}

impl NativeConnection for SqliteNativeConnection {
    fn prepare(&mut self, sql: &str) -> Result<(), SqlMultiplexError> {
        self.conn.prepare_cached(sql)?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlMultiplexError> {
        let values = convert_params(params);
        let mut stmt = self.conn.prepare_cached(sql)?;
        if stmt.column_count() == 0 {
            let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
            let changed = stmt.execute(&param_refs[..])?;
            return Ok(ResultSet::affected(changed));
        }
        build_result_set(&mut stmt, &values)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), SqlMultiplexError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), SqlMultiplexError> {
        self.conn.close().map_err(|(_, err)| SqlMultiplexError::SqliteError(err))
    }
}

/// Convert a single `RowValues` to a rusqlite `Value`.
#[must_use]
pub fn row_value_to_sqlite_value(value: &RowValues) -> Value {
    match value {
        RowValues::Int(i) => Value::Integer(*i),
        RowValues::Float(f) => Value::Real(*f),
        RowValues::Text(s) => Value::Text(s.clone()),
        RowValues::Bool(b) => Value::Integer(i64::from(*b)),
        RowValues::Timestamp(dt) => Value::Text(dt.format("%F %T%.f").to_string()),
        RowValues::Null => Value::Null,
        RowValues::JSON(jval) => Value::Text(jval.to_string()),
        RowValues::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

fn convert_params(params: &[RowValues]) -> Vec<Value> {
    params.iter().map(row_value_to_sqlite_value).collect()
}

/// Extract a `RowValues` from a `SQLite` row.
///
/// # Errors
///
/// Returns `SqlMultiplexError` if the value cannot be read.
pub fn sqlite_extract_value(row: &rusqlite::Row, idx: usize) -> Result<RowValues, SqlMultiplexError> {
    let value: Value = row.get(idx)?;
    match value {
        Value::Null => Ok(RowValues::Null),
        Value::Integer(i) => Ok(RowValues::Int(i)),
        Value::Real(f) => Ok(RowValues::Float(f)),
        Value::Text(s) => Ok(RowValues::Text(s)),
        Value::Blob(b) => Ok(RowValues::Blob(b)),
    }
}

fn build_result_set(stmt: &mut Statement, params: &[Value]) -> Result<ResultSet, SqlMultiplexError> {
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|v| v as &dyn ToSql).collect();
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect();
    let col_count = column_names.len();

    let mut result_set = ResultSet::with_capacity(10);
    result_set.set_column_names(Arc::new(column_names));

    let mut rows_iter = stmt.query(&param_refs[..])?;
    while let Some(row) = rows_iter.next()? {
        let mut row_values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            row_values.push(sqlite_extract_value(row, i)?);
        }
        result_set.add_row_values(row_values);
    }

    Ok(result_set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_target() -> DatabaseTarget {
        DatabaseTarget::file("sqlite", "sqlite-unit", ":memory:")
    }

    #[test]
    fn host_target_is_a_config_error() {
        let target = DatabaseTarget::host("sqlite", "x", "h", "d", "u", "p");
        let err = SqliteDriver.open("x(1)", &target).err();
        assert!(matches!(err, Some(SqlMultiplexError::ConfigError(_))));
    }

    #[test]
    fn select_and_dml_results() {
        let mut conn = SqliteDriver
            .open("sqlite-unit(1)", &memory_target())
            .expect("open memory db");
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, flag INTEGER);")
            .expect("create");
        let inserted = conn
            .execute(
                "INSERT INTO t (id, name, flag) VALUES (?1, ?2, ?3)",
                &[RowValues::Int(1), RowValues::Text("a".into()), RowValues::Bool(true)],
            )
            .expect("insert");
        assert_eq!(inserted.rows_affected, 1);
        assert!(inserted.results.is_empty());

        let rs = conn
            .execute("SELECT id, name, flag FROM t WHERE id = ?1", &[RowValues::Int(1)])
            .expect("select");
        assert_eq!(rs.results.len(), 1);
        let row = &rs.results[0];
        assert_eq!(row.get("name").and_then(RowValues::as_text), Some("a"));
        assert_eq!(row.get("flag").and_then(RowValues::as_bool), Some(&true));
        conn.close().expect("close");
    }

    #[test]
    fn prepare_reports_bad_sql() {
        let mut conn = SqliteDriver
            .open("sqlite-unit(2)", &memory_target())
            .expect("open memory db");
        assert!(conn.prepare("SELEC nonsense").is_err());
        assert!(conn.prepare("SELECT 1").is_ok());
    }
}
