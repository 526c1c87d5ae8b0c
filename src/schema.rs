//! Table and column introspection plus batched upserts.
//!
//! This is the narrow surface a schema-sync layer needs from a live
//! connection. It never issues DDL.

use crate::error::SqlMultiplexError;
use crate::handle::QueryHandle;
use crate::types::RowValues;

/// Read-only catalog queries and queued writes over one connection.
pub trait SchemaIntrospection {
    /// # Errors
    /// Returns the driver's error.
    fn has_table(&mut self, table: &str) -> Result<bool, SqlMultiplexError>;

    /// User tables, sorted by name.
    ///
    /// # Errors
    /// Returns the driver's error.
    fn tables(&mut self) -> Result<Vec<String>, SqlMultiplexError>;

    /// First primary-key column of `table`, if it declares one.
    ///
    /// # Errors
    /// Returns the driver's error.
    fn primary_key_name(&mut self, table: &str) -> Result<Option<String>, SqlMultiplexError>;

    /// Columns of `table` in declaration order.
    ///
    /// # Errors
    /// Returns the driver's error.
    fn column_names(&mut self, table: &str) -> Result<Vec<String>, SqlMultiplexError>;

    /// Columns of `table` that reference another table.
    ///
    /// # Errors
    /// Returns the driver's error.
    fn foreign_key_names(&mut self, table: &str) -> Result<Vec<String>, SqlMultiplexError>;

    /// Queue an insert-or-replace of one row. Nothing runs until
    /// [`execute_batch`](Self::execute_batch).
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ParameterError`] for an empty row.
    fn prepare_upsert(
        &mut self,
        table: &str,
        values: Vec<(String, RowValues)>,
    ) -> Result<(), SqlMultiplexError>;

    /// Run every queued upsert in one transaction and return the rows written.
    ///
    /// # Errors
    /// Returns the first driver error; the transaction is rolled back and the
    /// queue is cleared.
    fn execute_batch(&mut self) -> Result<usize, SqlMultiplexError>;
}

struct PendingUpsert {
    sql: String,
    params: Vec<RowValues>,
}

/// SQLite-dialect [`SchemaIntrospection`] running over a held [`QueryHandle`].
///
/// ```no_run
/// use sql_multiplex::prelude::*;
///
/// # fn demo(registry: &Registry) -> Result<(), SqlMultiplexError> {
/// let mut query = registry.query();
/// let mut schema = SqliteSchema::new(&mut query);
/// if schema.has_table("users")? {
///     schema.prepare_upsert(
///         "users",
///         vec![("id".into(), RowValues::Int(1)), ("name".into(), "alice".into())],
///     )?;
///     schema.execute_batch()?;
/// }
/// # Ok(()) }
/// ```
pub struct SqliteSchema<'h> {
    handle: &'h mut QueryHandle,
    pending: Vec<PendingUpsert>,
}

impl<'h> SqliteSchema<'h> {
    pub fn new(handle: &'h mut QueryHandle) -> Self {
        Self {
            handle,
            pending: Vec::new(),
        }
    }

    /// Upserts queued and not yet executed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn text_column(&mut self, sql: &str, params: &[RowValues]) -> Result<Vec<String>, SqlMultiplexError> {
        self.handle.exec(sql, params)?;
        Ok(self
            .handle
            .fetch_all()
            .into_iter()
            .filter_map(|row| {
                row.get_by_index(0)
                    .and_then(RowValues::as_text)
                    .map(str::to_string)
            })
            .collect())
    }

    fn run_pending(&mut self, pending: &[PendingUpsert]) -> Result<usize, SqlMultiplexError> {
        let mut written = 0;
        for upsert in pending {
            written += self.handle.exec(&upsert.sql, &upsert.params)?;
        }
        Ok(written)
    }
}

impl SchemaIntrospection for SqliteSchema<'_> {
    fn has_table(&mut self, table: &str) -> Result<bool, SqlMultiplexError> {
        let found = self.text_column(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            &[RowValues::from(table)],
        )?;
        Ok(!found.is_empty())
    }

    fn tables(&mut self) -> Result<Vec<String>, SqlMultiplexError> {
        self.text_column(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )
    }

    fn primary_key_name(&mut self, table: &str) -> Result<Option<String>, SqlMultiplexError> {
        let keys = self.text_column(
            "SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk",
            &[RowValues::from(table)],
        )?;
        Ok(keys.into_iter().next())
    }

    fn column_names(&mut self, table: &str) -> Result<Vec<String>, SqlMultiplexError> {
        self.text_column(
            "SELECT name FROM pragma_table_info(?1) ORDER BY cid",
            &[RowValues::from(table)],
        )
    }

    fn foreign_key_names(&mut self, table: &str) -> Result<Vec<String>, SqlMultiplexError> {
        self.text_column(
            "SELECT \"from\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
            &[RowValues::from(table)],
        )
    }

    fn prepare_upsert(
        &mut self,
        table: &str,
        values: Vec<(String, RowValues)>,
    ) -> Result<(), SqlMultiplexError> {
        if values.is_empty() {
            return Err(SqlMultiplexError::ParameterError(format!(
                "upsert into {table} has no columns"
            )));
        }
        let (columns, params): (Vec<String>, Vec<RowValues>) = values.into_iter().unzip();
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=params.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({column_list}) VALUES ({placeholders})",
            quote_ident(table)
        );
        self.pending.push(PendingUpsert { sql, params });
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<usize, SqlMultiplexError> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(0);
        }
        self.handle.execute_batch("BEGIN")?;
        match self.run_pending(&pending) {
            Ok(written) => {
                self.handle.execute_batch("COMMIT")?;
                tracing::debug!(statements = pending.len(), written, "upsert batch committed");
                Ok(written)
            }
            Err(err) => {
                if let Err(rollback_err) = self.handle.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback_err, "rollback after failed upsert batch failed");
                }
                Err(err)
            }
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
