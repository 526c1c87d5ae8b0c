//! Move-only, lock-holding query handles.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use crate::driver::NativeConnection;
use crate::error::SqlMultiplexError;
use crate::node::{NodeStats, OrphanFlag, SlotGuard};
use crate::results::CustomDbRow;
use crate::types::RowValues;

/// The held lock on one node's connection slot.
///
/// Releasing consumes the lease, so a lease can be released at most once.
pub(crate) struct Lease {
    guard: SlotGuard,
    stats: Arc<NodeStats>,
    connection: String,
    orphaned: OrphanFlag,
}

impl Lease {
    pub(crate) fn new(
        guard: SlotGuard,
        stats: Arc<NodeStats>,
        connection: String,
        orphaned: OrphanFlag,
    ) -> Self {
        Self {
            guard,
            stats,
            connection,
            orphaned,
        }
    }

    fn release(self) {
        let Lease {
            guard,
            stats,
            connection,
            orphaned,
        } = self;
        stats.record_release();
        let orphaned = orphaned.lock();
        // Once the node is gone the last outstanding lease owns the connection.
        if *orphaned && stats.outstanding() == 0 {
            let orphan = guard.borrow_mut().take();
            if let Some(conn) = orphan {
                if let Err(err) = conn.close() {
                    tracing::warn!(connection = %connection, error = %err, "error while closing connection");
                }
                stats.record_close();
                tracing::debug!(connection = %connection, "connection closed after its node was destroyed");
            }
        }
        // The slot unlocks before the flag does.
        drop(guard);
        drop(orphaned);
    }
}

#[derive(Default)]
struct StatementState {
    sql: Option<String>,
    binds: Vec<RowValues>,
    rows: VecDeque<CustomDbRow>,
    current: Option<CustomDbRow>,
    rows_affected: usize,
}

/// Exclusive access to one node's native connection.
///
/// Obtained from [`Registry::query`](crate::Registry::query) or
/// [`ConnectionNode::query`](crate::ConnectionNode::query). While the handle
/// is alive no other thread can use that connection; dropping it unlocks.
/// [`take`](Self::take) moves the lock into a new handle and leaves this one
/// empty, and dropping an empty handle does nothing, so the lock is released
/// exactly once however the handle is moved around.
///
/// The handle is tied to the thread that acquired it and cannot be sent to
/// another thread.
///
/// ```no_run
/// use sql_multiplex::prelude::*;
///
/// # fn demo(registry: &Registry) -> Result<(), SqlMultiplexError> {
/// let mut query = registry.query();
/// query.prepare("INSERT INTO t (id, name) VALUES (?1, ?2)")?;
/// query.bind(1_i64);
/// query.bind("alice");
/// query.execute()?;
///
/// query.prepare("SELECT name FROM t WHERE id = ?1")?;
/// query.bind(1_i64);
/// query.execute()?;
/// while let Some(row) = query.next_row() {
///     println!("{:?}", row.get("name"));
/// }
/// # Ok(()) }
/// ```
pub struct QueryHandle {
    lease: Option<Lease>,
    dispatched_at: Instant,
    statement: StatementState,
}

impl QueryHandle {
    pub(crate) fn new(lease: Lease, dispatched_at: Instant) -> Self {
        Self {
            lease: Some(lease),
            dispatched_at,
            statement: StatementState::default(),
        }
    }

    /// True once the lock has been moved out with [`take`](Self::take).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lease.is_none()
    }

    /// Whether this handle holds a lock on an open connection.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.guard.borrow().is_some())
    }

    /// Name of the connection this handle locks.
    #[must_use]
    pub fn connection_name(&self) -> Option<&str> {
        self.lease.as_ref().map(|lease| lease.connection.as_str())
    }

    /// When the registry let this dispatch through (after any spacing wait).
    #[must_use]
    pub fn dispatched_at(&self) -> Instant {
        self.dispatched_at
    }

    /// Move the lock and statement state into a new handle, leaving this one empty.
    #[must_use]
    pub fn take(&mut self) -> QueryHandle {
        QueryHandle {
            lease: self.lease.take(),
            dispatched_at: self.dispatched_at,
            statement: mem::take(&mut self.statement),
        }
    }

    /// Exchange everything this handle holds with `other`.
    pub fn swap(&mut self, other: &mut QueryHandle) {
        mem::swap(self, other);
    }

    /// Release the lock now. Same as dropping the handle.
    pub fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }

    /// Prepare `sql`, discarding any previous statement, bindings and rows.
    ///
    /// # Errors
    /// Returns the driver's error if the statement is invalid, or
    /// [`SqlMultiplexError::ConnectionError`] if the connection is not open.
    pub fn prepare(&mut self, sql: &str) -> Result<(), SqlMultiplexError> {
        self.clear();
        self.with_connection(|conn| conn.prepare(sql))?;
        self.statement.sql = Some(sql.to_string());
        Ok(())
    }

    /// Append a positional parameter for the prepared statement.
    pub fn bind(&mut self, value: impl Into<RowValues>) {
        self.statement.binds.push(value.into());
    }

    /// Run the prepared statement with the bound parameters.
    ///
    /// Bindings are consumed; rows become available through
    /// [`next_row`](Self::next_row). Returns the affected (or fetched) row count.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ExecutionError`] if nothing was prepared,
    /// otherwise the driver's error unmodified.
    pub fn execute(&mut self) -> Result<usize, SqlMultiplexError> {
        let sql = self.statement.sql.clone().ok_or_else(|| {
            SqlMultiplexError::ExecutionError("no statement prepared".to_string())
        })?;
        let params = mem::take(&mut self.statement.binds);
        self.run(&sql, &params)
    }

    /// Run `sql` directly with `params`, replacing any prepared statement.
    ///
    /// # Errors
    /// Returns the driver's error unmodified.
    pub fn exec(&mut self, sql: &str, params: &[RowValues]) -> Result<usize, SqlMultiplexError> {
        self.clear();
        self.statement.sql = Some(sql.to_string());
        self.run(sql, params)
    }

    /// Run several statements with no parameters and no result rows.
    ///
    /// # Errors
    /// Returns the driver's error unmodified.
    pub fn execute_batch(&mut self, sql: &str) -> Result<(), SqlMultiplexError> {
        self.clear();
        self.with_connection(|conn| conn.execute_batch(sql))
    }

    /// Advance to the next fetched row.
    pub fn next_row(&mut self) -> Option<&CustomDbRow> {
        self.statement.current = self.statement.rows.pop_front();
        self.statement.current.as_ref()
    }

    /// The row the last [`next_row`](Self::next_row) moved to.
    #[must_use]
    pub fn current_row(&self) -> Option<&CustomDbRow> {
        self.statement.current.as_ref()
    }

    /// Column `index` of the current row.
    #[must_use]
    pub fn value(&self, index: usize) -> Option<&RowValues> {
        self.current_row().and_then(|row| row.get_by_index(index))
    }

    /// Drain every remaining fetched row.
    pub fn fetch_all(&mut self) -> Vec<CustomDbRow> {
        self.statement.current = None;
        self.statement.rows.drain(..).collect()
    }

    #[must_use]
    pub fn rows_affected(&self) -> usize {
        self.statement.rows_affected
    }

    /// Forget the prepared statement, bindings and fetched rows.
    pub fn clear(&mut self) {
        self.statement = StatementState::default();
    }

    /// Run `func` against the native connection while this handle holds its lock.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ExecutionError`] on an empty handle,
    /// [`SqlMultiplexError::ConnectionError`] when the connection is closed,
    /// or whatever `func` returns.
    pub fn with_connection<R>(
        &mut self,
        func: impl FnOnce(&mut dyn NativeConnection) -> Result<R, SqlMultiplexError>,
    ) -> Result<R, SqlMultiplexError> {
        let lease = self.lease.as_ref().ok_or_else(|| {
            SqlMultiplexError::ExecutionError("query handle is empty".to_string())
        })?;
        let mut slot = lease.guard.borrow_mut();
        let conn = slot.as_mut().ok_or_else(|| {
            SqlMultiplexError::ConnectionError(format!(
                "connection {} is not open",
                lease.connection
            ))
        })?;
        func(conn.as_mut())
    }

    fn run(&mut self, sql: &str, params: &[RowValues]) -> Result<usize, SqlMultiplexError> {
        let result_set = self.with_connection(|conn| conn.execute(sql, params))?;
        self.statement.rows_affected = result_set.rows_affected;
        self.statement.rows = result_set.results.into();
        self.statement.current = None;
        Ok(self.statement.rows_affected)
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("connection", &self.connection_name())
            .field("sql", &self.statement.sql)
            .field("pending_rows", &self.statement.rows.len())
            .finish_non_exhaustive()
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}
