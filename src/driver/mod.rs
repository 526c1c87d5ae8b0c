//! The native driver capability the multiplexer sits in front of.
//!
//! A [`NativeDriver`] opens connections for a [`DatabaseTarget`]; a
//! [`NativeConnection`] runs statements. Neither knows anything about
//! threads or routing: every call into a connection is already serialized
//! by the owning [`ConnectionNode`](crate::ConnectionNode).

use std::fmt;
use std::sync::Arc;

use crate::config::DatabaseTarget;
use crate::error::SqlMultiplexError;
use crate::results::ResultSet;
use crate::types::RowValues;

pub mod namespace;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDriver;

/// Opens native connections.
pub trait NativeDriver: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Open a connection registered under `connection_name`.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ConfigError`] when the target's mode is
    /// not one this driver understands, or the driver's own error when the
    /// open itself fails.
    fn open(
        &self,
        connection_name: &str,
        target: &DatabaseTarget,
    ) -> Result<Box<dyn NativeConnection>, SqlMultiplexError>;
}

/// One open native connection.
pub trait NativeConnection: Send {
    /// Validate `sql` against the connection without running it.
    ///
    /// # Errors
    /// Returns the driver's error for invalid SQL.
    fn prepare(&mut self, sql: &str) -> Result<(), SqlMultiplexError>;

    /// Run one statement with positional parameters.
    ///
    /// # Errors
    /// Returns the driver's error unmodified.
    fn execute(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlMultiplexError>;

    /// Run several `;`-separated statements with no parameters.
    ///
    /// # Errors
    /// Returns the driver's error unmodified.
    fn execute_batch(&mut self, sql: &str) -> Result<(), SqlMultiplexError>;

    /// Close the connection, consuming it.
    ///
    /// # Errors
    /// Returns the driver's error if the close itself fails; the connection is
    /// gone either way.
    fn close(self: Box<Self>) -> Result<(), SqlMultiplexError>;
}

/// Built-in driver for `driver_name`, if one is compiled in.
///
/// Recognised names are case-insensitive: `sqlite`, `sqlite3`, `qsqlite` for
/// the rusqlite driver and `postgres`, `postgresql` for tokio-postgres.
#[must_use]
pub fn lookup_driver(driver_name: &str) -> Option<Arc<dyn NativeDriver>> {
    let name = driver_name.to_ascii_lowercase();
    match name.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" | "sqlite3" | "qsqlite" => Some(Arc::new(SqliteDriver)),
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => Some(Arc::new(PostgresDriver)),
        _ => None,
    }
}
