//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and functions
//! to make it easier to get started with the library.

pub use crate::config::{AccessPolicy, DatabaseTarget, RegistryConfig, RoutingMode};
pub use crate::driver::{NativeConnection, NativeDriver};
pub use crate::error::SqlMultiplexError;
pub use crate::handle::QueryHandle;
pub use crate::node::{CloseOutcome, ConnectionNode};
pub use crate::registry::Registry;
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::schema::{SchemaIntrospection, SqliteSchema};
pub use crate::types::RowValues;

#[cfg(feature = "postgres")]
pub use crate::driver::PostgresDriver;
#[cfg(feature = "sqlite")]
pub use crate::driver::SqliteDriver;
