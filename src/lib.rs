#![doc = r#"
Thread-aware connection multiplexer for synchronous SQL drivers.

`sql-multiplex` sits between application threads and a native driver
(rusqlite or tokio-postgres out of the box, or your own [`NativeDriver`]).
For every call to [`Registry::query`] it decides which connection the
calling thread uses, locks that connection for as long as the returned
[`QueryHandle`] lives, spaces dispatches out for fragile file-backed
engines, and closes connections that sit idle.

- **Single** routing: one connection shared by every thread.
- **Multi** routing: one connection per calling thread.
- **Auto** routing: `Multi` for server engines (postgres, mysql, ...),
  `Single` with 5 ms spacing for everything else.

```rust,no_run
use sql_multiplex::prelude::*;

# fn main() -> Result<(), SqlMultiplexError> {
let target = DatabaseTarget::file("sqlite", "app", "app.db");
let registry = Registry::new(target, AccessPolicy::new())?;

let mut query = registry.query();
query.execute_batch("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT);")?;
query.exec(
    "INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?2)",
    &[RowValues::from("greeting"), RowValues::from("hello")],
)?;
drop(query);

let mut query = registry.query();
query.exec("SELECT v FROM kv WHERE k = ?1", &[RowValues::from("greeting")])?;
let row = query.next_row().expect("row present");
assert_eq!(row.get("v").and_then(RowValues::as_text), Some("hello"));
# Ok(()) }
```
"#]

pub mod config;
pub mod driver;
pub mod error;
pub mod handle;
pub mod node;
pub mod prelude;
pub mod registry;
pub mod results;
pub mod schema;
pub mod types;

pub use config::{
    AccessPolicy, DatabaseTarget, RegistryConfig, ResolvedPolicy, RoutingMode, TargetLocation,
    TargetMode,
};
pub use driver::{NativeConnection, NativeDriver, lookup_driver};
pub use error::SqlMultiplexError;
pub use handle::QueryHandle;
pub use node::{
    CloseOutcome, ConnectionNode, IdleTimerService, NodeId, NodeStats, NodeStatsSnapshot,
    TimerHandle,
};
pub use registry::Registry;
pub use results::{CustomDbRow, ResultSet};
pub use schema::{SchemaIntrospection, SqliteSchema};
pub use types::RowValues;

#[cfg(feature = "postgres")]
pub use driver::PostgresDriver;
#[cfg(feature = "sqlite")]
pub use driver::SqliteDriver;
