//! Database targets, access policies and the driver-based policy derivation.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SqlMultiplexError;

/// Drivers that tolerate several connections being used concurrently.
///
/// Anything not listed here is treated as a fragile, file-backed engine.
const CONCURRENT_DRIVERS: &[&str] = &[
    "postgres",
    "postgresql",
    "mysql",
    "mssql",
    "odbc",
    "qmysql",
    "qodbc",
];

/// Spacing applied to fragile drivers when the policy leaves it unset.
pub const DEFAULT_FRAGILE_SPACING_MS: u64 = 5;

/// Idle window used when a policy does not name one.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60 * 1000;

/// Returns true when `driver_name` names a server engine that can serve one
/// connection per thread without spacing.
#[must_use]
pub fn is_concurrent_driver(driver_name: &str) -> bool {
    CONCURRENT_DRIVERS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(driver_name))
}

/// Where a target lives: a single local path, or a server with credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TargetLocation {
    /// File (name) mode: one path or DSN string handed to the driver.
    File { path: String },
    /// Host mode: server address, database name and credentials.
    Host {
        host: String,
        database: String,
        user: String,
        password: String,
    },
}

impl fmt::Debug for TargetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path } => f.debug_struct("File").field("path", path).finish(),
            Self::Host {
                host,
                database,
                user,
                ..
            } => f
                .debug_struct("Host")
                .field("host", host)
                .field("database", database)
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Short name for the active [`TargetLocation`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetMode {
    File,
    Host,
}

/// Immutable description of what to connect to.
///
/// Mode-specific accessors return `None` for the other mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTarget {
    driver_name: String,
    connection_id: String,
    #[serde(flatten)]
    location: TargetLocation,
}

impl DatabaseTarget {
    /// Target a local file (or DSN) through `driver_name`.
    #[must_use]
    pub fn file(
        driver_name: impl Into<String>,
        connection_id: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            connection_id: connection_id.into(),
            location: TargetLocation::File { path: path.into() },
        }
    }

    /// Target a database server through `driver_name`.
    #[must_use]
    pub fn host(
        driver_name: impl Into<String>,
        connection_id: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            connection_id: connection_id.into(),
            location: TargetLocation::Host {
                host: host.into(),
                database: database.into(),
                user: user.into(),
                password: password.into(),
            },
        }
    }

    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn location(&self) -> &TargetLocation {
        &self.location
    }

    #[must_use]
    pub fn mode(&self) -> TargetMode {
        match self.location {
            TargetLocation::File { .. } => TargetMode::File,
            TargetLocation::Host { .. } => TargetMode::Host,
        }
    }

    /// File path, when this is a file-mode target.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match &self.location {
            TargetLocation::File { path } => Some(path),
            TargetLocation::Host { .. } => None,
        }
    }

    /// Server host, when this is a host-mode target.
    #[must_use]
    pub fn host_name(&self) -> Option<&str> {
        match &self.location {
            TargetLocation::Host { host, .. } => Some(host),
            TargetLocation::File { .. } => None,
        }
    }

    /// Check that every field the driver will need is present.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ConfigError`] naming the first empty field.
    pub fn validate(&self) -> Result<(), SqlMultiplexError> {
        if self.driver_name.trim().is_empty() {
            return Err(SqlMultiplexError::ConfigError(
                "driver_name is required".to_string(),
            ));
        }
        if self.connection_id.trim().is_empty() {
            return Err(SqlMultiplexError::ConfigError(
                "connection_id is required".to_string(),
            ));
        }
        match &self.location {
            TargetLocation::File { path } if path.is_empty() => Err(
                SqlMultiplexError::ConfigError("path is required in file mode".to_string()),
            ),
            TargetLocation::Host { host, .. } if host.is_empty() => Err(
                SqlMultiplexError::ConfigError("host is required in host mode".to_string()),
            ),
            TargetLocation::Host { database, .. } if database.is_empty() => Err(
                SqlMultiplexError::ConfigError("database is required in host mode".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// How calling threads are mapped onto connection nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Pick `Multi` for server engines and `Single` for everything else.
    #[default]
    Auto,
    /// One connection shared by every thread.
    Single,
    /// One connection per calling thread.
    Multi,
}

/// Caller-supplied access policy. Resolve it against a driver before use.
///
/// ```
/// use sql_multiplex::prelude::*;
///
/// let policy = AccessPolicy::new()
///     .with_idle_timeout_ms(30_000)
///     .with_routing_mode(RoutingMode::Single)
///     .with_min_spacing_ms(10);
/// let resolved = policy.resolve("sqlite");
/// assert_eq!(resolved.min_spacing_ms(), 10);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Idle window before a node tries to close its connection; 0 disables.
    pub idle_timeout_ms: u64,
    pub routing_mode: RoutingMode,
    /// Minimum gap between dispatches; `None` derives it from the driver.
    pub min_spacing_ms: Option<u64>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            routing_mode: RoutingMode::Auto,
            min_spacing_ms: None,
        }
    }
}

impl AccessPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_idle_timeout_ms(mut self, idle_timeout_ms: u64) -> Self {
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    #[must_use]
    pub fn with_routing_mode(mut self, routing_mode: RoutingMode) -> Self {
        self.routing_mode = routing_mode;
        self
    }

    #[must_use]
    pub fn with_min_spacing_ms(mut self, min_spacing_ms: u64) -> Self {
        self.min_spacing_ms = Some(min_spacing_ms);
        self
    }

    /// Apply the driver-based derivation once.
    ///
    /// Server engines resolve `Auto` to `Multi` and an unset spacing to 0
    /// (not enforced). Other drivers resolve `Auto` to `Single` and an unset
    /// spacing to [`DEFAULT_FRAGILE_SPACING_MS`] (enforced). An explicit
    /// spacing is always enforced.
    #[must_use]
    pub fn resolve(&self, driver_name: &str) -> ResolvedPolicy {
        let concurrent = is_concurrent_driver(driver_name);

        let routing_mode = match self.routing_mode {
            RoutingMode::Auto if concurrent => RoutingMode::Multi,
            RoutingMode::Auto => RoutingMode::Single,
            explicit => explicit,
        };

        let (min_spacing_ms, spacing_enforced) = match self.min_spacing_ms {
            Some(explicit) => (explicit, true),
            None if concurrent => (0, false),
            None => (DEFAULT_FRAGILE_SPACING_MS, true),
        };

        ResolvedPolicy {
            idle_timeout_ms: self.idle_timeout_ms,
            routing_mode,
            min_spacing_ms,
            spacing_enforced,
        }
    }
}

/// An [`AccessPolicy`] after driver derivation. `routing_mode` is never `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy {
    idle_timeout_ms: u64,
    routing_mode: RoutingMode,
    min_spacing_ms: u64,
    spacing_enforced: bool,
}

impl ResolvedPolicy {
    #[must_use]
    pub fn routing_mode(&self) -> RoutingMode {
        self.routing_mode
    }

    #[must_use]
    pub fn idle_timeout_ms(&self) -> u64 {
        self.idle_timeout_ms
    }

    /// Idle window, or `None` when idle closing is disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    #[must_use]
    pub fn min_spacing_ms(&self) -> u64 {
        self.min_spacing_ms
    }

    #[must_use]
    pub fn spacing_enforced(&self) -> bool {
        self.spacing_enforced
    }

    /// Spacing to enforce between dispatches, or `None` when disabled.
    #[must_use]
    pub fn min_spacing(&self) -> Option<Duration> {
        self.spacing_enforced
            .then(|| Duration::from_millis(self.min_spacing_ms))
    }
}

/// Serializable bundle used to build a [`Registry`](crate::Registry).
///
/// ```
/// use sql_multiplex::prelude::*;
///
/// let cfg = RegistryConfig::from_json_str(
///     r#"{ "target": { "driver_name": "sqlite", "connection_id": "app",
///                      "mode": "file", "path": "app.db" },
///          "policy": { "routing_mode": "single", "min_spacing_ms": 10 } }"#,
/// )?;
/// assert_eq!(cfg.policy.idle_timeout_ms, 60_000);
/// # Ok::<(), SqlMultiplexError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub target: DatabaseTarget,
    #[serde(default)]
    pub policy: AccessPolicy,
}

impl RegistryConfig {
    #[must_use]
    pub fn new(target: DatabaseTarget, policy: AccessPolicy) -> Self {
        Self { target, policy }
    }

    /// Parse a JSON document and validate its target.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ConfigError`] on malformed JSON or an
    /// incomplete target.
    pub fn from_json_str(json: &str) -> Result<Self, SqlMultiplexError> {
        let cfg: RegistryConfig = serde_json::from_str(json)?;
        cfg.target.validate()?;
        Ok(cfg)
    }

    /// Read and parse a JSON config file.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ConfigError`] if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SqlMultiplexError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SqlMultiplexError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_on_file_driver_resolves_single_with_default_spacing() {
        let resolved = AccessPolicy::new().resolve("fileSQL");
        assert_eq!(resolved.routing_mode(), RoutingMode::Single);
        assert_eq!(resolved.min_spacing_ms(), 5);
        assert!(resolved.spacing_enforced());
    }

    #[test]
    fn auto_on_server_driver_resolves_multi_without_spacing() {
        let resolved = AccessPolicy::new().resolve("PostgreSQL");
        assert_eq!(resolved.routing_mode(), RoutingMode::Multi);
        assert_eq!(resolved.min_spacing_ms(), 0);
        assert!(resolved.min_spacing().is_none());
    }

    #[test]
    fn explicit_spacing_is_enforced_even_for_server_drivers() {
        let resolved = AccessPolicy::new().with_min_spacing_ms(0).resolve("mysql");
        assert!(resolved.spacing_enforced());
        assert_eq!(resolved.min_spacing(), Some(Duration::ZERO));
    }

    #[test]
    fn explicit_routing_is_kept() {
        let resolved = AccessPolicy::new()
            .with_routing_mode(RoutingMode::Multi)
            .resolve("sqlite");
        assert_eq!(resolved.routing_mode(), RoutingMode::Multi);
        assert_eq!(resolved.min_spacing_ms(), 5);
    }

    #[test]
    fn zero_idle_timeout_disables_idle_close() {
        let resolved = AccessPolicy::new().with_idle_timeout_ms(0).resolve("sqlite");
        assert!(resolved.idle_timeout().is_none());
    }

    #[test]
    fn target_accessors_follow_mode() {
        let file = DatabaseTarget::file("sqlite", "main", "/tmp/a.db");
        assert_eq!(file.mode(), TargetMode::File);
        assert_eq!(file.path(), Some("/tmp/a.db"));
        assert_eq!(file.host_name(), None);

        let host = DatabaseTarget::host("postgres", "main", "db.local", "app", "svc", "pw");
        assert_eq!(host.mode(), TargetMode::Host);
        assert_eq!(host.path(), None);
        assert_eq!(host.host_name(), Some("db.local"));
    }

    #[test]
    fn debug_output_hides_password() {
        let host = DatabaseTarget::host("postgres", "main", "db.local", "app", "svc", "hunter2");
        let rendered = format!("{host:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(DatabaseTarget::file("", "id", "a.db").validate().is_err());
        assert!(DatabaseTarget::file("sqlite", " ", "a.db").validate().is_err());
        assert!(DatabaseTarget::file("sqlite", "id", "").validate().is_err());
        assert!(
            DatabaseTarget::host("postgres", "id", "", "db", "u", "p")
                .validate()
                .is_err()
        );
        assert!(DatabaseTarget::file("sqlite", "id", "a.db").validate().is_ok());
    }

    #[test]
    fn config_parses_host_target_and_defaults_policy() {
        let cfg = RegistryConfig::from_json_str(
            r#"{ "target": { "driver_name": "postgres", "connection_id": "svc",
                             "mode": "host", "host": "localhost", "database": "app",
                             "user": "svc", "password": "pw" } }"#,
        )
        .expect("parse config");
        assert_eq!(cfg.target.mode(), TargetMode::Host);
        assert_eq!(cfg.policy, AccessPolicy::default());
    }

    #[test]
    fn config_rejects_unknown_mode() {
        let err = RegistryConfig::from_json_str(
            r#"{ "target": { "driver_name": "sqlite", "connection_id": "x",
                             "mode": "carrier_pigeon", "path": "a.db" } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, SqlMultiplexError::ConfigError(_)));
    }
}
