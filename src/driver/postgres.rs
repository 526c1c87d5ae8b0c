use std::error::Error;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde_json::Value;
use tokio::runtime::{Builder, Runtime};
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls, Row};
use tokio_util::bytes;

use crate::config::{DatabaseTarget, TargetLocation};
use crate::error::SqlMultiplexError;
use crate::results::ResultSet;
use crate::types::RowValues;

use super::{NativeConnection, NativeDriver};

const DEFAULT_PORT: u16 = 5432;

/// tokio-postgres driver. Only host-mode targets are accepted.
///
/// Each connection owns a current-thread runtime; every call blocks on it, so
/// the connection behaves like a synchronous handle from the caller's thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl NativeDriver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    fn open(
        &self,
        connection_name: &str,
        target: &DatabaseTarget,
    ) -> Result<Box<dyn NativeConnection>, SqlMultiplexError> {
        let TargetLocation::Host {
            host,
            database,
            user,
            password,
        } = target.location()
        else {
            return Err(SqlMultiplexError::ConfigError(format!(
                "postgres connection {connection_name} needs a host target"
            )));
        };

        let (host_name, port) = split_host_port(host)?;
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(host_name)
            .port(port)
            .dbname(database)
            .user(user)
            .password(password)
            .application_name(connection_name);

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                SqlMultiplexError::ConnectionError(format!(
                    "failed to build runtime for {connection_name}: {e}"
                ))
            })?;

        let (client, connection) = runtime.block_on(pg_config.connect(NoTls))?;
        let name = connection_name.to_string();
        runtime.spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(connection = %name, error = %err, "postgres connection task ended");
            }
        });
        tracing::debug!(connection = connection_name, host = %host_name, "postgres connection opened");

        Ok(Box::new(PostgresNativeConnection { runtime, client }))
    }
}

fn split_host_port(host: &str) -> Result<(&str, u16), SqlMultiplexError> {
    match host.rsplit_once(':') {
        Some((name, port)) => port
            .parse::<u16>()
            .map(|port| (name, port))
            .map_err(|_| SqlMultiplexError::ConfigError(format!("invalid port in host {host}"))),
        None => Ok((host, DEFAULT_PORT)),
    }
}

pub(crate) struct PostgresNativeConnection {
    runtime: Runtime,
    client: Client,
}

impl NativeConnection for PostgresNativeConnection {
    fn prepare(&mut self, sql: &str) -> Result<(), SqlMultiplexError> {
        self.runtime.block_on(self.client.prepare(sql))?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlMultiplexError> {
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let client = &self.client;
        self.runtime.block_on(async {
            let stmt = client.prepare(sql).await?;
            if stmt.columns().is_empty() {
                let changed = client.execute(&stmt, &refs).await?;
                return Ok(ResultSet::affected(usize::try_from(changed).unwrap_or(usize::MAX)));
            }
            let column_names: Vec<String> =
                stmt.columns().iter().map(|col| col.name().to_string()).collect();
            let rows = client.query(&stmt, &refs).await?;
            build_result_set(Arc::new(column_names), &rows)
        })
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), SqlMultiplexError> {
        self.runtime.block_on(self.client.batch_execute(sql))?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), SqlMultiplexError> {
        let PostgresNativeConnection { runtime, client } = *self;
        // Dropping the client ends the connection task; let it observe that.
        drop(client);
        runtime.shutdown_background();
        Ok(())
    }
}

fn build_result_set(column_names: Arc<Vec<String>>, rows: &[Row]) -> Result<ResultSet, SqlMultiplexError> {
    let col_count = column_names.len();
    let mut result_set = ResultSet::with_capacity(rows.len());
    result_set.set_column_names(column_names);
    for row in rows {
        let mut row_values = Vec::with_capacity(col_count);
        for idx in 0..col_count {
            row_values.push(postgres_extract_value(row, idx)?);
        }
        result_set.add_row_values(row_values);
    }
    Ok(result_set)
}

/// Extracts a `RowValues` from a `tokio_postgres` Row at the given index.
///
/// # Errors
/// Returns `SqlMultiplexError` if the column cannot be retrieved.
pub fn postgres_extract_value(row: &Row, idx: usize) -> Result<RowValues, SqlMultiplexError> {
    let type_info = row.columns()[idx].type_();
    match type_info.name() {
        "int2" => {
            let val: Option<i16> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))))
        }
        "int4" => {
            let val: Option<i32> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))))
        }
        "int8" => {
            let val: Option<i64> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Int))
        }
        "float4" => {
            let val: Option<f32> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Float(f64::from(v))))
        }
        "float8" => {
            let val: Option<f64> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Float))
        }
        "bool" => {
            let val: Option<bool> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Bool))
        }
        "timestamp" => {
            let val: Option<NaiveDateTime> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Timestamp))
        }
        "json" | "jsonb" => {
            let val: Option<Value> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::JSON))
        }
        "bytea" => {
            let val: Option<Vec<u8>> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Blob))
        }
        _ => {
            let val: Option<String> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Text))
        }
    }
}

impl ToSql for RowValues {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            RowValues::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                _ => (*i).to_sql(ty, out),
            },
            RowValues::Float(f) => match *ty {
                #[allow(clippy::cast_possible_truncation)]
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => (*f).to_sql(ty, out),
            },
            RowValues::Text(s) => s.to_sql(ty, out),
            RowValues::Bool(b) => (*b).to_sql(ty, out),
            RowValues::Timestamp(dt) => dt.to_sql(ty, out),
            RowValues::Null => Ok(IsNull::Yes),
            RowValues::JSON(jsval) => jsval.to_sql(ty, out),
            RowValues::Blob(bytes) => bytes.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::BOOL
                | Type::TIMESTAMP
                | Type::JSON
                | Type::JSONB
                | Type::BYTEA
        )
    }

    to_sql_checked!();
}
