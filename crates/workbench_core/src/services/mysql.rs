//! MySQL adapter built on `mysql_async`.

use async_trait::async_trait;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{WorkbenchError, WorkbenchResult};
use crate::models::{
    CatalogObject, ColumnInfo, ConnectionProfile, EngineKind, QueryResult, Row, Value,
};
use crate::services::adapter::{
    bounded, close_tunnel, log_teardown, open_endpoint, DatabaseAdapter, Endpoint,
    EMPTY_STATEMENT_NOTICE,
};
use crate::services::tunnel::{Tunnel, TunnelState};

/// Schemas MySQL creates for itself.
pub const MYSQL_SYSTEM_SCHEMAS: [&str; 4] =
    ["information_schema", "mysql", "performance_schema", "sys"];

/// Quote an identifier with backticks, doubling embedded backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub struct MySqlAdapter {
    profile: ConnectionProfile,
    conn: Option<Conn>,
    tunnel: Option<Tunnel>,
}

impl MySqlAdapter {
    pub fn new(profile: ConnectionProfile) -> Self {
        Self { profile, conn: None, tunnel: None }
    }

    async fn open_conn(&self, endpoint: &Endpoint) -> WorkbenchResult<Conn> {
        let options = &self.profile.options;
        let opts = OptsBuilder::default()
            .ip_or_hostname(endpoint.host.clone())
            .tcp_port(endpoint.port)
            .user(Some(self.profile.username.clone()))
            .pass(Some(self.profile.password.clone()))
            .db_name(self.profile.default_schema().map(String::from));

        let mut conn = bounded(options.connect_timeout(), "MySQL connect", Conn::new(opts)).await?;

        let session_setup = format!(
            "SET NAMES utf8mb4, SESSION net_read_timeout = {}, SESSION net_write_timeout = {}",
            options.read_timeout_secs, options.write_timeout_secs
        );
        if let Err(e) =
            bounded(options.connect_timeout(), "MySQL session setup", conn.query_drop(session_setup))
                .await
        {
            log_teardown("MySQL disconnect after failed session setup", conn.disconnect().await);
            return Err(e);
        }

        Ok(conn)
    }

    /// Drop the session after a failure that leaves the protocol state unknown.
    async fn abandon(&mut self) {
        tracing::warn!(connection = %self.profile.name, "Dropping MySQL session after timeout");
        self.conn = None;
        close_tunnel(&mut self.tunnel).await;
    }

    /// Run a catalog statement and map its rows, keeping the session bounded by the read timeout.
    async fn catalog<T, F>(&mut self, sql: String, map: F) -> WorkbenchResult<Vec<CatalogObject>>
    where
        T: FromRow + Send + 'static,
        F: Fn(T) -> CatalogObject,
    {
        let limit = self.profile.options.statement_timeout();
        let conn = self.conn.as_mut().ok_or(WorkbenchError::NotConnected)?;
        let started = Instant::now();

        let rows: Vec<T> = match bounded(limit, "Catalog query", conn.query(sql.as_str())).await {
            Ok(rows) => rows,
            Err(e) => {
                if matches!(e, WorkbenchError::NetworkUnreachable { .. }) {
                    self.abandon().await;
                }
                tracing::warn!(sql = %sql, error = %e, "MySQL catalog query failed");
                return Err(e);
            }
        };

        tracing::debug!(
            sql = %sql,
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "MySQL catalog query"
        );
        Ok(rows.into_iter().map(map).collect())
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::MySql
    }

    fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn tunnel_state(&self) -> Option<TunnelState> {
        self.tunnel.as_ref().map(Tunnel::state)
    }

    async fn connect(&mut self) -> WorkbenchResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        self.profile.validate()?;

        let (endpoint, tunnel) = open_endpoint(&self.profile).await?;
        self.tunnel = tunnel;

        match self.open_conn(&endpoint).await {
            Ok(conn) => {
                tracing::info!(
                    connection = %self.profile.name,
                    host = %endpoint.host,
                    port = endpoint.port,
                    tunneled = self.tunnel.is_some(),
                    "Connected to MySQL"
                );
                self.conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(connection = %self.profile.name, error = %e, "MySQL connect failed");
                close_tunnel(&mut self.tunnel).await;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.disconnect().await {
                tracing::warn!(connection = %self.profile.name, error = %e, "MySQL disconnect failed");
            }
            tracing::info!(connection = %self.profile.name, "Disconnected from MySQL");
        }
        close_tunnel(&mut self.tunnel).await;
    }

    async fn execute_query(&mut self, sql: &str, fetch_results: bool) -> QueryResult {
        let limit = self.profile.options.statement_timeout();
        let Some(conn) = self.conn.as_mut() else {
            return QueryResult::not_connected();
        };
        if sql.trim().is_empty() {
            return QueryResult::notice(EMPTY_STATEMENT_NOTICE, Duration::ZERO);
        }

        let started = Instant::now();
        let result = bounded(limit, "Statement", run_statement(conn, sql, fetch_results)).await;
        let elapsed = started.elapsed();

        match result {
            Ok(result) => {
                tracing::debug!(
                    connection = %self.profile.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "MySQL statement executed"
                );
                QueryResult { elapsed, ..result }
            }
            Err(e) => {
                if matches!(e, WorkbenchError::NetworkUnreachable { .. }) {
                    self.abandon().await;
                }
                tracing::warn!(connection = %self.profile.name, error = %e, "MySQL statement failed");
                QueryResult::failed(&e, elapsed)
            }
        }
    }

    async fn list_databases(&mut self) -> WorkbenchResult<Vec<CatalogObject>> {
        self.catalog("SHOW DATABASES".to_string(), |name: String| CatalogObject::schema(name)).await
    }

    /// MySQL has no schema level below databases.
    async fn list_schemas(&mut self, _database: &str) -> WorkbenchResult<Vec<CatalogObject>> {
        if self.conn.is_none() {
            return Err(WorkbenchError::NotConnected);
        }
        Ok(Vec::new())
    }

    async fn list_tables(&mut self, schema_ref: &str) -> WorkbenchResult<Vec<CatalogObject>> {
        let schema = schema_ref.to_string();
        let sql = format!("SHOW FULL TABLES FROM {}", quote_identifier(schema_ref));
        self.catalog(sql, move |(name, table_type): (String, String)| {
            if table_type.eq_ignore_ascii_case("VIEW") {
                CatalogObject::view(schema.clone(), name)
            } else {
                CatalogObject::table(schema.clone(), name)
            }
        })
        .await
    }

    async fn list_columns(
        &mut self,
        schema_ref: &str,
        table: &str,
    ) -> WorkbenchResult<Vec<CatalogObject>> {
        let schema = schema_ref.to_string();
        let table_name = table.to_string();
        let sql =
            format!("DESCRIBE {}.{}", quote_identifier(schema_ref), quote_identifier(table));
        self.catalog(
            sql,
            move |(field, data_type, null, key, default, extra): DescribeRow| {
                let column = CatalogObject::column(schema.clone(), table_name.clone(), field)
                    .with_extra("data_type", data_type)
                    .with_extra("nullable", null.eq_ignore_ascii_case("YES"))
                    .with_extra("key", key)
                    .with_extra("extra", extra);
                match default {
                    Some(default) => column.with_extra("default", default),
                    None => column.with_extra("default", serde_json::Value::Null),
                }
            },
        )
        .await
    }
}

/// `Field, Type, Null, Key, Default, Extra`
type DescribeRow = (String, String, String, String, Option<String>, String);

async fn run_statement(
    conn: &mut Conn,
    sql: &str,
    fetch_results: bool,
) -> Result<QueryResult, mysql_async::Error> {
    let mut result = conn.query_iter(sql).await?;

    let columns: Vec<(ColumnInfo, ColumnType)> = result
        .columns_ref()
        .iter()
        .map(|col| {
            let info = ColumnInfo::new(
                col.name_str(),
                type_name(col.column_type()),
                !col.flags().contains(ColumnFlags::NOT_NULL_FLAG),
            );
            (info, col.column_type())
        })
        .collect();

    if columns.is_empty() {
        let affected = result.affected_rows();
        result.drop_result().await?;
        conn.query_drop("COMMIT").await?;
        return Ok(QueryResult::affected(affected, Default::default()));
    }

    let raw_rows: Vec<mysql_async::Row> = result.collect().await?;
    result.drop_result().await?;

    if !fetch_results {
        return Ok(QueryResult::affected(raw_rows.len() as u64, Default::default()));
    }

    let names: Arc<[String]> = columns.iter().map(|(info, _)| info.name.clone()).collect();
    let rows = raw_rows
        .into_iter()
        .map(|mut row| {
            let values = columns
                .iter()
                .enumerate()
                .map(|(idx, (_, col_type))| {
                    let raw = row.take::<mysql_async::Value, usize>(idx);
                    mysql_value_to_value(raw.unwrap_or(mysql_async::Value::NULL), *col_type)
                })
                .collect();
            Row::new(names.clone(), values)
        })
        .collect();

    let columns = columns.into_iter().map(|(info, _)| info).collect();
    Ok(QueryResult::rows(columns, rows, Default::default()))
}

fn type_name(column_type: ColumnType) -> String {
    let debug = format!("{column_type:?}");
    debug.trim_start_matches("MYSQL_TYPE_").to_string()
}

fn mysql_value_to_value(val: mysql_async::Value, col_type: ColumnType) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => match col_type {
                ColumnType::MYSQL_TYPE_TINY
                | ColumnType::MYSQL_TYPE_SHORT
                | ColumnType::MYSQL_TYPE_LONG
                | ColumnType::MYSQL_TYPE_LONGLONG
                | ColumnType::MYSQL_TYPE_INT24
                | ColumnType::MYSQL_TYPE_YEAR => s
                    .parse::<i64>()
                    .map(Value::Int)
                    .or_else(|_| s.parse::<u64>().map(Value::UInt))
                    .unwrap_or(Value::Text(s)),
                ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
                    s.parse::<f64>().map(Value::Float).unwrap_or(Value::Text(s))
                }
                _ => Value::Text(s),
            },
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(i) => Value::Int(i),
        mysql_async::Value::UInt(u) => Value::UInt(u),
        mysql_async::Value::Float(f) => Value::Float(f64::from(f)),
        mysql_async::Value::Double(d) => Value::Float(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                Value::Text(format!("{year:04}-{month:02}-{day:02}"))
            } else if micro == 0 {
                Value::Text(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02}"
                ))
            } else {
                Value::Text(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02}.{micro:06}"
                ))
            }
        }
        mysql_async::Value::Time(negative, days, hours, mins, secs, micros) => {
            let total_hours = days * 24 + u32::from(hours);
            let sign = if negative { "-" } else { "" };
            if micros == 0 {
                Value::Text(format!("{sign}{total_hours:02}:{mins:02}:{secs:02}"))
            } else {
                Value::Text(format!("{sign}{total_hours:02}:{mins:02}:{secs:02}.{micros:06}"))
            }
        }
    }
}
