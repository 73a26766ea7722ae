//! PostgreSQL adapter built on `tokio-postgres`.
//!
//! A session is bound to one database. Catalog calls that target another
//! database open a short-lived scoped session (through the same tunnel port
//! when one is active), run a single query and close it again. The primary
//! session is never replaced.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage, Statement};

use crate::error::{WorkbenchError, WorkbenchResult};
use crate::models::{
    CatalogObject, ColumnInfo, ConnectionProfile, EngineKind, QueryResult, Row, SchemaRef, Value,
};
use crate::services::adapter::{
    bounded, close_tunnel, open_endpoint, DatabaseAdapter, Endpoint, EMPTY_STATEMENT_NOTICE,
};
use crate::services::tunnel::{Tunnel, TunnelState};

/// Database used when the profile names none.
pub const DEFAULT_DATABASE: &str = "postgres";

/// Schemas never shown in the schema browser.
pub const INTERNAL_SCHEMAS: [&str; 5] =
    ["information_schema", "pg_catalog", "pg_toast", "pg_temp_1", "pg_toast_temp_1"];

pub fn is_internal_schema(name: &str) -> bool {
    INTERNAL_SCHEMAS.contains(&name)
}

const LIST_DATABASES_SQL: &str = r#"
    SELECT datname::text
    FROM pg_catalog.pg_database
    WHERE datistemplate = false
    ORDER BY datname
"#;

const LIST_SCHEMAS_SQL: &str = r#"
    SELECT schema_name::text
    FROM information_schema.schemata
    WHERE schema_name::text <> ALL($1::text[])
    ORDER BY schema_name
"#;

const LIST_TABLES_SQL: &str = r#"
    SELECT table_name::text, table_type::text
    FROM information_schema.tables
    WHERE table_schema::text = $1
      AND table_type IN ('BASE TABLE', 'VIEW')
    ORDER BY table_name
"#;

const LIST_COLUMNS_SQL: &str = r#"
    SELECT column_name::text, data_type::text, is_nullable::text, column_default::text
    FROM information_schema.columns
    WHERE table_schema::text = $1
      AND table_name::text = $2
    ORDER BY ordinal_position
"#;

/// An open session: the client plus the task driving its socket.
struct Session {
    client: Client,
    driver: JoinHandle<()>,
}

impl Session {
    /// Close the session, giving the driver a moment to flush the terminate message.
    async fn close(self) {
        drop(self.client);
        if tokio::time::timeout(Duration::from_secs(1), self.driver).await.is_err() {
            tracing::debug!("PostgreSQL driver task did not finish after close");
        }
    }
}

pub struct PostgresAdapter {
    profile: ConnectionProfile,
    session: Option<Session>,
    endpoint: Option<Endpoint>,
    tunnel: Option<Tunnel>,
}

impl PostgresAdapter {
    pub fn new(profile: ConnectionProfile) -> Self {
        Self { profile, session: None, endpoint: None, tunnel: None }
    }

    /// Database the primary session is bound to.
    pub fn current_database(&self) -> &str {
        self.profile.default_schema().unwrap_or(DEFAULT_DATABASE)
    }

    fn pg_config(&self, endpoint: &Endpoint, database: &str) -> tokio_postgres::Config {
        let options = &self.profile.options;
        let statement_timeout_ms = u64::from(options.read_timeout_secs) * 1000;

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&endpoint.host);
        pg_config.port(endpoint.port);
        pg_config.dbname(database);
        pg_config.user(&self.profile.username);
        pg_config.password(&self.profile.password);
        pg_config.application_name(&options.application_name);
        pg_config.connect_timeout(options.connect_timeout());
        pg_config.options(&format!("-c statement_timeout={statement_timeout_ms}"));
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));
        pg_config
    }

    async fn open_session(&self, endpoint: &Endpoint, database: &str) -> WorkbenchResult<Session> {
        let pg_config = self.pg_config(endpoint, database);
        let (client, connection) = bounded(
            self.profile.options.connect_timeout(),
            "PostgreSQL connect",
            pg_config.connect(NoTls),
        )
        .await?;

        let name = self.profile.name.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(connection = %name, error = %e, "PostgreSQL session ended with error");
            }
        });

        Ok(Session { client, driver })
    }

    /// Run a catalog query on the primary session, or on a scoped session when
    /// `database` names another database.
    async fn catalog_query(
        &self,
        database: Option<&str>,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> WorkbenchResult<Vec<tokio_postgres::Row>> {
        let primary = self.session.as_ref().ok_or(WorkbenchError::NotConnected)?;
        let limit = self.profile.options.statement_timeout();
        let started = Instant::now();

        let rows = match database {
            None => bounded(limit, "Catalog query", primary.client.query(sql, params)).await,
            Some(database) => {
                let endpoint = self.endpoint.as_ref().ok_or(WorkbenchError::NotConnected)?;
                tracing::debug!(
                    connection = %self.profile.name,
                    database,
                    "Opening scoped PostgreSQL session"
                );
                let scoped = self.open_session(endpoint, database).await?;
                let rows = bounded(limit, "Catalog query", scoped.client.query(sql, params)).await;
                scoped.close().await;
                rows
            }
        };

        match &rows {
            Ok(rows) => tracing::debug!(
                connection = %self.profile.name,
                database = database.unwrap_or(self.current_database()),
                rows = rows.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "PostgreSQL catalog query"
            ),
            Err(e) => tracing::warn!(
                connection = %self.profile.name,
                error = %e,
                "PostgreSQL catalog query failed"
            ),
        }
        rows
    }

    /// The database to scope to, or `None` when the primary session already serves it.
    fn scope_for<'a>(&self, database: &'a str) -> Option<&'a str> {
        (database != self.current_database()).then_some(database)
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::PostgreSql
    }

    fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.client.is_closed())
    }

    fn tunnel_state(&self) -> Option<TunnelState> {
        self.tunnel.as_ref().map(Tunnel::state)
    }

    async fn connect(&mut self) -> WorkbenchResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = self.session.take() {
            stale.close().await;
        }
        close_tunnel(&mut self.tunnel).await;
        self.profile.validate()?;

        let (endpoint, tunnel) = open_endpoint(&self.profile).await?;
        self.tunnel = tunnel;

        let database = self.current_database().to_string();
        match self.open_session(&endpoint, &database).await {
            Ok(session) => {
                tracing::info!(
                    connection = %self.profile.name,
                    host = %endpoint.host,
                    port = endpoint.port,
                    database = %database,
                    tunneled = self.tunnel.is_some(),
                    "Connected to PostgreSQL"
                );
                self.session = Some(session);
                self.endpoint = Some(endpoint);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(connection = %self.profile.name, error = %e, "PostgreSQL connect failed");
                close_tunnel(&mut self.tunnel).await;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.endpoint = None;
        if let Some(session) = self.session.take() {
            session.close().await;
            tracing::info!(connection = %self.profile.name, "Disconnected from PostgreSQL");
        }
        close_tunnel(&mut self.tunnel).await;
    }

    async fn execute_query(&mut self, sql: &str, fetch_results: bool) -> QueryResult {
        let Some(session) = self.session.as_ref() else {
            return QueryResult::not_connected();
        };
        if sql.trim().is_empty() {
            return QueryResult::notice(EMPTY_STATEMENT_NOTICE, Duration::ZERO);
        }

        // statement_timeout bounds execution server-side; this bounds the round trip.
        let limit = self.profile.options.statement_timeout() + Duration::from_secs(5);
        let started = Instant::now();
        let result =
            bounded(limit, "Statement", run_statement(&session.client, sql, fetch_results)).await;
        let elapsed = started.elapsed();

        match result {
            Ok(result) => {
                tracing::debug!(
                    connection = %self.profile.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "PostgreSQL statement executed"
                );
                QueryResult { elapsed, ..result }
            }
            Err(e) => {
                tracing::warn!(connection = %self.profile.name, error = %e, "PostgreSQL statement failed");
                QueryResult::failed(&e, elapsed)
            }
        }
    }

    async fn list_databases(&mut self) -> WorkbenchResult<Vec<CatalogObject>> {
        let rows = self.catalog_query(None, LIST_DATABASES_SQL, &[]).await?;
        Ok(rows.iter().map(|row| CatalogObject::database(row.get::<_, String>(0))).collect())
    }

    async fn list_schemas(&mut self, database: &str) -> WorkbenchResult<Vec<CatalogObject>> {
        let excluded: Vec<&str> = INTERNAL_SCHEMAS.to_vec();
        let rows = self
            .catalog_query(self.scope_for(database), LIST_SCHEMAS_SQL, &[&excluded])
            .await?;

        Ok(rows
            .iter()
            .map(|row| row.get::<_, String>(0))
            .filter(|name| !is_internal_schema(name))
            .map(|name| CatalogObject::schema(name).with_parent(database))
            .collect())
    }

    async fn list_tables(&mut self, schema_ref: &str) -> WorkbenchResult<Vec<CatalogObject>> {
        let reference = SchemaRef::parse(schema_ref);
        let rows = self
            .catalog_query(reference.database, LIST_TABLES_SQL, &[&reference.schema])
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let table_type: String = row.get(1);
                let object = if table_type == "VIEW" {
                    CatalogObject::view(reference.schema, name)
                } else {
                    CatalogObject::table(reference.schema, name)
                };
                match reference.database {
                    Some(database) => object.with_parent(database),
                    None => object,
                }
            })
            .collect())
    }

    async fn list_columns(
        &mut self,
        schema_ref: &str,
        table: &str,
    ) -> WorkbenchResult<Vec<CatalogObject>> {
        let reference = SchemaRef::parse(schema_ref);
        let rows = self
            .catalog_query(reference.database, LIST_COLUMNS_SQL, &[&reference.schema, &table])
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                let is_nullable: String = row.get(2);
                let default: Option<String> = row.get(3);
                CatalogObject::column(reference.schema, table, name)
                    .with_extra("data_type", data_type)
                    .with_extra("nullable", is_nullable == "YES")
                    .with_extra("default", default.map_or(serde_json::Value::Null, Into::into))
            })
            .collect())
    }
}

async fn run_statement(
    client: &Client,
    sql: &str,
    fetch_results: bool,
) -> Result<QueryResult, tokio_postgres::Error> {
    let statement: Statement = match client.prepare(sql).await {
        Ok(statement) => statement,
        // Scripts with several commands cannot be prepared; a genuine syntax
        // error is reported again by the simple protocol without side effects.
        Err(e) if e.code() == Some(&SqlState::SYNTAX_ERROR) => {
            return run_script(client, sql, fetch_results, &[]).await;
        }
        Err(e) => return Err(e),
    };

    if statement.columns().is_empty() || !fetch_results {
        let affected = client.execute(&statement, &[]).await?;
        return Ok(QueryResult::affected(affected, Duration::ZERO));
    }

    let types: Vec<Type> = statement.columns().iter().map(|col| col.type_().clone()).collect();
    if !types.iter().all(decodes_natively) {
        // Interval, inet, arrays and the like: let the server render them.
        return run_script(client, sql, fetch_results, &types).await;
    }

    let columns: Vec<ColumnInfo> = statement
        .columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_().name(), true))
        .collect();
    let names: Arc<[String]> = columns.iter().map(|c| c.name.clone()).collect();

    let rows = client
        .query(&statement, &[])
        .await?
        .iter()
        .map(|row| {
            let values = (0..row.len()).map(|idx| cell_value(row, idx)).collect();
            Row::new(names.clone(), values)
        })
        .collect();

    Ok(QueryResult::rows(columns, rows, Duration::ZERO))
}

/// Run SQL through the simple query protocol, reporting the last command.
///
/// `types` carries column types when the statement was prepared first; cells
/// of unknown type stay text.
async fn run_script(
    client: &Client,
    sql: &str,
    fetch_results: bool,
    types: &[Type],
) -> Result<QueryResult, tokio_postgres::Error> {
    let messages = client.simple_query(sql).await?;
    let events = messages.into_iter().filter_map(|message| match message {
        SimpleQueryMessage::RowDescription(columns) => Some(ScriptEvent::Columns(
            columns.iter().map(|col| col.name().to_string()).collect(),
        )),
        SimpleQueryMessage::Row(row) => Some(ScriptEvent::Row(
            (0..row.len()).map(|idx| row.get(idx).map(str::to_string)).collect(),
        )),
        SimpleQueryMessage::CommandComplete(count) => Some(ScriptEvent::Complete(count)),
        _ => None,
    });

    Ok(fold_script(events, fetch_results, types))
}

/// One step of a simple-protocol response.
#[derive(Debug, Clone, PartialEq)]
enum ScriptEvent {
    Columns(Vec<String>),
    Row(Vec<Option<String>>),
    Complete(u64),
}

fn fold_script(
    events: impl IntoIterator<Item = ScriptEvent>,
    fetch_results: bool,
    types: &[Type],
) -> QueryResult {
    let mut last = None;
    let mut columns: Option<Vec<ColumnInfo>> = None;
    let mut names: Arc<[String]> = Arc::from(Vec::new());
    let mut rows = Vec::new();

    for event in events {
        match event {
            ScriptEvent::Columns(column_names) => {
                columns = Some(
                    column_names
                        .iter()
                        .enumerate()
                        .map(|(idx, name)| {
                            let type_name = types.get(idx).map_or("text", Type::name);
                            ColumnInfo::new(name.as_str(), type_name, true)
                        })
                        .collect(),
                );
                names = column_names.into();
            }
            ScriptEvent::Row(cells) => {
                let values = cells
                    .iter()
                    .enumerate()
                    .map(|(idx, cell)| text_cell(types.get(idx), cell.as_deref()))
                    .collect();
                rows.push(Row::new(names.clone(), values));
            }
            ScriptEvent::Complete(count) => {
                let statement_rows = std::mem::take(&mut rows);
                last = Some(match columns.take() {
                    Some(columns) if fetch_results => {
                        QueryResult::rows(columns, statement_rows, Duration::ZERO)
                    }
                    _ => QueryResult::affected(count, Duration::ZERO),
                });
            }
        }
    }

    last.unwrap_or_else(|| QueryResult::notice(EMPTY_STATEMENT_NOTICE, Duration::ZERO))
}

/// Types [`cell_value`] decodes from the binary protocol.
fn decodes_natively(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::OID
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::NUMERIC
            | Type::BYTEA
            | Type::JSON
            | Type::JSONB
            | Type::UUID
            | Type::TIMESTAMPTZ
            | Type::TIMESTAMP
            | Type::DATE
            | Type::TIME
    ) || <String as FromSql>::accepts(ty)
}

/// Decode one cell by its PostgreSQL type.
fn cell_value(row: &tokio_postgres::Row, idx: usize) -> Value {
    let ty = row.columns()[idx].type_();

    let decoded: Result<Option<Value>, tokio_postgres::Error> = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(Value::Bool)),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).map(|v| v.map(|n| Value::Int(n.into()))),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).map(|v| v.map(|n| Value::Int(n.into()))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(Value::Int)),
        Type::OID => row.try_get::<_, Option<u32>>(idx).map(|v| v.map(|n| Value::UInt(n.into()))),
        Type::FLOAT4 => {
            row.try_get::<_, Option<f32>>(idx).map(|v| v.map(|n| Value::Float(n.into())))
        }
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(Value::Float)),
        Type::NUMERIC => {
            row.try_get::<_, Option<PgNumeric>>(idx).map(|v| v.map(|n| Value::Text(n.0)))
        }
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx).map(|v| v.map(Value::Bytes)),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map(|v| v.map(|j| Value::Text(j.to_string()))),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map(|v| v.map(|u| Value::Text(u.to_string()))),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| v.map(|t| Value::Text(t.to_rfc3339()))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| v.map(|t| Value::Text(t.to_string()))),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map(|v| v.map(|d| Value::Text(d.to_string()))),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .map(|v| v.map(|t| Value::Text(t.to_string()))),
        _ => row.try_get::<_, Option<String>>(idx).map(|v| v.map(Value::Text)),
    };

    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(e) => {
            tracing::warn!(column = idx, pg_type = %ty.name(), error = %e, "Undecodable cell");
            Value::Null
        }
    }
}

/// Convert a text-protocol cell, using the column type when it is known.
fn text_cell(ty: Option<&Type>, raw: Option<&str>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    let text = || Value::Text(raw.to_string());

    match ty {
        Some(&Type::BOOL) => Value::Bool(raw == "t"),
        Some(&Type::INT2) | Some(&Type::INT4) | Some(&Type::INT8) => {
            raw.parse().map(Value::Int).unwrap_or_else(|_| text())
        }
        Some(&Type::OID) => raw.parse().map(Value::UInt).unwrap_or_else(|_| text()),
        Some(&Type::FLOAT4) | Some(&Type::FLOAT8) => {
            raw.parse().map(Value::Float).unwrap_or_else(|_| text())
        }
        Some(&Type::BYTEA) => decode_bytea_hex(raw).map(Value::Bytes).unwrap_or_else(text),
        _ => text(),
    }
}

/// Decode bytea in the server's `\x` hex output format.
fn decode_bytea_hex(raw: &str) -> Option<Vec<u8>> {
    let hex = raw.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// NUMERIC decoded from its binary form into exact decimal text, keeping the
/// column's display scale.
#[derive(Debug, Clone, PartialEq)]
struct PgNumeric(String);

impl PgNumeric {
    fn decode(raw: &[u8]) -> Result<String, Box<dyn std::error::Error + Sync + Send>> {
        let word = |offset: usize| u16::from_be_bytes([raw[offset], raw[offset + 1]]);

        if raw.len() < 8 {
            return Err("NUMERIC payload too short".into());
        }
        let ndigits = usize::from(word(0));
        let weight = i32::from(word(2) as i16);
        let sign = word(4);
        let dscale = usize::from(word(6));
        if raw.len() < 8 + ndigits * 2 {
            return Err("NUMERIC payload truncated".into());
        }

        match sign {
            NUMERIC_NAN => return Ok("NaN".to_string()),
            NUMERIC_PINF => return Ok("Infinity".to_string()),
            NUMERIC_NINF => return Ok("-Infinity".to_string()),
            _ => {}
        }

        let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + i * 2)).collect();
        if digits.iter().any(|&d| d > 9999) {
            return Err("NUMERIC digit out of range".into());
        }
        // Base-10000 digit `idx` carries the power 10000^(weight - idx).
        let digit = |idx: i32| {
            usize::try_from(idx).ok().and_then(|i| digits.get(i).copied()).unwrap_or(0)
        };

        let mut text = String::new();
        if sign == NUMERIC_NEG {
            text.push('-');
        }
        if weight < 0 {
            text.push('0');
        } else {
            text.push_str(&digit(0).to_string());
            for idx in 1..=weight {
                text.push_str(&format!("{:04}", digit(idx)));
            }
        }

        if dscale > 0 {
            let mut fraction = String::with_capacity(dscale + 4);
            let mut idx = weight + 1;
            while fraction.len() < dscale {
                fraction.push_str(&format!("{:04}", digit(idx)));
                idx += 1;
            }
            fraction.truncate(dscale);
            text.push('.');
            text.push_str(&fraction);
        }

        Ok(text)
    }
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(Self::decode(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
