//! Query execution models.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorKind, WorkbenchError};

/// Column metadata from query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Engine type name (e.g. `int4`, `VAR_STRING`)
    pub type_name: String,
    /// Whether the column may hold NULL
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self { name: name.into(), type_name: type_name.into(), nullable }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Bytes(v) => {
                write!(f, "0x")?;
                v.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
        }
    }
}

/// One result row, values in column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    #[serde(skip)]
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a column position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column with this name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.iter().position(|c| c == name).and_then(|i| self.values.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }
}

/// What a statement produced. Exactly one variant per result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryOutcome {
    /// Column metadata plus row data.
    Rows { columns: Vec<ColumnInfo>, rows: Vec<Row> },
    /// Row count for statements that do not return rows.
    Affected { count: u64, message: String },
    /// The statement failed.
    Error { message: String, code: Option<String>, kind: ErrorKind },
    /// Message-only result.
    Notice { message: String },
}

/// Outcome of running one statement, with its elapsed execution time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    #[serde(flatten)]
    pub outcome: QueryOutcome,
    #[serde(rename = "execution_time_ms", serialize_with = "serialize_elapsed")]
    pub elapsed: Duration,
}

fn serialize_elapsed<S: serde::Serializer>(elapsed: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(elapsed.as_secs_f64() * 1000.0)
}

impl QueryResult {
    pub fn rows(columns: Vec<ColumnInfo>, rows: Vec<Row>, elapsed: Duration) -> Self {
        Self { outcome: QueryOutcome::Rows { columns, rows }, elapsed }
    }

    pub fn affected(count: u64, elapsed: Duration) -> Self {
        let message = format!("{count} row(s) affected");
        Self { outcome: QueryOutcome::Affected { count, message }, elapsed }
    }

    pub fn notice(message: impl Into<String>, elapsed: Duration) -> Self {
        Self { outcome: QueryOutcome::Notice { message: message.into() }, elapsed }
    }

    /// Error variant built from a classified failure.
    pub fn failed(error: &WorkbenchError, elapsed: Duration) -> Self {
        Self {
            outcome: QueryOutcome::Error {
                message: error.to_string(),
                code: error.engine_code().map(String::from),
                kind: error.kind(),
            },
            elapsed,
        }
    }

    /// Result for a call made without a live engine handle.
    pub fn not_connected() -> Self {
        Self::failed(&WorkbenchError::NotConnected, Duration::ZERO)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, QueryOutcome::Error { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            QueryOutcome::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            QueryOutcome::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Rows of a row-returning result, empty otherwise.
    pub fn result_rows(&self) -> &[Row] {
        match &self.outcome {
            QueryOutcome::Rows { rows, .. } => rows,
            _ => &[],
        }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        match &self.outcome {
            QueryOutcome::Rows { columns, .. } => columns,
            _ => &[],
        }
    }

    pub fn affected_rows(&self) -> Option<u64> {
        match &self.outcome {
            QueryOutcome::Affected { count, .. } => Some(*count),
            _ => None,
        }
    }

    pub fn execution_time_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}
