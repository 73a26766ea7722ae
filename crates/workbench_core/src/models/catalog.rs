//! Catalog entries returned by schema browsing calls.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a catalog entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Schema,
    Database,
    Table,
    View,
    Procedure,
    Function,
    Column,
    Index,
}

/// One node in the schema browser tree.
///
/// `parent` holds the owning database for PostgreSQL schemas and the owning
/// table for columns. `schema` is set on tables, views and columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogObject {
    pub name: String,
    pub kind: CatalogKind,
    pub parent: Option<String>,
    pub schema: Option<String>,
    /// Engine-specific details such as `data_type`, `nullable` or `default`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CatalogObject {
    pub fn new(name: impl Into<String>, kind: CatalogKind) -> Self {
        Self { name: name.into(), kind, parent: None, schema: None, extra: BTreeMap::new() }
    }

    pub fn database(name: impl Into<String>) -> Self {
        Self::new(name, CatalogKind::Database)
    }

    pub fn schema(name: impl Into<String>) -> Self {
        Self::new(name, CatalogKind::Schema)
    }

    pub fn table(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(name, CatalogKind::Table).in_schema(schema)
    }

    pub fn view(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(name, CatalogKind::View).in_schema(schema)
    }

    pub fn column(
        schema: impl Into<String>,
        table: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(name, CatalogKind::Column).in_schema(schema).with_parent(table)
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Look up an engine-specific detail.
    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }
}

/// A schema reference, optionally qualified with its database (`db.schema`).
///
/// Only the first `.` separates the parts, so `analytics.public.v2` names the
/// schema `public.v2` in database `analytics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRef<'a> {
    pub database: Option<&'a str>,
    pub schema: &'a str,
}

impl<'a> SchemaRef<'a> {
    pub fn parse(reference: &'a str) -> Self {
        match reference.split_once('.') {
            Some((database, schema)) => Self { database: Some(database), schema },
            None => Self { database: None, schema: reference },
        }
    }
}
