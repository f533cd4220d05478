//! Relational store collaborator.
//!
//! The provisioning path never assumes a fixed table layout. Everything it
//! needs from the database goes through [`RecordStore`]: catalog
//! introspection, status lookups, inserts, guarded updates and equality
//! selects. Two implementations exist:
//!
//! - [`PgRecordStore`]: PostgreSQL via `deadpool-postgres`.
//! - [`InMemoryRecordStore`]: declared tables held in memory, used by
//!   `--no-db` runs and tests.

mod memory;
mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StoreError;

pub use memory::{InMemoryRecordStore, JournalEntry, JournalOp};
pub use postgres::PgRecordStore;

/// A row read back from the store, keyed by column name.
pub type Row = Map<String, Value>;

/// A live column as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Database type name (e.g. `int4`, `varchar`, `jsonb`, `timestamptz`).
    pub sql_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// A value to be written into a column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Int(i64),
    Null,
    /// The store's own current-time expression, evaluated in the statement.
    Now,
}

impl ColumnValue {
    /// Text form used when binding parameters and comparing values.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Null | Self::Now => None,
        }
    }
}

/// One `column = value` pair of an insert or update.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: ColumnInfo,
    pub value: ColumnValue,
}

impl Assignment {
    pub fn new(column: ColumnInfo, value: ColumnValue) -> Self {
        Self { column, value }
    }
}

/// Compare-and-set condition for an update: the row is only touched when
/// `column` currently holds `expected`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateGuard {
    pub column: String,
    pub expected: ColumnValue,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Live columns of `table`, in catalog order. Empty if the table is absent.
    async fn live_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError>;

    /// Resolve a human-readable name in a lookup table to its id.
    async fn lookup_id(&self, table: &str, name: &str) -> Result<Option<i64>, StoreError>;

    /// Reverse of [`lookup_id`](Self::lookup_id).
    async fn lookup_name(&self, table: &str, id: i64) -> Result<Option<String>, StoreError>;

    /// Insert one row and return its `id`.
    async fn insert(&self, table: &str, assignments: &[Assignment]) -> Result<i64, StoreError>;

    /// Update the row with the given `id`. Returns the number of rows touched,
    /// which is 0 when the guard did not match.
    async fn update(
        &self,
        table: &str,
        id: i64,
        assignments: &[Assignment],
        guard: Option<&UpdateGuard>,
    ) -> Result<u64, StoreError>;

    /// Rows whose columns equal every `(column, value)` in `filter`.
    async fn select(
        &self,
        table: &str,
        filter: &[(String, ColumnValue)],
    ) -> Result<Vec<Row>, StoreError>;
}

/// Render a JSON cell as the text a filter compares against.
pub(crate) fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
