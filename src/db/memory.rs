//! In-memory [`RecordStore`] for `--no-db` runs and tests.
//!
//! Tables must be declared up front. Writes to undeclared columns fail the
//! same way a real catalog would, unique columns are enforced, and every
//! successful write is appended to a journal so callers can observe the
//! exact sequence of row states.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::db::{Assignment, ColumnInfo, ColumnValue, RecordStore, Row, UpdateGuard, value_as_text};
use crate::error::StoreError;

/// Kind of write recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Insert,
    Update,
}

/// One successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub op: JournalOp,
    pub table: String,
    pub id: i64,
    /// Columns written, in statement order.
    pub values: Vec<(String, ColumnValue)>,
}

impl JournalEntry {
    /// Value written to `column` by this entry, if any.
    pub fn value(&self, column: &str) -> Option<&ColumnValue> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

struct Table {
    columns: Vec<ColumnInfo>,
    unique: Vec<String>,
    rows: Vec<Row>,
    next_id: i64,
}

impl Table {
    fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Table>,
    journal: Vec<JournalEntry>,
}

/// Record store backed by process memory.
#[derive(Default)]
pub struct InMemoryRecordStore {
    inner: RwLock<Inner>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with the layout a stock deployment ships:
    /// `containers`, `container_statuses`, `tasks` and `audit_logs`.
    pub fn with_default_schema() -> Self {
        Self::new()
            .with_table(
                "containers",
                vec![
                    ColumnInfo::new("id", "int8"),
                    ColumnInfo::new("lxc_name", "varchar"),
                    ColumnInfo::new("image", "varchar"),
                    ColumnInfo::new("task_id", "int4"),
                    ColumnInfo::new("user_id", "int4"),
                    ColumnInfo::new("status_id", "int4"),
                    ColumnInfo::new("ip_address", "varchar"),
                    ColumnInfo::new("metadata", "jsonb"),
                    ColumnInfo::new("created_at", "timestamptz"),
                    ColumnInfo::new("updated_at", "timestamptz"),
                ],
                &["lxc_name"],
            )
            .with_lookup(
                "container_statuses",
                &[
                    (1, "creating"),
                    (2, "running"),
                    (3, "stopped"),
                    (4, "failed"),
                    (5, "deleting"),
                ],
            )
            .with_table(
                "tasks",
                vec![
                    ColumnInfo::new("id", "int8"),
                    ColumnInfo::new("title", "varchar"),
                ],
                &[],
            )
            .with_table(
                "audit_logs",
                vec![
                    ColumnInfo::new("id", "int8"),
                    ColumnInfo::new("user_id", "int4"),
                    ColumnInfo::new("action", "varchar"),
                    ColumnInfo::new("target_type", "varchar"),
                    ColumnInfo::new("target_id", "varchar"),
                    ColumnInfo::new("details", "jsonb"),
                    ColumnInfo::new("created_at", "timestamptz"),
                ],
                &[],
            )
    }

    /// Declare a table. An `id` column is always present.
    pub fn with_table(mut self, name: &str, columns: Vec<ColumnInfo>, unique: &[&str]) -> Self {
        let mut columns = columns;
        if !columns.iter().any(|c| c.name == "id") {
            columns.insert(0, ColumnInfo::new("id", "int8"));
        }
        self.inner.get_mut().tables.insert(
            name.to_string(),
            Table {
                columns,
                unique: unique.iter().map(|s| s.to_string()).collect(),
                rows: Vec::new(),
                next_id: 1,
            },
        );
        self
    }

    /// Declare an `(id, name)` lookup table with fixed contents.
    pub fn with_lookup(mut self, name: &str, entries: &[(i64, &str)]) -> Self {
        let rows = entries
            .iter()
            .map(|(id, label)| {
                let mut row = Row::new();
                row.insert("id".into(), Value::from(*id));
                row.insert("name".into(), Value::from(*label));
                row
            })
            .collect::<Vec<_>>();
        let next_id = entries.iter().map(|(id, _)| *id).max().unwrap_or(0) + 1;
        self.inner.get_mut().tables.insert(
            name.to_string(),
            Table {
                columns: vec![ColumnInfo::new("id", "int4"), ColumnInfo::new("name", "varchar")],
                unique: vec!["name".into()],
                rows,
                next_id,
            },
        );
        self
    }

    /// Seed a row without journaling it. Unknown tables are ignored.
    pub fn with_row(mut self, table: &str, values: &[(&str, Value)]) -> Self {
        if let Some(t) = self.inner.get_mut().tables.get_mut(table) {
            let mut row = Row::new();
            for column in &t.columns {
                row.insert(column.name.clone(), Value::Null);
            }
            for (name, value) in values {
                row.insert((*name).to_string(), value.clone());
            }
            match row.get("id").and_then(Value::as_i64) {
                Some(id) => t.next_id = t.next_id.max(id + 1),
                None => {
                    row.insert("id".into(), Value::from(t.next_id));
                    t.next_id += 1;
                }
            }
            t.rows.push(row);
        }
        self
    }

    /// Every write so far, oldest first.
    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.inner.read().await.journal.clone()
    }

    /// Current rows of `table`.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .read()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

/// Convert a written value to the JSON the row holds, respecting the
/// column type the way the database cast would.
fn to_cell(table: &str, column: &ColumnInfo, value: &ColumnValue) -> Result<Value, StoreError> {
    let text = match value {
        ColumnValue::Null => return Ok(Value::Null),
        ColumnValue::Now => return Ok(Value::String(Utc::now().to_rfc3339())),
        ColumnValue::Text(s) => s.clone(),
        ColumnValue::Int(i) => i.to_string(),
    };
    match column.sql_type.as_str() {
        "int2" | "int4" | "int8" => text.trim().parse::<i64>().map(Value::from).map_err(|_| {
            StoreError::Query(format!(
                "invalid input syntax for type {} in {table}.{}: {text:?}",
                column.sql_type, column.name
            ))
        }),
        "json" | "jsonb" => serde_json::from_str(&text).map_err(|e| {
            StoreError::Query(format!(
                "invalid input syntax for type {} in {table}.{}: {e}",
                column.sql_type, column.name
            ))
        }),
        _ => Ok(Value::String(text)),
    }
}

fn cells_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    a.and_then(value_as_text) == b.and_then(value_as_text)
}

fn check_unique(table_name: &str, table: &Table, row: &Row, skip_id: Option<i64>) -> Result<(), StoreError> {
    for column in &table.unique {
        let Some(candidate) = row.get(column).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = table.rows.iter().any(|existing| {
            existing.get("id").and_then(Value::as_i64) != skip_id
                && cells_equal(existing.get(column), Some(candidate))
        });
        if clash {
            return Err(StoreError::UniqueViolation {
                table: table_name.to_string(),
                detail: format!("duplicate value for {column}"),
            });
        }
    }
    Ok(())
}

fn resolve<'a>(table_name: &str, table: &'a Table, column: &str) -> Result<&'a ColumnInfo, StoreError> {
    table.column(column).ok_or_else(|| StoreError::UnknownColumn {
        table: table_name.to_string(),
        column: column.to_string(),
    })
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn live_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn lookup_id(&self, table: &str, name: &str) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.read().await;
        let t = inner
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(t.rows
            .iter()
            .find(|row| row.get("name").and_then(Value::as_str) == Some(name))
            .and_then(|row| row.get("id").and_then(Value::as_i64)))
    }

    async fn lookup_name(&self, table: &str, id: i64) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        let t = inner
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(t.rows
            .iter()
            .find(|row| row.get("id").and_then(Value::as_i64) == Some(id))
            .and_then(|row| row.get("name").and_then(Value::as_str))
            .map(str::to_string))
    }

    async fn insert(&self, table: &str, assignments: &[Assignment]) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        let t = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let mut row = Row::new();
        for column in &t.columns {
            row.insert(column.name.clone(), Value::Null);
        }
        for a in assignments {
            let column = resolve(table, t, &a.column.name)?;
            row.insert(column.name.clone(), to_cell(table, column, &a.value)?);
        }
        let id = match row.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => t.next_id,
        };
        row.insert("id".into(), Value::from(id));
        check_unique(table, t, &row, None)?;

        t.next_id = t.next_id.max(id + 1);
        t.rows.push(row);
        inner.journal.push(JournalEntry {
            op: JournalOp::Insert,
            table: table.to_string(),
            id,
            values: assignments
                .iter()
                .map(|a| (a.column.name.clone(), a.value.clone()))
                .collect(),
        });
        Ok(id)
    }

    async fn update(
        &self,
        table: &str,
        id: i64,
        assignments: &[Assignment],
        guard: Option<&UpdateGuard>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let t = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let Some(index) = t
            .rows
            .iter()
            .position(|row| row.get("id").and_then(Value::as_i64) == Some(id))
        else {
            return Ok(0);
        };

        if let Some(guard) = guard {
            resolve(table, t, &guard.column)?;
            let current = t.rows[index].get(&guard.column).and_then(value_as_text);
            if current != guard.expected.as_text() {
                return Ok(0);
            }
        }

        let mut updated = t.rows[index].clone();
        for a in assignments {
            let column = resolve(table, t, &a.column.name)?;
            updated.insert(column.name.clone(), to_cell(table, column, &a.value)?);
        }
        check_unique(table, t, &updated, Some(id))?;
        t.rows[index] = updated;

        inner.journal.push(JournalEntry {
            op: JournalOp::Update,
            table: table.to_string(),
            id,
            values: assignments
                .iter()
                .map(|a| (a.column.name.clone(), a.value.clone()))
                .collect(),
        });
        Ok(1)
    }

    async fn select(
        &self,
        table: &str,
        filter: &[(String, ColumnValue)],
    ) -> Result<Vec<Row>, StoreError> {
        let inner = self.inner.read().await;
        let t = inner
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        for (column, _) in filter {
            resolve(table, t, column)?;
        }
        Ok(t.rows
            .iter()
            .filter(|row| {
                filter.iter().all(|(column, value)| {
                    row.get(column).and_then(value_as_text) == value.as_text()
                })
            })
            .cloned()
            .collect())
    }
}
