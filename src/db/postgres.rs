//! PostgreSQL implementation of [`RecordStore`].
//!
//! Statements are rendered from the live column set. Every bound value is
//! passed as text and cast to the column's catalog type, so the same code
//! path works whether a deployment stores metadata as `jsonb` or `text`,
//! or a foreign key as `int4` or `int8`.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;

use crate::db::{Assignment, ColumnInfo, ColumnValue, RecordStore, Row, UpdateGuard};
use crate::error::StoreError;

/// PostgreSQL-backed record store.
pub struct PgRecordStore {
    pool: Pool,
}

impl PgRecordStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool for `url` and return a store over it.
    pub fn connect(url: &str, pool_size: usize) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| StoreError::Pool(e.to_string()))?;
        let manager = Manager::from_config(
            pg_config,
            tokio_postgres::NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self::new(pool))
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn live_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT column_name::text, udt_name::text
                FROM information_schema.columns
                WHERE table_schema = current_schema() AND table_name = $1::text
                ORDER BY ordinal_position
                "#,
                &[&table],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| ColumnInfo::new(r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect())
    }

    async fn lookup_id(&self, table: &str, name: &str) -> Result<Option<i64>, StoreError> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT \"id\"::bigint FROM {} WHERE \"name\"::text = $1::text LIMIT 1",
            quote_ident(table)
        );
        let row = client
            .query_opt(&sql, &[&name])
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.map(|r| r.get::<_, i64>(0)))
    }

    async fn lookup_name(&self, table: &str, id: i64) -> Result<Option<String>, StoreError> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT \"name\"::text FROM {} WHERE \"id\"::bigint = $1::bigint LIMIT 1",
            quote_ident(table)
        );
        let row = client
            .query_opt(&sql, &[&id])
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.map(|r| r.get::<_, String>(0)))
    }

    async fn insert(&self, table: &str, assignments: &[Assignment]) -> Result<i64, StoreError> {
        let (sql, params) = render_insert(table, assignments);
        let mut client = self.client().await?;

        // Rolled back on drop unless committed.
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let row = tx
            .query_one(&sql, &param_refs(&params))
            .await
            .map_err(|e| map_pg_error(table, e))?;
        let id: i64 = row.get(0);
        tx.commit()
            .await
            .map_err(|e| map_pg_error(table, e))?;

        tracing::debug!(table, id, "Inserted row");
        Ok(id)
    }

    async fn update(
        &self,
        table: &str,
        id: i64,
        assignments: &[Assignment],
        guard: Option<&UpdateGuard>,
    ) -> Result<u64, StoreError> {
        if assignments.is_empty() {
            return Ok(0);
        }
        let (sql, params) = render_update(table, id, assignments, guard);
        let mut client = self.client().await?;

        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let touched = tx
            .execute(&sql, &param_refs(&params))
            .await
            .map_err(|e| map_pg_error(table, e))?;
        tx.commit()
            .await
            .map_err(|e| map_pg_error(table, e))?;

        Ok(touched)
    }

    async fn select(
        &self,
        table: &str,
        filter: &[(String, ColumnValue)],
    ) -> Result<Vec<Row>, StoreError> {
        let (sql, params) = render_select(table, filter);
        let client = self.client().await?;
        let rows = client
            .query(&sql, &param_refs(&params))
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter()
            .map(|r| {
                let json: String = r.get(0);
                serde_json::from_str::<Row>(&json).map_err(|e| StoreError::Decode(e.to_string()))
            })
            .collect()
    }
}

fn param_refs(params: &[String]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn map_pg_error(table: &str, e: tokio_postgres::Error) -> StoreError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let detail = e
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| e.to_string());
        return StoreError::UniqueViolation {
            table: table.to_string(),
            detail,
        };
    }
    StoreError::Query(e.to_string())
}

/// Quote an identifier for interpolation into a statement.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// SQL expression for a value written into `column`, pushing a parameter
/// when one is needed.
fn value_expr(column: &ColumnInfo, value: &ColumnValue, params: &mut Vec<String>) -> String {
    match value {
        ColumnValue::Now => "NOW()".to_string(),
        ColumnValue::Null => "NULL".to_string(),
        ColumnValue::Text(_) | ColumnValue::Int(_) => {
            params.push(value.as_text().unwrap_or_default());
            format!(
                "CAST(${}::text AS {})",
                params.len(),
                quote_ident(&column.sql_type)
            )
        }
    }
}

/// SQL condition comparing `column` against `value` by text form.
fn condition_expr(column: &str, value: &ColumnValue, params: &mut Vec<String>) -> String {
    let column = quote_ident(column);
    match value {
        ColumnValue::Null => format!("{column} IS NULL"),
        ColumnValue::Now => format!("{column} = NOW()"),
        ColumnValue::Text(_) | ColumnValue::Int(_) => {
            params.push(value.as_text().unwrap_or_default());
            format!("{column}::text = ${}::text", params.len())
        }
    }
}

pub(crate) fn render_insert(table: &str, assignments: &[Assignment]) -> (String, Vec<String>) {
    let mut params = Vec::new();
    if assignments.is_empty() {
        return (
            format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING \"id\"::bigint",
                quote_ident(table)
            ),
            params,
        );
    }
    let columns: Vec<String> = assignments
        .iter()
        .map(|a| quote_ident(&a.column.name))
        .collect();
    let values: Vec<String> = assignments
        .iter()
        .map(|a| value_expr(&a.column, &a.value, &mut params))
        .collect();

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING \"id\"::bigint",
        quote_ident(table),
        columns.join(", "),
        values.join(", ")
    );
    (sql, params)
}

pub(crate) fn render_update(
    table: &str,
    id: i64,
    assignments: &[Assignment],
    guard: Option<&UpdateGuard>,
) -> (String, Vec<String>) {
    let mut params = Vec::new();
    let sets: Vec<String> = assignments
        .iter()
        .map(|a| {
            format!(
                "{} = {}",
                quote_ident(&a.column.name),
                value_expr(&a.column, &a.value, &mut params)
            )
        })
        .collect();

    let mut conditions = vec![condition_expr("id", &ColumnValue::Int(id), &mut params)];
    if let Some(guard) = guard {
        conditions.push(condition_expr(&guard.column, &guard.expected, &mut params));
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(table),
        sets.join(", "),
        conditions.join(" AND ")
    );
    (sql, params)
}

pub(crate) fn render_select(table: &str, filter: &[(String, ColumnValue)]) -> (String, Vec<String>) {
    let mut params = Vec::new();
    let mut sql = format!(
        "SELECT row_to_json(t)::text FROM {} AS t",
        quote_ident(table)
    );
    if !filter.is_empty() {
        let conditions: Vec<String> = filter
            .iter()
            .map(|(column, value)| condition_expr(column, value, &mut params))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY t.\"id\"");
    (sql, params)
}
