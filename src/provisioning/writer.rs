//! Schema-adaptive record writer.
//!
//! The lifecycle table's column set differs between deployments, so the
//! writer reads the live catalog on every call and maps each logical field
//! through an ordered list of candidate column names. The first candidate
//! present wins; a field with no candidate present is skipped. The writer
//! never emits a column the catalog did not report.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::db::{Assignment, ColumnInfo, ColumnValue, RecordStore, Row, UpdateGuard, value_as_text};
use crate::error::{ProvisionError, StoreError};
use crate::provisioning::record::{
    ContainerRecord, ContainerRef, ContainerStatus, LogicalRecord, Metadata, RecordPatch,
};

/// A logical field of the lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalField {
    Name,
    Image,
    Task,
    Owner,
    /// Foreign key into the status lookup table.
    StatusRef,
    /// Status stored as its text name.
    Status,
    Address,
    Metadata,
    CreatedAt,
    UpdatedAt,
    Cpu,
    Memory,
    Disk,
}

/// Candidate physical columns per logical field, highest priority first.
/// The order within each list is part of the writer's contract.
const CANDIDATES: &[(LogicalField, &[&str])] = &[
    (LogicalField::Name, &["lxc_name", "container_name", "name"]),
    (LogicalField::Image, &["image", "template", "image_name"]),
    (LogicalField::Task, &["task_id", "related_task_id", "lab_task_id"]),
    (LogicalField::Owner, &["user_id", "owner_id", "created_by"]),
    (LogicalField::StatusRef, &["status_id", "container_status_id"]),
    (LogicalField::Status, &["status", "state"]),
    (LogicalField::Address, &["ip_address", "ipv4", "ip", "address"]),
    (LogicalField::Metadata, &["metadata", "meta", "extra"]),
    (LogicalField::CreatedAt, &["created_at", "created_on", "inserted_at"]),
    (LogicalField::UpdatedAt, &["updated_at", "modified_at"]),
    (LogicalField::Cpu, &["cpu", "cpus", "cpu_limit"]),
    (LogicalField::Memory, &["memory_mb", "memory", "memory_limit"]),
    (LogicalField::Disk, &["disk_gb", "disk", "disk_limit"]),
];

/// Candidate column names for `field`.
pub fn candidates(field: LogicalField) -> &'static [&'static str] {
    CANDIDATES
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, names)| *names)
        .unwrap_or(&[])
}

/// Resolved logical-field to live-column mapping for one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMap {
    columns: HashMap<LogicalField, ColumnInfo>,
}

impl ColumnMap {
    pub fn get(&self, field: LogicalField) -> Option<&ColumnInfo> {
        self.columns.get(&field)
    }

    pub fn name(&self, field: LogicalField) -> Option<&str> {
        self.get(field).map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Map every logical field to the first of its candidates present in `live`.
pub fn map_columns(live: &[ColumnInfo]) -> ColumnMap {
    let mut columns = HashMap::new();
    for (field, names) in CANDIDATES {
        let found = names
            .iter()
            .find_map(|name| live.iter().find(|c| c.name == *name));
        if let Some(column) = found {
            columns.insert(*field, column.clone());
        }
    }
    ColumnMap { columns }
}

/// Canonical compact text encoding of a metadata map.
pub fn encode_metadata(metadata: &Metadata) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

/// Writes and reads lifecycle records through a [`RecordStore`].
pub struct RecordWriter {
    store: Arc<dyn RecordStore>,
    table: String,
    status_table: String,
}

impl RecordWriter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        table: impl Into<String>,
        status_table: impl Into<String>,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            status_table: status_table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    async fn column_map(&self) -> Result<ColumnMap, ProvisionError> {
        let live = self.store.live_columns(&self.table).await?;
        Ok(map_columns(&live))
    }

    async fn status_id(&self, status: ContainerStatus) -> Result<i64, ProvisionError> {
        self.store
            .lookup_id(&self.status_table, status.as_str())
            .await?
            .ok_or_else(|| ProvisionError::NotFound {
                kind: "status",
                id: status.to_string(),
            })
    }

    /// Status assignment: the lookup key when a reference column exists,
    /// otherwise the text name.
    async fn status_assignment(
        &self,
        map: &ColumnMap,
        status: ContainerStatus,
    ) -> Result<Option<Assignment>, ProvisionError> {
        if let Some(column) = map.get(LogicalField::StatusRef) {
            let id = self.status_id(status).await?;
            return Ok(Some(Assignment::new(column.clone(), ColumnValue::Int(id))));
        }
        Ok(map.get(LogicalField::Status).map(|column| {
            Assignment::new(column.clone(), ColumnValue::Text(status.as_str().to_string()))
        }))
    }

    /// Insert a new record and return its id.
    pub async fn insert(&self, record: &LogicalRecord) -> Result<i64, ProvisionError> {
        let memory_mb = record
            .resources
            .memory_mb
            .map(|v| int_resource("memory_mb", v))
            .transpose()?;
        let disk_gb = record
            .resources
            .disk_gb
            .map(|v| int_resource("disk_gb", v))
            .transpose()?;

        let map = self.column_map().await?;
        let mut assignments = Vec::new();
        let mut push = |field: LogicalField, value: ColumnValue| {
            if let Some(column) = map.get(field) {
                assignments.push(Assignment::new(column.clone(), value));
            }
        };

        push(LogicalField::Name, ColumnValue::Text(record.name.clone()));
        push(LogicalField::Image, ColumnValue::Text(record.image.clone()));
        if let Some(task_id) = record.task_id {
            push(LogicalField::Task, ColumnValue::Int(task_id));
        }
        push(LogicalField::Owner, ColumnValue::Int(record.owner_id));
        if let Some(address) = &record.address {
            push(LogicalField::Address, ColumnValue::Text(address.clone()));
        }
        push(
            LogicalField::Metadata,
            ColumnValue::Text(encode_metadata(&record.metadata)),
        );
        push(
            LogicalField::CreatedAt,
            match record.created_at {
                Some(at) => ColumnValue::Text(at.to_rfc3339()),
                None => ColumnValue::Now,
            },
        );
        if let Some(cpu) = record.resources.cpu {
            push(LogicalField::Cpu, ColumnValue::Int(i64::from(cpu)));
        }
        if let Some(memory) = memory_mb {
            push(LogicalField::Memory, ColumnValue::Int(memory));
        }
        if let Some(disk) = disk_gb {
            push(LogicalField::Disk, ColumnValue::Int(disk));
        }
        if let Some(status) = self.status_assignment(&map, record.status).await? {
            assignments.push(status);
        }

        if assignments.is_empty() {
            return Err(ProvisionError::SchemaMismatch {
                table: self.table.clone(),
            });
        }

        let id = self.store.insert(&self.table, &assignments).await?;
        tracing::debug!(
            table = %self.table,
            id,
            columns = assignments.len(),
            "Inserted lifecycle record"
        );
        Ok(id)
    }

    /// Apply `patch` to record `id`.
    ///
    /// With `expected` set, the update only lands while the stored status
    /// still equals it. Returns whether a row was updated.
    pub async fn update(
        &self,
        id: i64,
        patch: &RecordPatch,
        expected: Option<ContainerStatus>,
    ) -> Result<bool, ProvisionError> {
        let map = self.column_map().await?;
        let mut assignments = Vec::new();

        if let Some(status) = self.status_assignment(&map, patch.status).await? {
            assignments.push(status);
        }
        if let (Some(address), Some(column)) = (&patch.address, map.get(LogicalField::Address)) {
            assignments.push(Assignment::new(column.clone(), ColumnValue::Text(address.clone())));
        }
        if let (Some(metadata), Some(column)) = (&patch.metadata, map.get(LogicalField::Metadata)) {
            assignments.push(Assignment::new(
                column.clone(),
                ColumnValue::Text(encode_metadata(metadata)),
            ));
        }
        if let Some(column) = map.get(LogicalField::UpdatedAt) {
            assignments.push(Assignment::new(column.clone(), ColumnValue::Now));
        }

        if assignments.is_empty() {
            return Err(ProvisionError::SchemaMismatch {
                table: self.table.clone(),
            });
        }

        let guard = match expected {
            Some(status) => self.status_filter(&map, status).await?.map(|(column, expected)| {
                UpdateGuard { column, expected }
            }),
            None => None,
        };

        let touched = self
            .store
            .update(&self.table, id, &assignments, guard.as_ref())
            .await?;
        Ok(touched > 0)
    }

    /// Column and value that select rows in `status`.
    async fn status_filter(
        &self,
        map: &ColumnMap,
        status: ContainerStatus,
    ) -> Result<Option<(String, ColumnValue)>, ProvisionError> {
        if let Some(column) = map.name(LogicalField::StatusRef) {
            let id = self.status_id(status).await?;
            return Ok(Some((column.to_string(), ColumnValue::Int(id))));
        }
        Ok(map
            .name(LogicalField::Status)
            .map(|column| (column.to_string(), ColumnValue::Text(status.as_str().to_string()))))
    }

    /// Look a record up by id or external identifier.
    pub async fn find(&self, target: &ContainerRef) -> Result<Option<ContainerRecord>, ProvisionError> {
        let map = self.column_map().await?;
        let filter = match target {
            ContainerRef::Id(id) => ("id".to_string(), ColumnValue::Int(*id)),
            ContainerRef::Name(name) => match map.name(LogicalField::Name) {
                Some(column) => (column.to_string(), ColumnValue::Text(name.clone())),
                None => {
                    return Err(ProvisionError::SchemaMismatch {
                        table: self.table.clone(),
                    });
                }
            },
        };

        let rows = self.store.select(&self.table, &[filter]).await?;
        match rows.first() {
            Some(row) => Ok(Some(self.decode(&map, row).await?)),
            None => Ok(None),
        }
    }

    /// Every record currently in `status`.
    pub async fn find_by_status(
        &self,
        status: ContainerStatus,
    ) -> Result<Vec<ContainerRecord>, ProvisionError> {
        let map = self.column_map().await?;
        let Some(filter) = self.status_filter(&map, status).await? else {
            return Err(ProvisionError::SchemaMismatch {
                table: self.table.clone(),
            });
        };

        let rows = self.store.select(&self.table, &[filter]).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(self.decode(&map, row).await?);
        }
        Ok(records)
    }

    async fn decode(&self, map: &ColumnMap, row: &Row) -> Result<ContainerRecord, ProvisionError> {
        let cell = |field: LogicalField| map.name(field).and_then(|name| row.get(name));

        let id = row
            .get("id")
            .and_then(cell_i64)
            .ok_or_else(|| StoreError::Decode(format!("{} row without id", self.table)))?;

        let status = if let Some(status_id) = cell(LogicalField::StatusRef).and_then(cell_i64) {
            self.store
                .lookup_name(&self.status_table, status_id)
                .await?
                .ok_or_else(|| StoreError::Decode(format!("unknown status id {status_id}")))?
        } else {
            cell(LogicalField::Status)
                .and_then(value_as_text)
                .ok_or_else(|| StoreError::Decode(format!("{} row {id} has no status", self.table)))?
        };
        let status = status
            .parse::<ContainerStatus>()
            .map_err(StoreError::Decode)?;

        Ok(ContainerRecord {
            id,
            name: cell(LogicalField::Name)
                .and_then(value_as_text)
                .unwrap_or_default(),
            image: cell(LogicalField::Image).and_then(value_as_text),
            task_id: cell(LogicalField::Task).and_then(cell_i64),
            owner_id: cell(LogicalField::Owner).and_then(cell_i64),
            status,
            address: cell(LogicalField::Address).and_then(value_as_text),
            metadata: cell(LogicalField::Metadata)
                .map(decode_metadata)
                .unwrap_or_default(),
            created_at: cell(LogicalField::CreatedAt).and_then(cell_timestamp),
        })
    }
}

fn int_resource(field: &'static str, value: u64) -> Result<i64, ProvisionError> {
    i64::try_from(value).map_err(|_| ProvisionError::ResourceOutOfRange { field, value })
}

fn cell_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decode_metadata(value: &Value) -> Metadata {
    match value {
        Value::Object(map) => map.clone().into_iter().collect(),
        Value::String(s) => serde_json::from_str(s).unwrap_or_default(),
        _ => Metadata::new(),
    }
}

/// Timestamps arrive as RFC 3339 from `row_to_json` on `timestamptz`, or
/// without an offset on `timestamp` columns (taken as UTC).
fn cell_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
