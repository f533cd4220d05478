//! Append-only audit log of provisioning actions.
//!
//! The audit table's layout is owned elsewhere, so the store-backed sink
//! maps its fields onto whatever columns are live, like the record writer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::db::{Assignment, ColumnValue, RecordStore};
use crate::error::StoreError;
use crate::provisioning::Metadata;
use crate::provisioning::writer::encode_metadata;

/// One audited action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub actor_id: i64,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub details: Metadata,
}

impl AuditEntry {
    pub fn new(
        actor_id: i64,
        action: impl Into<String>,
        target_type: impl Into<String>,
        target_id: impl ToString,
    ) -> Self {
        Self {
            actor_id,
            action: action.into(),
            target_type: target_type.into(),
            target_id: target_id.to_string(),
            details: Metadata::new(),
        }
    }

    pub fn with_details(mut self, details: Metadata) -> Self {
        self.details = details;
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

const ACTOR_COLUMNS: &[&str] = &["user_id", "actor_id"];
const ACTION_COLUMNS: &[&str] = &["action"];
const TARGET_TYPE_COLUMNS: &[&str] = &["target_type", "entity_type"];
const TARGET_ID_COLUMNS: &[&str] = &["target_id", "entity_id"];
const DETAILS_COLUMNS: &[&str] = &["details", "metadata"];
const CREATED_COLUMNS: &[&str] = &["created_at", "timestamp"];

/// Sink writing into an audit table through a [`RecordStore`].
pub struct StoreAuditSink {
    store: Arc<dyn RecordStore>,
    table: String,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let live = self.store.live_columns(&self.table).await?;
        let mut assignments = Vec::new();
        let mut push = |candidates: &[&str], value: ColumnValue| {
            if let Some(column) = candidates
                .iter()
                .find_map(|name| live.iter().find(|c| c.name == *name))
            {
                assignments.push(Assignment::new(column.clone(), value));
            }
        };

        push(ACTOR_COLUMNS, ColumnValue::Int(entry.actor_id));
        push(ACTION_COLUMNS, ColumnValue::Text(entry.action.clone()));
        push(TARGET_TYPE_COLUMNS, ColumnValue::Text(entry.target_type.clone()));
        push(TARGET_ID_COLUMNS, ColumnValue::Text(entry.target_id.clone()));
        push(DETAILS_COLUMNS, ColumnValue::Text(encode_metadata(&entry.details)));
        push(CREATED_COLUMNS, ColumnValue::Now);

        if assignments.is_empty() {
            return Err(StoreError::UnknownTable(self.table.clone()));
        }
        self.store.insert(&self.table, &assignments).await?;
        Ok(())
    }
}

/// Sink that keeps entries in memory.
#[derive(Default)]
pub struct InMemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}
