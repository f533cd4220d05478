//! Provisioning orchestrator.
//!
//! Reserve a lifecycle record, launch, finalize, audit. The reservation is
//! committed before the launcher runs (commit-then-reconcile): a failed
//! launch marks the record `failed`, and [`ProvisioningOrchestrator::reconcile_stale`]
//! catches records whose process died before even that update landed.
//! No lock is held across the steps; the unique constraint on the external
//! identifier is the only serialization point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::audit::{AuditEntry, AuditSink};
use crate::config::ProvisioningConfig;
use crate::db::{ColumnValue, RecordStore};
use crate::error::{ProvisionError, StoreError};
use crate::provisioning::dependencies::validate_dependencies;
use crate::provisioning::launcher::{ComputeLauncher, LaunchSpec, ShellConnection};
use crate::provisioning::record::{
    ContainerRecord, ContainerRef, ContainerStatus, LogicalRecord, Metadata, RecordPatch,
    ResourceShape,
};
use crate::provisioning::writer::RecordWriter;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 8;

/// Metadata key holding the reservation time, for schemas without a
/// created-at column.
pub const RESERVED_AT_KEY: &str = "reserved_at";

/// `<prefix>-<8 random lowercase alphanumerics>`.
pub fn generate_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{prefix}-{suffix}")
}

/// A request to launch a lab.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub owner_id: i64,
    pub task_id: Option<i64>,
    pub dependencies: Vec<String>,
    pub ssh_public_key: Option<String>,
}

/// What the gateway needs to open a shell. Never infrastructure credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub container_id: i64,
}

#[derive(Debug, Clone)]
pub struct LaunchResult {
    pub container: ContainerRecord,
    pub ssh: ShellConnection,
    pub host_key: Option<String>,
    pub connection: ConnectionDescriptor,
}

type NameSource = Box<dyn Fn(&str) -> String + Send + Sync>;

pub struct ProvisioningOrchestrator {
    writer: RecordWriter,
    launcher: Arc<dyn ComputeLauncher>,
    audit: Arc<dyn AuditSink>,
    config: ProvisioningConfig,
    names: NameSource,
    /// First sweep that saw a `creating` record with no recorded age.
    first_seen: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        launcher: Arc<dyn ComputeLauncher>,
        audit: Arc<dyn AuditSink>,
        config: ProvisioningConfig,
    ) -> Self {
        let writer = RecordWriter::new(
            store,
            config.containers_table.clone(),
            config.status_table.clone(),
        );
        Self {
            writer,
            launcher,
            audit,
            config,
            names: Box::new(generate_name),
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the external identifier generator.
    pub fn with_name_source<F>(mut self, names: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.names = Box::new(names);
        self
    }

    pub fn writer(&self) -> &RecordWriter {
        &self.writer
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Launch a lab for `request.owner_id`.
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchResult, ProvisionError> {
        let dependencies = validate_dependencies(&request.dependencies)?;
        if let Some(task_id) = request.task_id {
            self.ensure_task(task_id).await?;
        }

        let tokens: Vec<String> = dependencies.iter().map(|d| d.to_string()).collect();
        let mut metadata = Metadata::new();
        metadata.insert("dependencies".into(), json!(tokens));
        metadata.insert(RESERVED_AT_KEY.into(), json!(Utc::now().to_rfc3339()));

        let (id, name) = self.reserve(&request, &metadata).await?;
        tracing::info!(container = %name, id, owner = request.owner_id, "Reserved lab record");

        let spec = LaunchSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            dependencies,
            public_key: request.ssh_public_key.clone(),
        };

        let outcome = match self.launcher.launch(&spec).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "Launch failed");
                metadata.insert("error".into(), Value::from(e.to_string()));
                let patch = RecordPatch::status(ContainerStatus::Failed).with_metadata(metadata);
                if let Err(mark) = self.transition(id, ContainerStatus::Creating, &patch).await {
                    tracing::warn!(
                        container = %name,
                        error = %mark,
                        "Could not mark record failed, leaving it to the sweep"
                    );
                }
                return Err(e.into_provision_error(&name));
            }
        };

        metadata.insert("ssh".into(), json!(outcome.shell));
        if let Some(fingerprint) = &outcome.host_key_fingerprint {
            metadata.insert("host_key".into(), Value::from(fingerprint.clone()));
        }
        let patch = RecordPatch::status(ContainerStatus::Running)
            .with_address(outcome.network_address.clone())
            .with_metadata(metadata);
        if !self.transition(id, ContainerStatus::Creating, &patch).await? {
            tracing::warn!(
                container = %name,
                id,
                address = %outcome.network_address,
                mode = %self.launcher.mode(),
                "Record left creating during launch, backend instance needs manual cleanup"
            );
            return Err(ProvisionError::LaunchFailed {
                name,
                reason: "record left the creating state during launch".to_string(),
            });
        }

        let mut details = Metadata::new();
        details.insert("name".into(), Value::from(name.clone()));
        details.insert("dependencies".into(), json!(tokens));
        let entry = AuditEntry::new(request.owner_id, "launch_container", "container", id)
            .with_details(details);
        if let Err(e) = self.audit.record(&entry).await {
            tracing::warn!(container = %name, error = %e, "Audit entry not recorded");
        }

        let container = self
            .writer
            .find(&ContainerRef::Id(id))
            .await?
            .ok_or_else(|| ProvisionError::NotFound {
                kind: "container",
                id: id.to_string(),
            })?;

        tracing::info!(
            container = %name,
            id,
            address = %outcome.network_address,
            mode = %self.launcher.mode(),
            "Lab running"
        );
        Ok(LaunchResult {
            container,
            ssh: outcome.shell,
            host_key: outcome.host_key_fingerprint,
            connection: ConnectionDescriptor { container_id: id },
        })
    }

    /// Insert the `creating` record, regenerating the name on a unique
    /// violation.
    async fn reserve(
        &self,
        request: &LaunchRequest,
        metadata: &Metadata,
    ) -> Result<(i64, String), ProvisionError> {
        let attempts = self.config.name_attempts.max(1);
        for attempt in 1..=attempts {
            let name = (self.names)(&self.config.name_prefix);
            let record = LogicalRecord {
                name: name.clone(),
                image: self.config.image.clone(),
                task_id: request.task_id,
                owner_id: request.owner_id,
                status: ContainerStatus::Creating,
                address: None,
                metadata: metadata.clone(),
                resources: ResourceShape::default(),
                created_at: None,
            };
            match self.writer.insert(&record).await {
                Ok(id) => return Ok((id, name)),
                Err(ProvisionError::Store(StoreError::UniqueViolation { detail, .. })) => {
                    tracing::debug!(container = %name, attempt, detail = %detail, "Name taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProvisionError::NameCollision { attempts })
    }

    async fn ensure_task(&self, task_id: i64) -> Result<(), ProvisionError> {
        let store = self.writer.store();
        let table = &self.config.tasks_table;
        if store.live_columns(table).await?.is_empty() {
            tracing::warn!(table = %table, "Tasks table not found, skipping task check");
            return Ok(());
        }
        let rows = store
            .select(table, &[("id".to_string(), ColumnValue::Int(task_id))])
            .await?;
        if rows.is_empty() {
            return Err(ProvisionError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// Move record `id` from `from` to `patch.status`, guarded on `from`.
    async fn transition(
        &self,
        id: i64,
        from: ContainerStatus,
        patch: &RecordPatch,
    ) -> Result<bool, ProvisionError> {
        from.check_transition(patch.status)?;
        self.writer.update(id, patch, Some(from)).await
    }

    /// Mark records stuck in `creating` for longer than `older_than` as
    /// failed. Returns how many were marked.
    ///
    /// A record's age comes from its created-at column, then
    /// `metadata.reserved_at`, then the first sweep that saw it.
    pub async fn reconcile_stale(&self, older_than: Duration) -> Result<usize, ProvisionError> {
        let Ok(max_age) = chrono::Duration::from_std(older_than) else {
            return Ok(0);
        };
        let now = Utc::now();
        let creating = self.writer.find_by_status(ContainerStatus::Creating).await?;

        let mut stale = Vec::new();
        {
            let mut first_seen = self.first_seen.lock().await;
            first_seen.retain(|id, _| creating.iter().any(|r| r.id == *id));
            for record in &creating {
                let reserved_at = match reservation_time(record) {
                    Some(at) => at,
                    None => *first_seen.entry(record.id).or_insert(now),
                };
                if now.signed_duration_since(reserved_at) >= max_age {
                    stale.push(record);
                }
            }
        }

        let mut marked = 0;
        for record in stale {
            let mut metadata = record.metadata.clone();
            metadata.insert(
                "error".into(),
                Value::from("launch did not complete before the reconcile deadline"),
            );
            let patch = RecordPatch::status(ContainerStatus::Failed).with_metadata(metadata);
            if self.transition(record.id, ContainerStatus::Creating, &patch).await? {
                tracing::warn!(container = %record.name, id = record.id, "Marked stale record failed");
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Run [`reconcile_stale`](Self::reconcile_stale) every `interval`.
    pub fn spawn_reconciler(
        self: Arc<Self>,
        interval: Duration,
        stale_after: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.reconcile_stale(stale_after).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(marked = n, "Reconciled stale lab records"),
                    Err(e) => tracing::warn!(error = %e, "Stale record sweep failed"),
                }
            }
        })
    }
}

fn reservation_time(record: &ContainerRecord) -> Option<DateTime<Utc>> {
    record.created_at.or_else(|| {
        record
            .metadata
            .get(RESERVED_AT_KEY)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at.with_timezone(&Utc))
    })
}
