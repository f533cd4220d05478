//! Resolves the container a `connect` frame names and checks that the
//! caller may attach to it.

use async_trait::async_trait;

use crate::auth::Claims;
use crate::error::GatewayError;
use crate::provisioning::{ContainerRef, ContainerStatus, RecordWriter};

/// What the gateway knows about an attach target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    pub id: i64,
    pub name: String,
    pub owner_id: Option<i64>,
    pub address: Option<String>,
    pub status: ContainerStatus,
}

#[async_trait]
pub trait ContainerDirectory: Send + Sync {
    async fn resolve(&self, container: &ContainerRef) -> Result<Option<ContainerTarget>, GatewayError>;
}

/// Directory reading lifecycle records through the record writer.
pub struct StoreContainerDirectory {
    writer: RecordWriter,
}

impl StoreContainerDirectory {
    pub fn new(writer: RecordWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl ContainerDirectory for StoreContainerDirectory {
    async fn resolve(&self, container: &ContainerRef) -> Result<Option<ContainerTarget>, GatewayError> {
        let record = self
            .writer
            .find(container)
            .await
            .map_err(|e| GatewayError::BackendUnavailable(format!("container lookup failed: {e}")))?;
        Ok(record.map(|r| ContainerTarget {
            id: r.id,
            name: r.name,
            owner_id: r.owner_id,
            address: r.address,
            status: r.status,
        }))
    }
}

/// Owners and admins may attach; nobody else.
pub fn authorize(claims: &Claims, target: &ContainerTarget) -> Result<(), GatewayError> {
    if claims.is_admin() || target.owner_id == Some(claims.user_id()) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden(target.id.to_string()))
    }
}

/// Only running labs take a shell.
pub fn ensure_running(target: &ContainerTarget) -> Result<(), GatewayError> {
    if target.status == ContainerStatus::Running {
        Ok(())
    } else {
        Err(GatewayError::NotRunning {
            name: target.name.clone(),
            status: target.status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::db::InMemoryRecordStore;
    use crate::provisioning::{LogicalRecord, Metadata, ResourceShape};

    fn target(owner: Option<i64>) -> ContainerTarget {
        ContainerTarget {
            id: 5,
            name: "lab-owned001".into(),
            owner_id: owner,
            address: Some("10.0.0.5".into()),
            status: ContainerStatus::Running,
        }
    }

    #[test]
    fn owner_and_admin_may_attach() {
        let ttl = Duration::from_secs(60);
        assert!(authorize(&Claims::new(7, "student", ttl), &target(Some(7))).is_ok());
        assert!(authorize(&Claims::new(1, "admin", ttl), &target(Some(7))).is_ok());
        assert!(matches!(
            authorize(&Claims::new(8, "student", ttl), &target(Some(7))),
            Err(GatewayError::Forbidden(_))
        ));
        assert!(authorize(&Claims::new(8, "student", ttl), &target(None)).is_err());
    }

    #[tokio::test]
    async fn store_directory_resolves_by_id_and_name() {
        let store = Arc::new(InMemoryRecordStore::with_default_schema());
        let writer = RecordWriter::new(store.clone(), "containers", "container_statuses");
        let id = writer
            .insert(&LogicalRecord {
                name: "lab-dir00001".into(),
                image: "ubuntu:22.04".into(),
                task_id: None,
                owner_id: 11,
                status: ContainerStatus::Creating,
                address: None,
                metadata: Metadata::new(),
                resources: ResourceShape::default(),
                created_at: None,
            })
            .await
            .unwrap();

        let directory =
            StoreContainerDirectory::new(RecordWriter::new(store, "containers", "container_statuses"));
        let by_id = directory.resolve(&ContainerRef::Id(id)).await.unwrap().unwrap();
        assert_eq!(by_id.name, "lab-dir00001");
        assert_eq!(by_id.owner_id, Some(11));
        let by_name = directory
            .resolve(&ContainerRef::Name("lab-dir00001".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, id);
        assert!(directory.resolve(&ContainerRef::Id(999)).await.unwrap().is_none());
    }
}
