//! Lifecycle record types.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProvisionError;

/// Free-form metadata carried on a record. Ordered so its text encoding is
/// canonical.
pub type Metadata = BTreeMap<String, Value>;

/// Lifecycle status of a lab container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopped,
    Failed,
    Deleting,
}

impl ContainerStatus {
    pub const ALL: [ContainerStatus; 5] = [
        Self::Creating,
        Self::Running,
        Self::Stopped,
        Self::Failed,
        Self::Deleting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        }
    }

    /// Whether the lifecycle graph allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Failed)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopped, Running)
                | (Stopped, Deleting)
        )
    }

    /// Like [`can_transition_to`](Self::can_transition_to), as a `Result`.
    pub fn check_transition(&self, next: ContainerStatus) -> Result<(), ProvisionError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ProvisionError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown container status '{s}'"))
    }
}

/// Requested resource shape. Written when the table has matching columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub cpu: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

/// Logical payload handed to the record writer on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRecord {
    pub name: String,
    pub image: String,
    pub task_id: Option<i64>,
    pub owner_id: i64,
    pub status: ContainerStatus,
    pub address: Option<String>,
    pub metadata: Metadata,
    pub resources: ResourceShape,
    /// Left `None` to let the store stamp the row.
    pub created_at: Option<DateTime<Utc>>,
}

/// Fields changed by a post-launch update.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPatch {
    pub status: ContainerStatus,
    pub address: Option<String>,
    pub metadata: Option<Metadata>,
}

impl RecordPatch {
    pub fn status(status: ContainerStatus) -> Self {
        Self {
            status,
            address: None,
            metadata: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A lifecycle record as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerRecord {
    pub id: i64,
    pub name: String,
    pub image: Option<String>,
    pub task_id: Option<i64>,
    pub owner_id: Option<i64>,
    pub status: ContainerStatus,
    pub address: Option<String>,
    pub metadata: Metadata,
    pub created_at: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    /// Dependency tokens echoed into metadata at launch time.
    pub fn dependencies(&self) -> Vec<String> {
        self.metadata
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// How a caller names a container: by internal id or external identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContainerRef {
    Id(i64),
    Name(String),
}

impl ContainerRef {
    /// Numeric strings are treated as ids.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Name(raw.trim().to_string()),
        }
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph() {
        use ContainerStatus::*;
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));
        assert!(Stopped.can_transition_to(Running));
        assert!(Stopped.can_transition_to(Deleting));

        assert!(!Creating.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Creating));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Deleting.can_transition_to(Stopped));
        assert!(matches!(
            Failed.check_transition(Running),
            Err(ProvisionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn status_parses_its_own_names() {
        for status in ContainerStatus::ALL {
            assert_eq!(status.as_str().parse::<ContainerStatus>().unwrap(), status);
        }
        assert!("Running".parse::<ContainerStatus>().is_err());
    }

    #[test]
    fn container_ref_deserializes_number_or_string() {
        let id: ContainerRef = serde_json::from_str("17").unwrap();
        assert_eq!(id, ContainerRef::Id(17));
        let name: ContainerRef = serde_json::from_str("\"lab-abc\"").unwrap();
        assert_eq!(name, ContainerRef::Name("lab-abc".into()));
        assert_eq!(ContainerRef::parse("42"), ContainerRef::Id(42));
    }
}
