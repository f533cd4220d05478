use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Orchestrator and record-writer settings.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Prefix of generated external identifiers (`<prefix>-<suffix>`).
    pub name_prefix: String,
    /// Image or template requested for every lab.
    pub image: String,
    pub containers_table: String,
    /// Lookup table resolving status names to ids, when the schema uses one.
    pub status_table: String,
    pub tasks_table: String,
    pub audit_table: String,
    /// How many suffixes to try before giving up on a unique name.
    pub name_attempts: u32,
    /// Age after which a record still in `creating` is marked failed.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            name_prefix: "lab".to_string(),
            image: "ubuntu:22.04".to_string(),
            containers_table: "containers".to_string(),
            status_table: "container_statuses".to_string(),
            tasks_table: "tasks".to_string(),
            audit_table: "audit_logs".to_string(),
            name_attempts: 3,
            stale_after: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl ProvisioningConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let name_prefix = parse_string_env("LAB_NAME_PREFIX", defaults.name_prefix)?;
        if !name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigError::InvalidValue {
                key: "LAB_NAME_PREFIX".to_string(),
                message: "only ASCII letters, digits and '-' are allowed".to_string(),
            });
        }
        let name_attempts = parse_optional_env("LAB_NAME_ATTEMPTS", defaults.name_attempts)?;
        if name_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LAB_NAME_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            name_prefix,
            image: parse_string_env("LAB_IMAGE", defaults.image)?,
            containers_table: parse_string_env("LAB_CONTAINERS_TABLE", defaults.containers_table)?,
            status_table: parse_string_env("LAB_STATUS_TABLE", defaults.status_table)?,
            tasks_table: parse_string_env("LAB_TASKS_TABLE", defaults.tasks_table)?,
            audit_table: parse_string_env("LAB_AUDIT_TABLE", defaults.audit_table)?,
            name_attempts,
            stale_after: Duration::from_secs(parse_optional_env(
                "LAB_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(parse_optional_env(
                "LAB_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
        })
    }
}
