//! Error types for labforge.

use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by a [`RecordStore`](crate::db::RecordStore).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Unique constraint violated on {table}: {detail}")]
    UniqueViolation { table: String, detail: String },

    #[error("Table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Row decode failed: {0}")]
    Decode(String),
}

/// Provisioning errors surfaced by the orchestrator and the record writer.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Invalid dependencies: {}", tokens.join(", "))]
    InvalidDependency { tokens: Vec<String> },

    #[error("No logical field maps to a live column of table {table}")]
    SchemaMismatch { table: String },

    #[error("Launch of {name} failed: {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Resource {field} = {value} does not fit a database integer")]
    ResourceOutOfRange { field: &'static str, value: u64 },

    #[error("Could not allocate a unique container name after {attempts} attempts")]
    NameCollision { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from a compute launcher or backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LauncherError {
    #[error("backend command failed for {name}: {reason}")]
    CommandFailed { name: String, reason: String },

    #[error("{name} reported no usable address within {waited:?}")]
    AddressTimeout { name: String, waited: Duration },

    #[error("unexpected backend output for {name}: {reason}")]
    InvalidOutput { name: String, reason: String },
}

impl LauncherError {
    pub fn into_provision_error(self, name: &str) -> ProvisionError {
        ProvisionError::LaunchFailed {
            name: name.to_string(),
            reason: self.to_string(),
        }
    }
}

/// Bearer-token verification errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    Expired,
}

/// Per-channel gateway errors. None of these ever escape the channel.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Container {0} not found")]
    ContainerNotFound(String),

    #[error("Access to container {0} denied")]
    Forbidden(String),

    #[error("Container {name} is {status}, not running")]
    NotRunning { name: String, status: String },

    #[error("Shell backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Failed to spawn shell: {0}")]
    Spawn(String),

    #[error("Shell I/O error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}
