//! Configuration for labforge.
//!
//! Settings are loaded with priority: env var > default. A `.env` file in
//! the working directory is loaded via dotenvy before anything is read, and
//! never overrides variables that are already set.

mod auth;
mod database;
mod gateway;
pub(crate) mod helpers;
mod launcher;
mod provisioning;

use crate::error::ConfigError;

pub use self::auth::AuthConfig;
pub use self::database::DatabaseConfig;
pub use self::gateway::GatewayConfig;
pub use self::launcher::{AddressFamily, LauncherConfig, LauncherMode};
pub use self::provisioning::ProvisioningConfig;

/// Main configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub provisioning: ProvisioningConfig,
    pub launcher: LauncherConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database: DatabaseConfig::resolve()?,
            provisioning: ProvisioningConfig::resolve()?,
            launcher: LauncherConfig::resolve()?,
            gateway: GatewayConfig::resolve()?,
            auth: AuthConfig::resolve()?,
        })
    }
}
