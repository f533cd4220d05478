use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Postgres connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `DATABASE_URL`. `None` is only valid when running with `--no-db`.
    pub url: Option<SecretString>,
    pub pool_size: usize,
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            url: optional_env("DATABASE_URL")?.map(SecretString::from),
            pool_size: parse_optional_env("DATABASE_POOL_SIZE", 10)?,
        })
    }
}
