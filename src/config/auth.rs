use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Minimum length of the token signing secret, in bytes.
const MIN_SECRET_LEN: usize = 32;

/// Bearer-token verification settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: SecretString,
    pub token_ttl: Duration,
}

impl AuthConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let secret = optional_env("LAB_AUTH_SECRET")?.ok_or_else(|| ConfigError::MissingRequired {
            key: "LAB_AUTH_SECRET".to_string(),
            hint: "Set it to the token signing secret shared with the portal".to_string(),
        })?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::InvalidValue {
                key: "LAB_AUTH_SECRET".to_string(),
                message: format!("must be at least {MIN_SECRET_LEN} bytes"),
            });
        }
        Ok(Self {
            secret: SecretString::from(secret),
            token_ttl: Duration::from_secs(parse_optional_env("LAB_TOKEN_TTL_SECS", 3600)?),
        })
    }
}
