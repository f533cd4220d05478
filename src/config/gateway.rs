use std::time::Duration;

use crate::config::helpers::{parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Remote session gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Fixed path of the session channel endpoint.
    pub ws_path: String,
    /// Attach a local shell process instead of a remote secure shell.
    /// Development and test only.
    pub local_fallback: bool,
    pub local_shell: String,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    pub max_sessions: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws/terminal".to_string(),
            local_fallback: false,
            local_shell: "/bin/sh".to_string(),
            idle_timeout: Some(Duration::from_secs(1800)),
            max_sessions: 256,
        }
    }
}

impl GatewayConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let ws_path = parse_string_env("GATEWAY_WS_PATH", defaults.ws_path)?;
        if !ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "GATEWAY_WS_PATH".to_string(),
                message: "must start with '/'".to_string(),
            });
        }
        let idle_secs: u64 = parse_optional_env("GATEWAY_IDLE_TIMEOUT_SECS", 1800)?;

        Ok(Self {
            host: parse_string_env("GATEWAY_HOST", defaults.host)?,
            port: parse_optional_env("GATEWAY_PORT", defaults.port)?,
            ws_path,
            local_fallback: parse_bool_env("GATEWAY_LOCAL_FALLBACK", defaults.local_fallback)?,
            local_shell: parse_string_env("GATEWAY_LOCAL_SHELL", defaults.local_shell)?,
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            max_sessions: parse_optional_env("GATEWAY_MAX_SESSIONS", defaults.max_sessions)?,
        })
    }
}
