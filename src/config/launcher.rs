use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Which compute backend realizes a lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherMode {
    /// No resources are created; canned loopback reachability is returned.
    Simulated,
    /// LXD instances driven through the `lxc` CLI.
    Lxd,
    /// Docker containers driven through the Engine API.
    Docker,
}

impl LauncherMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Lxd => "lxd",
            Self::Docker => "docker",
        }
    }
}

impl std::fmt::Display for LauncherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LauncherMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulated" | "simulate" | "mock" => Ok(Self::Simulated),
            "lxd" | "lxc" => Ok(Self::Lxd),
            "docker" => Ok(Self::Docker),
            _ => Err(format!(
                "Unknown launcher mode '{}'. Supported: simulated, lxd, docker",
                s
            )),
        }
    }
}

/// Address family the launcher waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inet => "inet",
            Self::Inet6 => "inet6",
        }
    }
}

impl std::str::FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inet" | "ipv4" => Ok(Self::Inet),
            "inet6" | "ipv6" => Ok(Self::Inet6),
            _ => Err(format!("Unknown address family '{}'", s)),
        }
    }
}

/// Compute launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub mode: LauncherMode,
    /// Path or name of the LXD client binary.
    pub lxc_binary: String,
    pub address_family: AddressFamily,
    /// Upper bound on waiting for a freshly created instance to report an address.
    pub address_timeout: Duration,
    pub poll_interval: Duration,
    /// Login user advertised in the shell connection parameters.
    pub ssh_user: String,
    pub ssh_port: u16,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            mode: LauncherMode::Simulated,
            lxc_binary: "lxc".to_string(),
            address_family: AddressFamily::Inet,
            address_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1000),
            ssh_user: "ubuntu".to_string(),
            ssh_port: 22,
        }
    }
}

impl LauncherConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mode = parse_string_env("LAB_LAUNCHER_MODE", defaults.mode.as_str())?
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                key: "LAB_LAUNCHER_MODE".to_string(),
                message,
            })?;
        let address_family = parse_string_env("LAB_ADDRESS_FAMILY", "inet")?
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                key: "LAB_ADDRESS_FAMILY".to_string(),
                message,
            })?;

        Ok(Self {
            mode,
            lxc_binary: parse_string_env("LAB_LXC_BINARY", defaults.lxc_binary)?,
            address_family,
            address_timeout: Duration::from_secs(parse_optional_env(
                "LAB_ADDRESS_TIMEOUT_SECS",
                defaults.address_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_optional_env("LAB_ADDRESS_POLL_MS", 1000)?),
            ssh_user: parse_string_env("LAB_SSH_USER", defaults.ssh_user)?,
            ssh_port: parse_optional_env("LAB_SSH_PORT", defaults.ssh_port)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launcher_mode_parse() {
        assert_eq!("simulated".parse::<LauncherMode>(), Ok(LauncherMode::Simulated));
        assert_eq!("LXD".parse::<LauncherMode>(), Ok(LauncherMode::Lxd));
        assert_eq!("docker".parse::<LauncherMode>(), Ok(LauncherMode::Docker));
        assert!("kubernetes".parse::<LauncherMode>().is_err());
    }

    #[test]
    fn address_family_parse() {
        assert_eq!("inet".parse::<AddressFamily>(), Ok(AddressFamily::Inet));
        assert_eq!("ipv6".parse::<AddressFamily>(), Ok(AddressFamily::Inet6));
        assert!("ax25".parse::<AddressFamily>().is_err());
    }

    #[test]
    fn default_is_simulated_with_bounded_poll() {
        let config = LauncherConfig::default();
        assert_eq!(config.mode, LauncherMode::Simulated);
        assert!(config.address_timeout > config.poll_interval);
    }
}
