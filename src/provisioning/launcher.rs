//! Compute launcher: realizes (or simulates) an isolated lab environment
//! and reports how to reach it.
//!
//! Real mode drives a [`ComputeBackend`] (LXD or Docker): issue the create
//! command, then poll backend state until a global address of the
//! configured family appears or the poll window closes. Simulated mode
//! creates nothing and hands back loopback parameters so the rest of the
//! pipeline can run without infrastructure. Neither mode retries; the
//! caller owns retry and rollback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{AddressFamily, LauncherConfig, LauncherMode};
use crate::error::LauncherError;
use crate::provisioning::dependencies::Dependency;
use crate::provisioning::docker::DockerBackend;
use crate::provisioning::lxd::LxdBackend;

/// Address the simulated launcher reports for every instance.
pub const SIMULATED_ADDRESS: &str = "127.0.0.1";

/// What to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// External identifier the backend will know the instance by.
    pub name: String,
    pub image: String,
    pub dependencies: Vec<Dependency>,
    pub public_key: Option<String>,
}

/// Secure-shell parameters for a launched instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellConnection {
    pub user: String,
    pub host: String,
    pub port: u16,
}

/// Reachability of a launched instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub network_address: String,
    pub shell: ShellConnection,
    pub host_key_fingerprint: Option<String>,
}

#[async_trait]
pub trait ComputeLauncher: Send + Sync {
    fn mode(&self) -> LauncherMode;

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, LauncherError>;
}

/// Launcher that creates nothing.
pub struct SimulatedLauncher {
    ssh_user: String,
    ssh_port: u16,
}

impl SimulatedLauncher {
    pub fn new(config: &LauncherConfig) -> Self {
        Self {
            ssh_user: config.ssh_user.clone(),
            ssh_port: config.ssh_port,
        }
    }
}

#[async_trait]
impl ComputeLauncher for SimulatedLauncher {
    fn mode(&self) -> LauncherMode {
        LauncherMode::Simulated
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, LauncherError> {
        tracing::info!(container = %spec.name, "Simulated launch, no resources created");
        Ok(LaunchOutcome {
            network_address: SIMULATED_ADDRESS.to_string(),
            shell: ShellConnection {
                user: self.ssh_user.clone(),
                host: SIMULATED_ADDRESS.to_string(),
                port: self.ssh_port,
            },
            host_key_fingerprint: None,
        })
    }
}

/// One address as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedAddress {
    /// `inet` or `inet6`.
    pub family: String,
    /// `global`, `link`, `local`, ...
    pub scope: String,
    pub address: String,
}

impl ReportedAddress {
    pub fn new(family: &str, scope: &str, address: impl Into<String>) -> Self {
        Self {
            family: family.to_string(),
            scope: scope.to_string(),
            address: address.into(),
        }
    }
}

/// First global-scope address of `family`, in reported order.
pub fn select_address(addresses: &[ReportedAddress], family: AddressFamily) -> Option<String> {
    addresses
        .iter()
        .find(|a| a.family == family.as_str() && a.scope == "global")
        .map(|a| a.address.clone())
}

/// Create and inspect commands of a real compute backend.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Create and start the instance.
    async fn create(&self, spec: &LaunchSpec) -> Result<(), LauncherError>;

    /// Addresses currently reported for the instance. Empty while it boots.
    async fn addresses(&self, name: &str) -> Result<Vec<ReportedAddress>, LauncherError>;

    /// SSH host key fingerprint, if the backend can read it.
    async fn host_key_fingerprint(&self, name: &str) -> Result<Option<String>, LauncherError>;
}

/// Real-mode launcher over any [`ComputeBackend`].
pub struct BackendLauncher<B> {
    backend: B,
    mode: LauncherMode,
    address_family: AddressFamily,
    address_timeout: Duration,
    poll_interval: Duration,
    ssh_user: String,
    ssh_port: u16,
}

impl<B: ComputeBackend> BackendLauncher<B> {
    pub fn new(backend: B, config: &LauncherConfig) -> Self {
        Self {
            backend,
            mode: config.mode,
            address_family: config.address_family,
            address_timeout: config.address_timeout,
            poll_interval: config.poll_interval,
            ssh_user: config.ssh_user.clone(),
            ssh_port: config.ssh_port,
        }
    }

    async fn poll_address(&self, name: &str) -> Result<String, LauncherError> {
        loop {
            let addresses = self.backend.addresses(name).await?;
            if let Some(address) = select_address(&addresses, self.address_family) {
                return Ok(address);
            }
            tracing::debug!(
                container = %name,
                reported = addresses.len(),
                "No usable address yet"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_address(&self, name: &str) -> Result<String, LauncherError> {
        match tokio::time::timeout(self.address_timeout, self.poll_address(name)).await {
            Ok(result) => result,
            Err(_) => Err(LauncherError::AddressTimeout {
                name: name.to_string(),
                waited: self.address_timeout,
            }),
        }
    }
}

#[async_trait]
impl<B: ComputeBackend> ComputeLauncher for BackendLauncher<B> {
    fn mode(&self) -> LauncherMode {
        self.mode
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, LauncherError> {
        tracing::info!(
            container = %spec.name,
            backend = self.backend.kind(),
            image = %spec.image,
            "Creating instance"
        );
        self.backend.create(spec).await?;

        let address = self.wait_for_address(&spec.name).await?;

        let host_key_fingerprint = match self.backend.host_key_fingerprint(&spec.name).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                tracing::warn!(container = %spec.name, error = %e, "Host key lookup failed");
                None
            }
        };

        tracing::info!(container = %spec.name, address = %address, "Instance reachable");
        Ok(LaunchOutcome {
            network_address: address.clone(),
            shell: ShellConnection {
                user: self.ssh_user.clone(),
                host: address,
                port: self.ssh_port,
            },
            host_key_fingerprint,
        })
    }
}

/// Build the launcher selected by `config.mode`.
pub fn build_launcher(config: &LauncherConfig) -> Result<Arc<dyn ComputeLauncher>, LauncherError> {
    Ok(match config.mode {
        LauncherMode::Simulated => Arc::new(SimulatedLauncher::new(config)),
        LauncherMode::Lxd => Arc::new(BackendLauncher::new(
            LxdBackend::new(config.lxc_binary.clone()),
            config,
        )),
        LauncherMode::Docker => Arc::new(BackendLauncher::new(DockerBackend::connect()?, config)),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "lab-test0001".into(),
            image: "ubuntu:22.04".into(),
            dependencies: vec![Dependency::Node],
            public_key: None,
        }
    }

    /// Reports no address for the first `ready_after` polls.
    struct SlowBackend {
        polls: AtomicUsize,
        ready_after: usize,
        fail_create: bool,
    }

    #[async_trait]
    impl ComputeBackend for SlowBackend {
        fn kind(&self) -> &'static str {
            "slow"
        }

        async fn create(&self, spec: &LaunchSpec) -> Result<(), LauncherError> {
            if self.fail_create {
                return Err(LauncherError::CommandFailed {
                    name: spec.name.clone(),
                    reason: "Error: image not found".into(),
                });
            }
            Ok(())
        }

        async fn addresses(&self, _name: &str) -> Result<Vec<ReportedAddress>, LauncherError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.ready_after {
                return Ok(vec![ReportedAddress::new("inet6", "link", "fe80::1")]);
            }
            Ok(vec![
                ReportedAddress::new("inet6", "global", "fd42::5"),
                ReportedAddress::new("inet", "global", "10.10.0.5"),
            ])
        }

        async fn host_key_fingerprint(&self, _name: &str) -> Result<Option<String>, LauncherError> {
            Err(LauncherError::InvalidOutput {
                name: "lab-test0001".into(),
                reason: "no key".into(),
            })
        }
    }

    fn fast_config() -> LauncherConfig {
        LauncherConfig {
            mode: LauncherMode::Lxd,
            address_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            ..LauncherConfig::default()
        }
    }

    #[test]
    fn selects_first_global_address_of_family() {
        let addresses = vec![
            ReportedAddress::new("inet", "local", "127.0.0.1"),
            ReportedAddress::new("inet6", "global", "fd42::1"),
            ReportedAddress::new("inet", "global", "10.0.0.2"),
            ReportedAddress::new("inet", "global", "10.0.0.3"),
        ];
        assert_eq!(
            select_address(&addresses, AddressFamily::Inet).as_deref(),
            Some("10.0.0.2")
        );
        assert_eq!(
            select_address(&addresses, AddressFamily::Inet6).as_deref(),
            Some("fd42::1")
        );
        assert_eq!(select_address(&addresses[..1], AddressFamily::Inet), None);
    }

    #[tokio::test]
    async fn simulated_launch_returns_loopback() {
        let launcher = SimulatedLauncher::new(&LauncherConfig::default());
        let outcome = launcher.launch(&spec()).await.unwrap();
        assert_eq!(outcome.network_address, SIMULATED_ADDRESS);
        assert_eq!(outcome.shell.host, SIMULATED_ADDRESS);
        assert_eq!(outcome.shell.user, "ubuntu");
        assert_eq!(outcome.shell.port, 22);
        assert_eq!(launcher.mode(), LauncherMode::Simulated);
    }

    #[tokio::test]
    async fn backend_launch_polls_until_address_appears() {
        let launcher = BackendLauncher::new(
            SlowBackend {
                polls: AtomicUsize::new(0),
                ready_after: 3,
                fail_create: false,
            },
            &fast_config(),
        );
        let outcome = launcher.launch(&spec()).await.unwrap();
        assert_eq!(outcome.network_address, "10.10.0.5");
        assert_eq!(outcome.shell.host, "10.10.0.5");
        assert!(outcome.host_key_fingerprint.is_none());
        assert_eq!(launcher.backend.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn backend_launch_times_out() {
        let launcher = BackendLauncher::new(
            SlowBackend {
                polls: AtomicUsize::new(0),
                ready_after: usize::MAX,
                fail_create: false,
            },
            &fast_config(),
        );
        let err = launcher.launch(&spec()).await.unwrap_err();
        assert!(matches!(err, LauncherError::AddressTimeout { .. }));
    }

    #[tokio::test]
    async fn create_failure_carries_backend_text() {
        let launcher = BackendLauncher::new(
            SlowBackend {
                polls: AtomicUsize::new(0),
                ready_after: 0,
                fail_create: true,
            },
            &fast_config(),
        );
        let err = launcher.launch(&spec()).await.unwrap_err();
        let provision = err.into_provision_error("lab-test0001");
        assert!(provision.to_string().contains("image not found"));
        assert_eq!(launcher.backend.polls.load(Ordering::SeqCst), 0);
    }
}
