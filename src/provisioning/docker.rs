//! Docker backend over the Engine API (`bollard`).
//!
//! The lab image's entrypoint reads the dependency list, package names and
//! SSH key from its environment.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config, CreateContainerOptions, InspectContainerOptions};

use crate::error::LauncherError;
use crate::provisioning::dependencies::package_names;
use crate::provisioning::launcher::{ComputeBackend, LaunchSpec, ReportedAddress};

/// Label carrying the external identifier on every lab container.
pub const NAME_LABEL: &str = "labforge.name";

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect using the platform's local defaults (socket or `DOCKER_HOST`).
    pub fn connect() -> Result<Self, LauncherError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            LauncherError::CommandFailed {
                name: "docker".to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self::new(docker))
    }
}

/// Environment handed to the lab image.
pub fn container_env(spec: &LaunchSpec) -> Vec<String> {
    let deps: Vec<&str> = spec.dependencies.iter().map(|d| d.as_str()).collect();
    let mut env = vec![
        format!("LAB_NAME={}", spec.name),
        format!("LAB_DEPENDENCIES={}", deps.join(",")),
        format!("LAB_PACKAGES={}", package_names(&spec.dependencies).join(" ")),
    ];
    if let Some(key) = spec.public_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        env.push(format!("LAB_SSH_PUBLIC_KEY={key}"));
    }
    env
}

#[async_trait]
impl ComputeBackend for DockerBackend {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<(), LauncherError> {
        let failed = |reason: String| LauncherError::CommandFailed {
            name: spec.name.clone(),
            reason,
        };

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: Some(container_env(spec)),
            labels: Some(HashMap::from([(NAME_LABEL.to_string(), spec.name.clone())])),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| failed(e.to_string()))?;

        self.docker
            .start_container::<String>(&spec.name, None)
            .await
            .map_err(|e| failed(format!("failed to start container: {}", e)))?;

        Ok(())
    }

    async fn addresses(&self, name: &str) -> Result<Vec<ReportedAddress>, LauncherError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| LauncherError::CommandFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let mut networks: Vec<_> = info
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default()
            .into_iter()
            .collect();
        networks.sort_by(|a, b| a.0.cmp(&b.0));

        let mut addresses = Vec::new();
        for (_, endpoint) in networks {
            if let Some(ip) = endpoint.ip_address.filter(|ip| !ip.is_empty()) {
                addresses.push(ReportedAddress::new("inet", "global", ip));
            }
            if let Some(ip) = endpoint.global_ipv6_address.filter(|ip| !ip.is_empty()) {
                addresses.push(ReportedAddress::new("inet6", "global", ip));
            }
        }
        Ok(addresses)
    }

    async fn host_key_fingerprint(&self, _name: &str) -> Result<Option<String>, LauncherError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::dependencies::Dependency;

    #[test]
    fn env_carries_dependencies_and_key() {
        let spec = LaunchSpec {
            name: "lab-d0cker01".into(),
            image: "labforge/ubuntu-lab:22.04".into(),
            dependencies: vec![Dependency::Postgresql, Dependency::Nginx],
            public_key: Some("ssh-ed25519 AAAA key@host\n".into()),
        };
        let env = container_env(&spec);
        assert_eq!(
            env,
            vec![
                "LAB_NAME=lab-d0cker01",
                "LAB_DEPENDENCIES=postgresql,nginx",
                "LAB_PACKAGES=postgresql postgresql-contrib nginx",
                "LAB_SSH_PUBLIC_KEY=ssh-ed25519 AAAA key@host",
            ]
        );
    }

    #[test]
    fn env_without_key() {
        let spec = LaunchSpec {
            name: "lab-d0cker02".into(),
            image: "img".into(),
            dependencies: vec![],
            public_key: Some("   ".into()),
        };
        let env = container_env(&spec);
        assert_eq!(env.len(), 3);
        assert_eq!(env[1], "LAB_DEPENDENCIES=");
    }
}
