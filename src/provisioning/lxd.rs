//! LXD backend driven through the `lxc` command-line client.
//!
//! Packages and the SSH key travel as cloud-init user-data; installing
//! them is the instance's own business.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::LauncherError;
use crate::provisioning::dependencies::{Dependency, package_names};
use crate::provisioning::launcher::{ComputeBackend, LaunchSpec, ReportedAddress};

const HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_ed25519_key.pub";

pub struct LxdBackend {
    binary: String,
}

impl LxdBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `lxc` with `args` and return stdout, or the diagnostic text on
    /// a non-zero exit.
    async fn run(&self, name: &str, args: &[&str]) -> Result<String, LauncherError> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LauncherError::CommandFailed {
                name: name.to_string(),
                reason: format!("failed to run {}: {}", self.binary, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(LauncherError::CommandFailed {
                name: name.to_string(),
                reason: format!("{} {} exited with {}: {}", self.binary, args[0], output.status, reason),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ComputeBackend for LxdBackend {
    fn kind(&self) -> &'static str {
        "lxd"
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<(), LauncherError> {
        let user_data = format!(
            "user.user-data={}",
            cloud_init_user_data(&spec.dependencies, spec.public_key.as_deref())
        );
        self.run(
            &spec.name,
            &["launch", &spec.image, &spec.name, "--config", &user_data],
        )
        .await?;
        Ok(())
    }

    async fn addresses(&self, name: &str) -> Result<Vec<ReportedAddress>, LauncherError> {
        let stdout = self.run(name, &["list", name, "--format", "json"]).await?;
        parse_addresses(name, &stdout)
    }

    async fn host_key_fingerprint(&self, name: &str) -> Result<Option<String>, LauncherError> {
        let stdout = self
            .run(name, &["exec", name, "--", "ssh-keygen", "-lf", HOST_KEY_PATH])
            .await?;
        Ok(parse_fingerprint(&stdout))
    }
}

/// cloud-init document installing the dependency packages and authorizing
/// the key for the default user.
pub fn cloud_init_user_data(deps: &[Dependency], public_key: Option<&str>) -> String {
    let mut doc = String::from("#cloud-config\n");
    let packages = package_names(deps);
    if !packages.is_empty() {
        doc.push_str("package_update: true\npackages:\n");
        for package in packages {
            doc.push_str("  - ");
            doc.push_str(package);
            doc.push('\n');
        }
    }
    if let Some(key) = public_key.map(str::trim).filter(|k| !k.is_empty()) {
        // A JSON string is a valid YAML double-quoted scalar.
        let quoted = serde_json::to_string(key).unwrap_or_default();
        doc.push_str("ssh_authorized_keys:\n  - ");
        doc.push_str(&quoted);
        doc.push('\n');
    }
    doc
}

#[derive(Debug, Deserialize)]
struct LxcInstance {
    name: String,
    #[serde(default)]
    state: Option<LxcState>,
}

#[derive(Debug, Deserialize)]
struct LxcState {
    #[serde(default)]
    network: Option<BTreeMap<String, LxcNetwork>>,
}

#[derive(Debug, Deserialize)]
struct LxcNetwork {
    #[serde(default)]
    addresses: Vec<LxcAddress>,
}

#[derive(Debug, Deserialize)]
struct LxcAddress {
    family: String,
    address: String,
    #[serde(default)]
    scope: String,
}

/// Prefixes of interfaces created inside the instance by software running
/// there (container engines, VPNs), as opposed to the NIC LXD attached.
const VIRTUAL_IFACE_PREFIXES: &[&str] = &[
    "docker", "br-", "virbr", "lxdbr", "veth", "cni", "flannel", "cali", "tun", "tap", "wg",
];

/// 0 for the NIC LXD attached (`eth*`/`en*`), 2 for virtual interfaces,
/// 1 for anything else.
fn iface_rank(iface: &str) -> u8 {
    if iface.starts_with("eth") || iface.starts_with("en") {
        0
    } else if VIRTUAL_IFACE_PREFIXES.iter().any(|p| iface.starts_with(p)) {
        2
    } else {
        1
    }
}

/// Addresses of instance `name` from `lxc list --format json` output,
/// loopback interface excluded. `lxc list` filters by prefix, so the
/// instance is matched by exact name.
///
/// JSON objects carry no order LXD guarantees, so interfaces are ordered by
/// [`iface_rank`] and then by name: the attached NIC's addresses come
/// before those of bridges such as `docker0` created inside the lab.
pub fn parse_addresses(name: &str, stdout: &str) -> Result<Vec<ReportedAddress>, LauncherError> {
    let instances: Vec<LxcInstance> =
        serde_json::from_str(stdout).map_err(|e| LauncherError::InvalidOutput {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    let Some(network) = instances
        .into_iter()
        .find(|i| i.name == name)
        .and_then(|i| i.state)
        .and_then(|s| s.network)
    else {
        return Ok(Vec::new());
    };

    let mut interfaces: Vec<_> = network
        .into_iter()
        .filter(|(iface, _)| iface != "lo")
        .collect();
    interfaces.sort_by_key(|(iface, _)| iface_rank(iface));

    Ok(interfaces
        .into_iter()
        .flat_map(|(_, net)| net.addresses)
        .map(|a| ReportedAddress {
            family: a.family,
            scope: a.scope,
            address: a.address,
        })
        .collect())
}

/// Fingerprint field of `ssh-keygen -l` output
/// (`256 SHA256:abc... root@host (ED25519)`).
pub fn parse_fingerprint(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)
        .filter(|f| f.contains(':'))
        .map(str::to_string)
}
