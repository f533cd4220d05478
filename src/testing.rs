//! Fakes shared by unit and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;

use crate::auth::HmacTokenVerifier;
use crate::config::LauncherMode;
use crate::error::{GatewayError, LauncherError};
use crate::gateway::{ContainerDirectory, ContainerTarget, ShellConnector, ShellEvent, ShellSession};
use crate::provisioning::{ComputeLauncher, ContainerRef, LaunchOutcome, LaunchSpec};

/// Secret used by [`test_verifier`].
pub const TEST_SECRET: &str = "labforge-test-secret-0123456789abcdef";

/// Verifier over [`TEST_SECRET`].
pub fn test_verifier() -> HmacTokenVerifier {
    HmacTokenVerifier::new(SecretString::from(TEST_SECRET))
}

/// Directory over a fixed list of targets.
pub struct StaticDirectory {
    targets: Vec<ContainerTarget>,
}

impl StaticDirectory {
    pub fn new(targets: Vec<ContainerTarget>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl ContainerDirectory for StaticDirectory {
    async fn resolve(&self, container: &ContainerRef) -> Result<Option<ContainerTarget>, GatewayError> {
        Ok(self
            .targets
            .iter()
            .find(|t| match container {
                ContainerRef::Id(id) => t.id == *id,
                ContainerRef::Name(name) => &t.name == name,
            })
            .cloned())
    }
}

#[derive(Default)]
struct Recorded {
    attaches: usize,
    inputs: Vec<String>,
    resizes: Vec<(u16, u16)>,
}

/// Connector whose shells record what reaches them and count terminations.
pub struct RecordingShellConnector {
    pub terminations: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingShellConnector {
    pub fn new() -> Self {
        Self {
            terminations: Arc::new(AtomicUsize::new(0)),
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    pub fn attaches(&self) -> usize {
        self.recorded.lock().map(|r| r.attaches).unwrap_or(0)
    }

    pub fn inputs(&self) -> Vec<String> {
        self.recorded
            .lock()
            .map(|r| r.inputs.clone())
            .unwrap_or_default()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.recorded
            .lock()
            .map(|r| r.resizes.clone())
            .unwrap_or_default()
    }
}

impl Default for RecordingShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellConnector for RecordingShellConnector {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn attach(
        &self,
        _target: &ContainerTarget,
        _events: mpsc::Sender<ShellEvent>,
    ) -> Result<Box<dyn ShellSession>, GatewayError> {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.attaches += 1;
        }
        Ok(Box::new(RecordingShell {
            terminations: self.terminations.clone(),
            recorded: self.recorded.clone(),
            terminated: false,
        }))
    }
}

struct RecordingShell {
    terminations: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Recorded>>,
    terminated: bool,
}

#[async_trait]
impl ShellSession for RecordingShell {
    fn backend(&self) -> &'static str {
        "recording"
    }

    fn supports_resize(&self) -> bool {
        true
    }

    async fn write_input(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        if self.terminated {
            return Err(GatewayError::Io("shell input is closed".to_string()));
        }
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.inputs.push(String::from_utf8_lossy(data).into_owned());
        }
        Ok(())
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), GatewayError> {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.resizes.push((cols, rows));
        }
        Ok(())
    }

    async fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Launcher that always fails with the given backend diagnostic.
pub struct FailingLauncher {
    reason: String,
}

impl FailingLauncher {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ComputeLauncher for FailingLauncher {
    fn mode(&self) -> LauncherMode {
        LauncherMode::Lxd
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, LauncherError> {
        Err(LauncherError::CommandFailed {
            name: spec.name.clone(),
            reason: self.reason.clone(),
        })
    }
}
