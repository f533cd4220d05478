//! Shell backends a session can attach.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::gateway::directory::ContainerTarget;

const READ_CHUNK: usize = 4096;

/// Something the attached process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// A chunk from one of the output streams.
    Output(String),
    /// The process ended. Sent after all of its output.
    Exited(Option<i32>),
}

/// An attached interactive process, owned by exactly one session.
#[async_trait]
pub trait ShellSession: Send {
    fn backend(&self) -> &'static str;

    /// Whether [`resize`](Self::resize) reaches a real pty.
    fn supports_resize(&self) -> bool;

    async fn write_input(&mut self, data: &[u8]) -> Result<(), GatewayError>;

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), GatewayError>;

    /// Stop the process. Calling it again is a no-op.
    async fn terminate(&mut self);
}

#[async_trait]
pub trait ShellConnector: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Start a shell for `target`, reporting its output on `events`.
    async fn attach(
        &self,
        target: &ContainerTarget,
        events: mpsc::Sender<ShellEvent>,
    ) -> Result<Box<dyn ShellSession>, GatewayError>;
}

/// Development backend: a local shell process on piped stdio.
pub struct LocalShellConnector {
    program: String,
}

impl LocalShellConnector {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ShellConnector for LocalShellConnector {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn attach(
        &self,
        target: &ContainerTarget,
        events: mpsc::Sender<ShellEvent>,
    ) -> Result<Box<dyn ShellSession>, GatewayError> {
        let mut child = Command::new(&self.program)
            .env("TERM", "dumb")
            .env("LAB_CONTAINER", &target.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Spawn(format!("{}: {}", self.program, e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::Spawn("stderr not captured".to_string()))?;

        let stdout_task = relay_output(stdout, events.clone());
        let stderr_task = relay_output(stderr, events.clone());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            // A dropped sender counts as a kill request too.
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let code = match exited {
                Some(status) => status.ok().and_then(|s| s.code()),
                None => {
                    let _ = child.kill().await;
                    None
                }
            };
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = events.send(ShellEvent::Exited(code)).await;
        });

        tracing::debug!(container = %target.name, program = %self.program, "Local shell attached");
        Ok(Box::new(LocalShellSession {
            stdin,
            kill: Some(kill_tx),
        }))
    }
}

/// Forward one output stream as [`ShellEvent::Output`] chunks until EOF.
fn relay_output<R>(mut reader: R, events: mpsc::Sender<ShellEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut decoder = Utf8Decoder::default();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Some(chunk) = decoder.push(&buf[..n]) else {
                        continue;
                    };
                    if events.send(ShellEvent::Output(chunk)).await.is_err() {
                        return;
                    }
                }
            }
        }
        if let Some(rest) = decoder.finish() {
            let _ = events.send(ShellEvent::Output(rest)).await;
        }
    })
}

/// Decodes a byte stream as UTF-8 across read boundaries.
///
/// A character split between two reads is held back until its remaining
/// bytes arrive. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete character at the end: wait for more.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        (!out.is_empty()).then_some(out)
    }

    /// Whatever is still held back, decoded lossily.
    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| String::from_utf8_lossy(&self.pending).into_owned())
    }
}

struct LocalShellSession {
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl ShellSession for LocalShellSession {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn supports_resize(&self) -> bool {
        false
    }

    async fn write_input(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| GatewayError::Io("shell input is closed".to_string()))?;
        stdin
            .write_all(data)
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        stdin.flush().await.map_err(|e| GatewayError::Io(e.to_string()))
    }

    async fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn terminate(&mut self) {
        self.stdin.take();
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Production backend: a secure shell to the container's address.
///
/// Only the contract lives here. Until a client is wired in, every attach
/// reports the backend as unavailable, so deployments without
/// `GATEWAY_LOCAL_FALLBACK` fail closed.
#[derive(Default)]
pub struct SecureShellConnector;

impl SecureShellConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ShellConnector for SecureShellConnector {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn attach(
        &self,
        target: &ContainerTarget,
        _events: mpsc::Sender<ShellEvent>,
    ) -> Result<Box<dyn ShellSession>, GatewayError> {
        let address = target.address.as_deref().ok_or_else(|| {
            GatewayError::BackendUnavailable(format!("container {} has no address yet", target.name))
        })?;
        Err(GatewayError::BackendUnavailable(format!(
            "secure shell to {address} is not configured on this gateway"
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::provisioning::ContainerStatus;

    fn target() -> ContainerTarget {
        ContainerTarget {
            id: 1,
            name: "lab-local01".into(),
            owner_id: Some(1),
            address: None,
            status: ContainerStatus::Running,
        }
    }

    async fn collect_until_exit(rx: &mut mpsc::Receiver<ShellEvent>) -> (String, Option<i32>) {
        let mut out = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(ShellEvent::Output(chunk))) => out.push_str(&chunk),
                Ok(Some(ShellEvent::Exited(code))) => return (out, code),
                Ok(None) | Err(_) => panic!("shell never exited; output so far: {out:?}"),
            }
        }
    }

    #[tokio::test]
    async fn local_shell_echoes_and_exits() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut shell = LocalShellConnector::new("/bin/sh")
            .attach(&target(), tx)
            .await
            .unwrap();
        assert!(!shell.supports_resize());

        shell.write_input(b"echo hi\n").await.unwrap();
        shell.write_input(b"echo oops 1>&2\n").await.unwrap();
        shell.write_input(b"exit 3\n").await.unwrap();

        let (out, code) = collect_until_exit(&mut rx).await;
        assert!(out.contains("hi"));
        assert!(out.contains("oops"));
        assert_eq!(code, Some(3));
    }

    #[test]
    fn split_characters_are_reassembled() {
        let text = "caf\u{e9} \u{1f980}";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        for byte in bytes {
            if let Some(chunk) = decoder.push(std::slice::from_ref(byte)) {
                out.push_str(&chunk);
            }
        }
        assert_eq!(decoder.finish(), None);
        assert_eq!(out, text);
    }

    #[test]
    fn invalid_bytes_and_truncated_tail_are_replaced() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(b"a\xffb").as_deref(), Some("a\u{fffd}b"));
        assert_eq!(decoder.push(b"\xc3"), None);
        assert_eq!(decoder.finish().as_deref(), Some("\u{fffd}"));
    }

    #[tokio::test]
    async fn multibyte_output_survives_read_boundary() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut shell = LocalShellConnector::new("/bin/sh")
            .attach(&target(), tx)
            .await
            .unwrap();
        // 4095 spaces put the two bytes of U+00E9 on either side of a read.
        shell
            .write_input(b"printf '%4095s\\303\\251END' ''; exit 0\n")
            .await
            .unwrap();

        let (out, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, Some(0));
        assert!(out.ends_with("\u{e9}END"));
        assert!(!out.contains(char::REPLACEMENT_CHARACTER));
        assert_eq!(out.len(), 4095 + 2 + 3);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut shell = LocalShellConnector::new("/bin/sh")
            .attach(&target(), tx)
            .await
            .unwrap();
        shell.terminate().await;
        shell.terminate().await;

        collect_until_exit(&mut rx).await;
        assert!(shell.write_input(b"echo late\n").await.is_err());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let (tx, _rx) = mpsc::channel(1);
        let err = LocalShellConnector::new("/nonexistent/shell")
            .attach(&target(), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Spawn(_)));
    }

    #[tokio::test]
    async fn secure_shell_is_unavailable() {
        let (tx, _rx) = mpsc::channel(1);
        let err = SecureShellConnector::new()
            .attach(&target(), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::BackendUnavailable(_)));
    }
}
