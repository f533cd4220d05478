//! Remote session gateway.
//!
//! One WebSocket per client, each carrying exactly one interactive shell.
//! [`init`] returns a [`GatewayHandle`] that owns the session registry and
//! a shutdown signal, so independent gateways can coexist in one process.
//! Channels share nothing but the token verifier, the container directory
//! and the registry; a failure on one never reaches another.

pub mod directory;
pub mod frames;
pub mod registry;
pub mod session;
pub mod shell;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::auth::TokenVerifier;
use crate::config::GatewayConfig;

pub use directory::{
    ContainerDirectory, ContainerTarget, StoreContainerDirectory, authorize, ensure_running,
};
pub use frames::{ClientFrame, CloseCode, ServerFrame};
pub use registry::{SessionInfo, SessionRegistry};
pub use session::{Session, SessionContext, SessionState, Step};
pub use shell::{LocalShellConnector, SecureShellConnector, ShellConnector, ShellEvent, ShellSession};

/// Buffered shell events per channel before the shell's readers wait.
const EVENT_BUFFER: usize = 256;

/// Initialize a gateway with the connector `config` selects: a local shell
/// when `local_fallback` is set, the secure-shell backend otherwise.
pub fn init(
    config: GatewayConfig,
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn ContainerDirectory>,
) -> GatewayHandle {
    let connector: Arc<dyn ShellConnector> = if config.local_fallback {
        tracing::warn!(shell = %config.local_shell, "Gateway using local shell fallback");
        Arc::new(LocalShellConnector::new(config.local_shell.clone()))
    } else {
        Arc::new(SecureShellConnector::new())
    };
    init_with_connector(config, verifier, directory, connector)
}

/// Initialize a gateway with an explicit shell connector.
pub fn init_with_connector(
    config: GatewayConfig,
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn ContainerDirectory>,
    connector: Arc<dyn ShellConnector>,
) -> GatewayHandle {
    tracing::info!(
        backend = connector.kind(),
        path = %config.ws_path,
        max_sessions = config.max_sessions,
        "Session gateway initialized"
    );
    let registry = SessionRegistry::new(config.max_sessions);
    let (shutdown_tx, _) = watch::channel(false);
    GatewayHandle {
        inner: Arc::new(GatewayInner {
            ctx: Arc::new(SessionContext {
                verifier,
                directory,
                connector,
                registry,
            }),
            config,
            shutdown_tx,
        }),
    }
}

struct GatewayInner {
    config: GatewayConfig,
    ctx: Arc<SessionContext>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to one initialized gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    inner: Arc<GatewayInner>,
}

impl GatewayHandle {
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.ctx.registry
    }

    /// Router serving the session channel at `config.ws_path`.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.config.ws_path, get(ws_handler))
            .with_state(self.clone())
    }

    /// Register a new session, or `None` when the gateway is at capacity.
    /// The receiver carries the session's shell events.
    pub async fn open_session(&self) -> Option<(Session, mpsc::Receiver<ShellEvent>)> {
        let id = self.registry().accept().await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Some((Session::new(id, self.inner.ctx.clone(), tx), rx))
    }

    /// Ask every open channel to close.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }
}

async fn ws_handler(State(handle): State<GatewayHandle>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_channel(handle, socket))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match frame.to_json() {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping unencodable frame");
            true
        }
    }
}

async fn send_close(socket: &mut WebSocket, code: CloseCode) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: code.code(),
            reason: code.reason().into(),
        })))
        .await;
}

/// Drive one channel until either side closes it.
async fn run_channel(handle: GatewayHandle, mut socket: WebSocket) {
    let Some((mut session, mut events)) = handle.open_session().await else {
        tracing::warn!("Rejecting channel, gateway at capacity");
        send_close(&mut socket, CloseCode::OverCapacity).await;
        return;
    };
    let session_id = session.id();
    tracing::info!(session_id = %session_id, "Channel opened");

    let mut shutdown = handle.inner.shutdown_tx.subscribe();
    let idle_timeout = handle.inner.config.idle_timeout;
    let mut deadline = idle_timeout.map(|d| Instant::now() + d);

    if send_frame(&mut socket, &session.welcome()).await && !handle.is_shut_down() {
        loop {
            let idle = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let step = tokio::select! {
                message = socket.recv() => match message {
                    Some(Ok(Message::Text(text))) => {
                        deadline = idle_timeout.map(|d| Instant::now() + d);
                        session.handle_text(text.as_str()).await
                    }
                    Some(Ok(Message::Binary(_))) => Step::frame(ServerFrame::error(
                        "protocol_error",
                        "binary messages are not supported",
                    )),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "Channel read failed");
                        break;
                    }
                },
                Some(event) = events.recv() => session.on_shell_event(event).await,
                _ = idle => {
                    tracing::info!(session_id = %session_id, "Closing idle channel");
                    session.shutdown().await;
                    Step::close(ServerFrame::closing("idle timeout"), CloseCode::IdleTimeout)
                }
                Ok(()) = shutdown.changed() => {
                    session.shutdown().await;
                    Step::close(ServerFrame::closing("gateway shutting down"), CloseCode::Normal)
                }
            };

            let mut open = true;
            for frame in &step.frames {
                if !send_frame(&mut socket, frame).await {
                    open = false;
                    break;
                }
            }
            if let Some(code) = step.close {
                send_close(&mut socket, code).await;
                break;
            }
            if !open {
                break;
            }
        }
    }

    session.shutdown().await;
    handle.registry().release(session_id).await;
    tracing::info!(session_id = %session_id, "Channel closed");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::testing::{RecordingShellConnector, StaticDirectory, test_verifier};

    fn handle(max_sessions: usize) -> GatewayHandle {
        let config = GatewayConfig {
            max_sessions,
            ..GatewayConfig::default()
        };
        init_with_connector(
            config,
            Arc::new(test_verifier()),
            Arc::new(StaticDirectory::new(vec![])),
            Arc::new(RecordingShellConnector::new()),
        )
    }

    #[tokio::test]
    async fn handles_are_independent() {
        let a = handle(1);
        let b = handle(1);
        let (first, _rx) = a.open_session().await.unwrap();
        assert!(a.open_session().await.is_none());
        assert!(b.open_session().await.is_some());

        a.registry().release(first.id()).await;
        assert!(a.open_session().await.is_some());
    }

    #[tokio::test]
    async fn shutdown_is_per_handle() {
        let a = handle(4);
        let b = handle(4);
        a.shutdown();
        assert!(a.is_shut_down());
        assert!(!b.is_shut_down());
    }

    #[tokio::test]
    async fn plain_get_on_channel_path_is_not_upgraded() {
        let response = handle(4)
            .router()
            .oneshot(
                Request::builder()
                    .uri("/ws/terminal")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
        assert!(!response.status().is_success());
    }
}
