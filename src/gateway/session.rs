//! Per-channel session state machine.
//!
//! ```text
//! Unauthenticated --connect ok--> Idle --attach ok--> Active --close/exit--> Closed
//!        |                          |
//!        +-------connect with bad token: error + close 4401------> Closed
//! ```
//!
//! A frame the current state does not accept yields an `error` frame and
//! leaves the state alone. Only an authentication failure closes the
//! channel on the gateway's initiative.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{Claims, TokenVerifier};
use crate::error::{AuthError, GatewayError};
use crate::gateway::directory::{ContainerDirectory, ContainerTarget, authorize, ensure_running};
use crate::gateway::frames::{ClientFrame, CloseCode, ServerFrame, parse_client_frame};
use crate::gateway::registry::SessionRegistry;
use crate::gateway::shell::{ShellConnector, ShellEvent, ShellSession};
use crate::provisioning::ContainerRef;

/// Collaborators shared by every session of one gateway.
pub struct SessionContext {
    pub verifier: Arc<dyn TokenVerifier>,
    pub directory: Arc<dyn ContainerDirectory>,
    pub connector: Arc<dyn ShellConnector>,
    pub registry: SessionRegistry,
}

pub enum SessionState {
    Unauthenticated,
    Idle {
        claims: Claims,
    },
    Active {
        claims: Claims,
        target: ContainerTarget,
        shell: Box<dyn ShellSession>,
    },
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Idle { .. } => "idle",
            Self::Active { .. } => "active",
            Self::Closed => "closed",
        }
    }
}

/// Frames to send in reply to one event, and whether to close afterwards.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub frames: Vec<ServerFrame>,
    pub close: Option<CloseCode>,
}

impl Step {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn frame(frame: ServerFrame) -> Self {
        Self {
            frames: vec![frame],
            close: None,
        }
    }

    pub fn close(frame: ServerFrame, code: CloseCode) -> Self {
        Self {
            frames: vec![frame],
            close: Some(code),
        }
    }

    fn error(err: &GatewayError) -> Self {
        Self::frame(ServerFrame::from_error(err))
    }

    fn rejected(kind: &str, state: &SessionState) -> Self {
        Self::frame(ServerFrame::error(
            "invalid_state",
            format!("{kind} is not accepted while the session is {}", state.name()),
        ))
    }
}

pub struct Session {
    id: Uuid,
    ctx: Arc<SessionContext>,
    events: mpsc::Sender<ShellEvent>,
    state: SessionState,
}

impl Session {
    /// `events` is where an attached shell reports output; the channel
    /// loop feeds what arrives there back through [`on_shell_event`](Self::on_shell_event).
    pub fn new(id: Uuid, ctx: Arc<SessionContext>, events: mpsc::Sender<ShellEvent>) -> Self {
        Self {
            id,
            ctx,
            events,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn welcome(&self) -> ServerFrame {
        ServerFrame::Welcome {
            session_id: self.id.to_string(),
            message: "send a connect frame with a token and containerId".to_string(),
        }
    }

    /// Handle one raw text message from the client.
    pub async fn handle_text(&mut self, text: &str) -> Step {
        match parse_client_frame(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "Rejected client frame");
                if matches!(self.state, SessionState::Closed) {
                    Step::none()
                } else {
                    Step::error(&e)
                }
            }
        }
    }

    pub async fn handle_frame(&mut self, frame: ClientFrame) -> Step {
        tracing::debug!(
            session_id = %self.id,
            frame = frame.kind(),
            state = self.state.name(),
            "Client frame"
        );
        match frame {
            ClientFrame::Connect {
                token,
                container_id,
            } => self.connect(&token, &container_id).await,
            ClientFrame::Input { data } => match &mut self.state {
                SessionState::Active { shell, .. } => match shell.write_input(data.as_bytes()).await {
                    Ok(()) => Step::none(),
                    Err(e) => Step::error(&e),
                },
                other => Step::rejected("input", other),
            },
            ClientFrame::Resize { cols, rows } => match &mut self.state {
                SessionState::Active { shell, .. } => {
                    if !shell.supports_resize() {
                        return Step::frame(ServerFrame::info(format!(
                            "the {} backend has no pty; resize ignored",
                            shell.backend()
                        )));
                    }
                    match shell.resize(cols, rows).await {
                        Ok(()) => Step::none(),
                        Err(e) => Step::error(&e),
                    }
                }
                other => Step::rejected("resize", other),
            },
            ClientFrame::Close => {
                if matches!(self.state, SessionState::Closed) {
                    return Step::none();
                }
                self.shutdown().await;
                Step::close(ServerFrame::closing("closed by client"), CloseCode::Normal)
            }
        }
    }

    async fn connect(&mut self, token: &str, container: &ContainerRef) -> Step {
        match self.state {
            SessionState::Unauthenticated | SessionState::Idle { .. } => {}
            ref other => return Step::rejected("connect", other),
        }

        let verified = if token.trim().is_empty() {
            Err(AuthError::MissingToken)
        } else {
            self.ctx.verifier.verify(token)
        };
        let claims = match verified {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Session authentication failed");
                self.state = SessionState::Closed;
                return Step::close(
                    ServerFrame::from_error(&GatewayError::Auth(e)),
                    CloseCode::AuthFailed,
                );
            }
        };
        self.state = SessionState::Idle {
            claims: claims.clone(),
        };

        let target = match self.ctx.directory.resolve(container).await {
            Ok(Some(target)) => target,
            Ok(None) => return Step::error(&GatewayError::ContainerNotFound(container.to_string())),
            Err(e) => return Step::error(&e),
        };
        if let Err(e) = authorize(&claims, &target) {
            tracing::warn!(
                session_id = %self.id,
                user = claims.user_id(),
                container = %target.name,
                "Attach denied"
            );
            return Step::error(&e);
        }
        if let Err(e) = ensure_running(&target) {
            tracing::info!(session_id = %self.id, container = %target.name, error = %e, "Attach refused");
            return Step::error(&e);
        }

        let shell = match self.ctx.connector.attach(&target, self.events.clone()).await {
            Ok(shell) => shell,
            Err(e) => {
                tracing::warn!(session_id = %self.id, container = %target.name, error = %e, "Attach failed");
                return Step::error(&e);
            }
        };

        let ready = ServerFrame::Ready {
            container_id: target.id,
            container_name: target.name.clone(),
            backend: shell.backend().to_string(),
            supports_resize: shell.supports_resize(),
        };
        self.ctx
            .registry
            .mark_attached(self.id, claims.user_id(), target.id, shell.backend())
            .await;
        tracing::info!(
            session_id = %self.id,
            user = claims.user_id(),
            container = %target.name,
            backend = shell.backend(),
            "Shell attached"
        );
        self.state = SessionState::Active {
            claims,
            target,
            shell,
        };
        Step::frame(ready)
    }

    /// Relay something the attached shell did.
    pub async fn on_shell_event(&mut self, event: ShellEvent) -> Step {
        if !matches!(self.state, SessionState::Active { .. }) {
            return Step::none();
        }
        match event {
            ShellEvent::Output(data) => Step::frame(ServerFrame::Data { data }),
            ShellEvent::Exited(code) => {
                self.shutdown().await;
                let reason = match code {
                    Some(code) => format!("shell exited with status {code}"),
                    None => "shell terminated".to_string(),
                };
                Step::close(ServerFrame::closing(reason), CloseCode::Normal)
            }
        }
    }

    /// Terminate any attached shell and move to `Closed`. Idempotent.
    pub async fn shutdown(&mut self) {
        if let SessionState::Active {
            mut shell, target, ..
        } = std::mem::replace(&mut self.state, SessionState::Closed)
        {
            shell.terminate().await;
            tracing::info!(session_id = %self.id, container = %target.name, "Shell detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::auth::HmacTokenVerifier;
    use crate::gateway::shell::LocalShellConnector;
    use crate::provisioning::ContainerStatus;
    use crate::testing::{RecordingShellConnector, StaticDirectory, test_verifier};

    fn target(id: i64, owner: i64) -> ContainerTarget {
        ContainerTarget {
            id,
            name: format!("lab-test{id:04}"),
            owner_id: Some(owner),
            address: Some("127.0.0.1".into()),
            status: ContainerStatus::Running,
        }
    }

    fn token(verifier: &HmacTokenVerifier, user: i64, role: &str) -> String {
        verifier
            .issue(&Claims::new(user, role, Duration::from_secs(300)))
            .unwrap()
    }

    fn connect_frame(token: &str, container: i64) -> String {
        serde_json::json!({"type": "connect", "token": token, "containerId": container}).to_string()
    }

    struct Fixture {
        session: Session,
        events: mpsc::Receiver<ShellEvent>,
        verifier: Arc<HmacTokenVerifier>,
        connector: Arc<RecordingShellConnector>,
    }

    fn fixture() -> Fixture {
        let verifier = Arc::new(test_verifier());
        let connector = Arc::new(RecordingShellConnector::new());
        let ctx = Arc::new(SessionContext {
            verifier: verifier.clone(),
            directory: Arc::new(StaticDirectory::new(vec![
                target(1, 42),
                target(2, 7),
                ContainerTarget {
                    status: ContainerStatus::Failed,
                    ..target(3, 42)
                },
            ])),
            connector: connector.clone(),
            registry: SessionRegistry::new(8),
        });
        let (tx, events) = mpsc::channel(16);
        Fixture {
            session: Session::new(Uuid::new_v4(), ctx, tx),
            events,
            verifier,
            connector,
        }
    }

    fn single_error(step: &Step) -> &str {
        assert_eq!(step.frames.len(), 1, "{step:?}");
        match &step.frames[0] {
            ServerFrame::Error { code, .. } => code,
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_before_connect_is_an_error_but_channel_survives() {
        let mut f = fixture();
        let step = f.session.handle_text(r#"{"type":"input","data":"ls\n"}"#).await;
        assert_eq!(single_error(&step), "invalid_state");
        assert!(step.close.is_none());
        assert_eq!(f.session.state().name(), "unauthenticated");

        let token = token(&f.verifier, 42, "student");
        let step = f.session.handle_text(&connect_frame(&token, 1)).await;
        assert!(matches!(step.frames[0], ServerFrame::Ready { container_id: 1, .. }));
        assert_eq!(f.session.state().name(), "active");
    }

    #[tokio::test]
    async fn bad_token_closes_with_auth_code() {
        let mut f = fixture();
        let step = f.session.handle_text(&connect_frame("forged.token", 1)).await;
        assert_eq!(single_error(&step), "unauthorized");
        assert_eq!(step.close, Some(CloseCode::AuthFailed));
        assert_eq!(f.session.state().name(), "closed");
        assert_eq!(f.connector.attaches(), 0);
    }

    #[tokio::test]
    async fn empty_token_closes_with_auth_code() {
        let mut f = fixture();
        let step = f.session.handle_text(&connect_frame("  ", 1)).await;
        assert_eq!(single_error(&step), "unauthorized");
        assert_eq!(step.close, Some(CloseCode::AuthFailed));
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_change_nothing() {
        let mut f = fixture();
        for text in ["garbage", r#"{"type":"launch"}"#, r#"{"type":"resize","cols":"wide"}"#] {
            let step = f.session.handle_text(text).await;
            assert_eq!(single_error(&step), "protocol_error");
            assert_eq!(f.session.state().name(), "unauthenticated");
        }
    }

    #[tokio::test]
    async fn foreign_container_is_forbidden_and_session_stays_idle() {
        let mut f = fixture();
        let token = token(&f.verifier, 42, "student");
        let step = f.session.handle_text(&connect_frame(&token, 2)).await;
        assert_eq!(single_error(&step), "forbidden");
        assert!(step.close.is_none());
        assert_eq!(f.session.state().name(), "idle");

        let step = f.session.handle_text(&connect_frame(&token, 404)).await;
        assert_eq!(single_error(&step), "not_found");

        let step = f.session.handle_text(&connect_frame(&token, 1)).await;
        assert!(matches!(step.frames[0], ServerFrame::Ready { .. }));
    }

    #[tokio::test]
    async fn admin_may_attach_to_any_container() {
        let mut f = fixture();
        let token = token(&f.verifier, 1, "admin");
        let step = f.session.handle_text(&connect_frame(&token, 2)).await;
        assert!(matches!(step.frames[0], ServerFrame::Ready { container_id: 2, .. }));
    }

    #[tokio::test]
    async fn lab_that_is_not_running_takes_no_shell() {
        let mut f = fixture();
        let token = token(&f.verifier, 42, "student");
        let step = f.session.handle_text(&connect_frame(&token, 3)).await;
        assert_eq!(single_error(&step), "not_running");
        assert!(step.close.is_none());
        assert_eq!(f.session.state().name(), "idle");
        assert_eq!(f.connector.attaches(), 0);

        let step = f.session.handle_text(&connect_frame(&token, 1)).await;
        assert!(matches!(step.frames[0], ServerFrame::Ready { container_id: 1, .. }));
    }

    #[tokio::test]
    async fn input_and_resize_reach_the_shell() {
        let mut f = fixture();
        let token = token(&f.verifier, 42, "student");
        f.session.handle_text(&connect_frame(&token, 1)).await;

        let step = f.session.handle_text(r#"{"type":"input","data":"whoami\n"}"#).await;
        assert_eq!(step, Step::none());
        let step = f.session.handle_text(r#"{"type":"resize","cols":100,"rows":30}"#).await;
        assert_eq!(step, Step::none());

        assert_eq!(f.connector.inputs(), vec!["whoami\n".to_string()]);
        assert_eq!(f.connector.resizes(), vec![(100, 30)]);

        let step = f.session.handle_text(&connect_frame(&token, 1)).await;
        assert_eq!(single_error(&step), "invalid_state");
    }

    #[tokio::test]
    async fn close_twice_terminates_once() {
        let mut f = fixture();
        let token = token(&f.verifier, 42, "student");
        f.session.handle_text(&connect_frame(&token, 1)).await;

        let first = f.session.handle_text(r#"{"type":"close"}"#).await;
        assert!(matches!(first.frames[0], ServerFrame::Closing { .. }));
        assert_eq!(first.close, Some(CloseCode::Normal));

        let second = f.session.handle_text(r#"{"type":"close"}"#).await;
        assert_eq!(second, Step::none());

        f.session.shutdown().await;
        assert_eq!(f.connector.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn output_and_exit_are_relayed() {
        let mut f = fixture();
        let token = token(&f.verifier, 42, "student");
        f.session.handle_text(&connect_frame(&token, 1)).await;

        let step = f.session.on_shell_event(ShellEvent::Output("hello".into())).await;
        assert_eq!(step, Step::frame(ServerFrame::Data { data: "hello".into() }));

        let step = f.session.on_shell_event(ShellEvent::Exited(Some(0))).await;
        assert_eq!(step.close, Some(CloseCode::Normal));
        assert_eq!(f.session.state().name(), "closed");

        let step = f.session.on_shell_event(ShellEvent::Output("late".into())).await;
        assert_eq!(step, Step::none());
        drop(f.events);
    }

    #[tokio::test]
    async fn local_fallback_without_pty_acknowledges_resize() {
        let verifier = Arc::new(test_verifier());
        let ctx = Arc::new(SessionContext {
            verifier: verifier.clone(),
            directory: Arc::new(StaticDirectory::new(vec![target(1, 42)])),
            connector: Arc::new(LocalShellConnector::new("/bin/sh")),
            registry: SessionRegistry::new(8),
        });
        let (tx, mut events) = mpsc::channel(16);
        let mut session = Session::new(Uuid::new_v4(), ctx, tx);

        let token = token(&verifier, 42, "student");
        let step = session.handle_text(&connect_frame(&token, 1)).await;
        assert!(matches!(
            step.frames[0],
            ServerFrame::Ready { supports_resize: false, .. }
        ));

        let step = session.handle_text(r#"{"type":"resize","cols":80,"rows":24}"#).await;
        assert!(matches!(step.frames[0], ServerFrame::Info { .. }));
        assert!(step.close.is_none());

        session.handle_text(r#"{"type":"input","data":"echo hi\n"}"#).await;
        let mut seen = String::new();
        while !seen.contains("hi") {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            for frame in session.on_shell_event(event).await.frames {
                if let ServerFrame::Data { data } = frame {
                    seen.push_str(&data);
                }
            }
        }
        session.shutdown().await;
        session.shutdown().await;
    }
}
