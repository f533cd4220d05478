//! HTTP trigger for lab launches.
//!
//! `POST /api/containers` sits behind the bearer-token route layer; the
//! verified claims name the owner. `GET /health` is open.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{Claims, TokenVerifier, bearer_auth_middleware};
use crate::error::ProvisionError;
use crate::provisioning::{
    ConnectionDescriptor, ContainerStatus, LaunchRequest, LaunchResult, ProvisioningOrchestrator,
    ShellConnection,
};

/// Shared state for the trigger API.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<ProvisioningOrchestrator>,
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Launch request body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchBody {
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub id: i64,
    pub name: String,
    pub status: ContainerStatus,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub container: ContainerSummary,
    pub ssh: ShellConnection,
    pub host_key: Option<String>,
    pub connection: ConnectionDescriptor,
}

impl From<LaunchResult> for LaunchResponse {
    fn from(result: LaunchResult) -> Self {
        Self {
            container: ContainerSummary {
                id: result.container.id,
                name: result.container.name,
                status: result.container.status,
                ip: result.container.address,
            },
            ssh: result.ssh,
            host_key: result.host_key,
            connection: result.connection,
        }
    }
}

/// [`ProvisionError`] rendered as an HTTP response.
pub struct ApiError(ProvisionError);

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            ProvisionError::InvalidDependency { tokens } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": self.0.to_string(), "invalid": tokens }),
            ),
            ProvisionError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, json!({ "error": self.0.to_string() }))
            }
            ProvisionError::LaunchFailed { .. } => {
                (StatusCode::BAD_GATEWAY, json!({ "error": self.0.to_string() }))
            }
            other => {
                tracing::error!(error = %other, "Launch request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub struct LabApi;

impl LabApi {
    pub fn router(state: ApiState) -> Router {
        Router::new()
            .route("/api/containers", post(launch_container))
            .route_layer(axum::middleware::from_fn_with_state(
                state.verifier.clone(),
                bearer_auth_middleware,
            ))
            // Unauthenticated routes (added after the layer).
            .route("/health", get(health_check))
            .with_state(state)
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn launch_container(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<LaunchBody>,
) -> Result<(StatusCode, Json<LaunchResponse>), ApiError> {
    let request = LaunchRequest {
        owner_id: claims.user_id(),
        task_id: body.task_id,
        dependencies: body.dependencies,
        ssh_public_key: body.ssh_public_key,
    };
    let result = state.orchestrator.launch(request).await?;
    Ok((StatusCode::CREATED, Json(result.into())))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::auth::HmacTokenVerifier;
    use crate::config::{LauncherConfig, ProvisioningConfig};
    use crate::db::InMemoryRecordStore;
    use crate::provisioning::SimulatedLauncher;
    use crate::testing::{FailingLauncher, test_verifier};

    fn state_with(launcher: Arc<dyn crate::provisioning::ComputeLauncher>) -> ApiState {
        let store = Arc::new(
            InMemoryRecordStore::with_default_schema()
                .with_row("tasks", &[("id", Value::from(1)), ("title", Value::from("Intro"))]),
        );
        let orchestrator = ProvisioningOrchestrator::new(
            store,
            launcher,
            Arc::new(InMemoryAuditSink::new()),
            ProvisioningConfig::default(),
        );
        ApiState {
            orchestrator: Arc::new(orchestrator),
            verifier: Arc::new(test_verifier()),
        }
    }

    fn test_state() -> ApiState {
        state_with(Arc::new(SimulatedLauncher::new(&LauncherConfig::default())))
    }

    fn bearer(user: i64) -> String {
        let token = HmacTokenVerifier::issue(
            &test_verifier(),
            &Claims::new(user, "student", Duration::from_secs(60)),
        )
        .unwrap();
        format!("Bearer {token}")
    }

    fn launch(auth: Option<String>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/containers")
            .header("Content-Type", "application/json");
        if let Some(auth) = auth {
            builder = builder.header("Authorization", auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_requires_no_auth() {
        let router = LabApi::router(test_state());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn launch_rejects_missing_token() {
        let router = LabApi::router(test_state());
        let resp = router
            .oneshot(launch(None, json!({"dependencies": []})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn launch_rejects_bogus_token() {
        let router = LabApi::router(test_state());
        let resp = router
            .oneshot(launch(
                Some("Bearer totally-bogus".into()),
                json!({"dependencies": []}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn launch_returns_connection_info() {
        let router = LabApi::router(test_state());
        let resp = router
            .oneshot(launch(
                Some(bearer(42)),
                json!({"taskId": 1, "dependencies": ["node", "redis"], "sshPublicKey": "ssh-ed25519 AAAA"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let body = json_body(resp).await;
        assert_eq!(body["container"]["status"], "running");
        assert_eq!(body["container"]["ip"], "127.0.0.1");
        assert_eq!(body["ssh"]["host"], "127.0.0.1");
        assert_eq!(body["connection"]["containerId"], body["container"]["id"]);
        assert!(body.get("hostKey").is_some());
    }

    #[tokio::test]
    async fn invalid_dependencies_are_listed() {
        let router = LabApi::router(test_state());
        let resp = router
            .oneshot(launch(
                Some(bearer(42)),
                json!({"dependencies": ["node", "php", "perl"]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["invalid"], json!(["php", "perl"]));
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let router = LabApi::router(test_state());
        let resp = router
            .oneshot(launch(Some(bearer(42)), json!({"taskId": 77})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn launcher_failure_is_502() {
        let router = LabApi::router(state_with(Arc::new(FailingLauncher::new("no capacity"))));
        let resp = router
            .oneshot(launch(Some(bearer(42)), json!({"dependencies": ["docker"]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
