//! Integration tests for the launch trigger.
//!
//! Runs the real router on a loopback port with the simulated launcher and
//! the in-memory record store, so no database or container host is needed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use labforge::api::{ApiState, LabApi};
use labforge::audit::StoreAuditSink;
use labforge::auth::{Claims, TokenVerifier};
use labforge::config::{GatewayConfig, LauncherConfig, ProvisioningConfig};
use labforge::db::{ColumnValue, InMemoryRecordStore, JournalOp};
use labforge::gateway::{self, StoreContainerDirectory};
use labforge::provisioning::{
    ComputeLauncher, ProvisioningOrchestrator, RecordWriter, SimulatedLauncher,
};
use labforge::testing::{FailingLauncher, test_verifier};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

struct TestServer {
    addr: SocketAddr,
    store: Arc<InMemoryRecordStore>,
}

async fn start_test_server() -> TestServer {
    start_test_server_with_launcher(Arc::new(SimulatedLauncher::new(&LauncherConfig::default())))
        .await
}

async fn start_test_server_with_launcher(launcher: Arc<dyn ComputeLauncher>) -> TestServer {
    let store = Arc::new(
        InMemoryRecordStore::with_default_schema()
            .with_row("tasks", &[("id", json!(7)), ("title", json!("Linux basics"))]),
    );
    let config = ProvisioningConfig::default();
    let audit = Arc::new(StoreAuditSink::new(store.clone(), config.audit_table.clone()));
    let orchestrator = Arc::new(ProvisioningOrchestrator::new(
        store.clone(),
        launcher,
        audit,
        config.clone(),
    ));

    let verifier: Arc<dyn TokenVerifier> = Arc::new(test_verifier());
    let directory = Arc::new(StoreContainerDirectory::new(RecordWriter::new(
        store.clone(),
        config.containers_table.clone(),
        config.status_table.clone(),
    )));
    let handle = gateway::init(GatewayConfig::default(), verifier.clone(), directory);

    let app = LabApi::router(ApiState {
        orchestrator,
        verifier,
    })
    .merge(handle.router());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, store }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

fn token(user_id: i64) -> String {
    test_verifier()
        .issue(&Claims::new(user_id, "student", Duration::from_secs(300)))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_is_open() {
    let server = start_test_server().await;
    let resp = client()
        .get(format!("http://{}/health", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_simulated_launch_end_to_end() {
    let server = start_test_server().await;
    let resp = client()
        .post(format!("http://{}/api/containers", server.addr))
        .bearer_auth(token(42))
        .json(&json!({ "taskId": 7, "dependencies": ["node", "redis"] }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["container"]["status"], "running");
    assert_eq!(body["container"]["ip"], "127.0.0.1");
    assert_eq!(body["ssh"]["host"], "127.0.0.1");
    assert_eq!(body["ssh"]["port"], 22);
    assert!(body["hostKey"].is_null());
    let id = body["container"]["id"].as_i64().unwrap();
    assert_eq!(body["connection"]["containerId"], id);

    let name = body["container"]["name"].as_str().unwrap();
    assert!(name.starts_with("lab-"), "unexpected name {name}");

    // One insert in `creating`, one guarded update to `running`.
    let journal = server.store.journal().await;
    let writes: Vec<_> = journal.iter().filter(|e| e.table == "containers").collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].op, JournalOp::Insert);
    assert_eq!(writes[0].value("status_id"), Some(&ColumnValue::Int(1)));
    assert_eq!(writes[0].value("task_id"), Some(&ColumnValue::Int(7)));
    assert_eq!(writes[0].value("user_id"), Some(&ColumnValue::Int(42)));
    assert_eq!(writes[1].op, JournalOp::Update);
    assert_eq!(writes[1].value("status_id"), Some(&ColumnValue::Int(2)));

    let rows = server.store.rows("containers").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["lxc_name"], name);
    assert_eq!(rows[0]["metadata"]["dependencies"], json!(["node", "redis"]));

    let audit = server.store.rows("audit_logs").await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0]["action"], "launch_container");
    assert_eq!(audit[0]["target_type"], "container");
    assert_eq!(audit[0]["target_id"], id.to_string());
    assert_eq!(audit[0]["user_id"], 42);
}

#[tokio::test]
async fn test_launch_requires_token() {
    let server = start_test_server().await;
    let url = format!("http://{}/api/containers", server.addr);

    let resp = client()
        .post(&url)
        .json(&json!({ "dependencies": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client()
        .post(&url)
        .bearer_auth("not-a-token")
        .json(&json!({ "dependencies": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(server.store.journal().await.is_empty());
}

#[tokio::test]
async fn test_invalid_dependencies_are_listed() {
    let server = start_test_server().await;
    let resp = client()
        .post(format!("http://{}/api/containers", server.addr))
        .bearer_auth(token(42))
        .json(&json!({ "dependencies": ["node", "cobol", "nginx", "perl"] }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["invalid"], json!(["cobol", "perl"]));
    assert!(server.store.journal().await.is_empty());
    assert!(server.store.rows("audit_logs").await.is_empty());
}

#[tokio::test]
async fn test_failed_launch_leaves_failed_record() {
    let server = start_test_server_with_launcher(Arc::new(FailingLauncher::new("lxc exited 1"))).await;
    let resp = client()
        .post(format!("http://{}/api/containers", server.addr))
        .bearer_auth(token(42))
        .json(&json!({ "dependencies": ["nginx"] }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);

    let journal = server.store.journal().await;
    let writes: Vec<_> = journal.iter().filter(|e| e.table == "containers").collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].op, JournalOp::Update);
    assert_eq!(writes[1].value("status_id"), Some(&ColumnValue::Int(4)));

    let rows = server.store.rows("containers").await;
    assert!(
        rows[0]["metadata"]["error"]
            .as_str()
            .unwrap()
            .contains("lxc exited 1")
    );
}

#[tokio::test]
async fn test_session_channel_requires_upgrade() {
    let server = start_test_server().await;
    let resp = client()
        .get(format!("http://{}/ws/terminal", server.addr))
        .send()
        .await
        .unwrap();
    assert_ne!(resp.status(), 404);
    assert!(resp.status().is_client_error());
}
