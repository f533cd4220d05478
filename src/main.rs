//! labforge - Main entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::ExposeSecret;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use labforge::{
    api::{ApiState, LabApi},
    audit::StoreAuditSink,
    auth::{Claims, HmacTokenVerifier, TokenVerifier},
    config::Config,
    db::{InMemoryRecordStore, PgRecordStore, RecordStore},
    gateway::{self, GatewayHandle, StoreContainerDirectory},
    provisioning::{ProvisioningOrchestrator, RecordWriter, build_launcher},
};

#[derive(Parser, Debug)]
#[command(name = "labforge")]
#[command(about = "Training-lab provisioning orchestrator and browser shell gateway")]
#[command(version)]
struct Args {
    /// Skip database connection and keep records in memory (demos, testing)
    #[arg(long)]
    no_db: bool,

    /// Print a bearer token for this user id and exit
    #[arg(long, value_name = "USER_ID")]
    issue_token: Option<i64>,

    /// Role claim for --issue-token
    #[arg(long, default_value = "student")]
    role: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("labforge=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::from_env()?;
    let verifier = Arc::new(HmacTokenVerifier::new(config.auth.secret.clone()));

    if let Some(user_id) = args.issue_token {
        let claims = Claims::new(user_id, args.role, config.auth.token_ttl);
        println!("{}", verifier.issue(&claims)?);
        return Ok(());
    }

    tracing::info!("Starting labforge...");

    // Relational store (in memory for --no-db)
    let store: Arc<dyn RecordStore> = if args.no_db {
        tracing::warn!("Running without database connection, records are kept in memory");
        Arc::new(InMemoryRecordStore::with_default_schema())
    } else {
        let url = config
            .database
            .url
            .as_ref()
            .context("DATABASE_URL is required unless --no-db is set")?;
        let store = PgRecordStore::connect(url.expose_secret(), config.database.pool_size)?;
        tracing::info!(pool_size = config.database.pool_size, "Database pool ready");
        Arc::new(store)
    };

    let launcher = build_launcher(&config.launcher)?;
    tracing::info!(mode = %config.launcher.mode, "Compute launcher initialized");

    let audit = Arc::new(StoreAuditSink::new(
        store.clone(),
        config.provisioning.audit_table.clone(),
    ));
    let orchestrator = Arc::new(ProvisioningOrchestrator::new(
        store.clone(),
        launcher,
        audit,
        config.provisioning.clone(),
    ));
    orchestrator.clone().spawn_reconciler(
        config.provisioning.sweep_interval,
        config.provisioning.stale_after,
    );

    let directory = Arc::new(StoreContainerDirectory::new(RecordWriter::new(
        store.clone(),
        config.provisioning.containers_table.clone(),
        config.provisioning.status_table.clone(),
    )));
    let verifier: Arc<dyn TokenVerifier> = verifier;
    let gateway = gateway::init(config.gateway.clone(), verifier.clone(), directory);

    let app = LabApi::router(ApiState {
        orchestrator,
        verifier,
    })
    .merge(gateway.router());

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        "Listening on {} (session channel at {})",
        addr,
        config.gateway.ws_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gateway))
        .await?;

    tracing::info!("labforge stopped");
    Ok(())
}

async fn shutdown_signal(gateway: GatewayHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down, closing open sessions");
    gateway.shutdown();
}
