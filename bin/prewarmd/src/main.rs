//! `prewarmd` — the image pre-warm control plane.
//!
//! Modes:
//!   prewarmd          start the API server (default)
//!   prewarmd serve    same as above
//!   prewarmd pull     node-side helper, run inside worker pods

mod puller;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use prewarm_auth::{AuthService, UserStore};
use prewarm_cluster::{ClusterApi, HttpCluster, LauncherConfig, WorkerLauncher};
use prewarm_core::ServiceConfig;
use prewarm_registry::{LibraryStore, SecretStore};
use prewarm_schedule::{ScheduleEngine, ScheduleStore};
use prewarm_sql::{SQLStore, SqliteStore};
use prewarm_task::manager::DEFAULT_MAX_CONCURRENT_TASKS;
use prewarm_task::{TaskManager, TaskStore};

use routes::AppContext;

/// Image pre-warm control plane.
#[derive(Parser, Debug)]
#[command(name = "prewarmd", about = "Image pre-warm control plane", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server.
    Serve,
    /// Pull images via the CRI socket and write the termination message.
    Pull,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Pull) => puller::run(),
        _ => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(serve()),
    }
}

async fn serve() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting image pre-warm service");

    let config = ServiceConfig::from_env();
    if config.jwt_secret_is_default {
        warn!("JWT_SECRET not set, using default secret");
    }

    // Metrics recorder must exist before any component records.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install prometheus recorder: {e}"))?;
    prewarm_core::metrics::describe_metrics();

    // Cluster API client.
    let cluster: Arc<dyn ClusterApi> = Arc::new(
        HttpCluster::in_cluster(&config.namespace)
            .map_err(|e| anyhow::anyhow!("failed to create cluster client: {e}"))?,
    );
    info!(namespace = %config.namespace, "cluster client initialised");

    // Storage.
    let db: Arc<dyn SQLStore> = Arc::new(
        SqliteStore::open(&config.sqlite_path)
            .map_err(|e| anyhow::anyhow!("failed to open sqlite store: {e}"))?,
    );
    info!(path = %config.sqlite_path.display(), "sqlite store initialised");

    let task_store = Arc::new(TaskStore::new(db.clone())?);
    let user_store = Arc::new(UserStore::new(db.clone())?);
    let secret_store = Arc::new(SecretStore::new(db.clone())?);
    let library_store = Arc::new(LibraryStore::new(db.clone())?);
    let schedule_store = Arc::new(ScheduleStore::new(db)?);

    // Auth + default admin.
    let auth = AuthService::new(user_store, cluster.clone(), &config.jwt_secret);
    auth.ensure_admin_user()?;

    // Orchestration pipeline.
    let launcher = Arc::new(WorkerLauncher::new(
        cluster.clone(),
        LauncherConfig {
            puller_image: config.puller_image.clone(),
            cri_socket_path: config.cri_socket_path.clone(),
        },
    ));
    let tasks = TaskManager::new(
        task_store,
        secret_store.clone(),
        launcher,
        cluster.clone(),
        DEFAULT_MAX_CONCURRENT_TASKS,
    );

    let shutdown = CancellationToken::new();
    tasks.start(shutdown.clone());

    // Bundles left behind by a crash are purged before new work starts.
    match tasks.purge_stale_bundles().await {
        Ok(0) => {}
        Ok(n) => info!(purged = n, "purged stale credential bundles"),
        Err(e) => warn!(error = %e, "stale bundle sweep failed"),
    }

    let engine = ScheduleEngine::new(schedule_store, tasks.clone());
    engine.start(shutdown.clone())?;

    info!("service components initialised");

    let app = routes::build_router(AppContext {
        auth,
        tasks,
        engine,
        secrets: secret_store,
        library: library_store,
        cluster,
        metrics: metrics_handle,
    });

    // Serve with SIGINT/SIGTERM graceful shutdown and a 5 s drain bound.
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "server listening");

    let signal = CancellationToken::new();
    {
        let signal = signal.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining");
            signal.cancel();
        });
    }

    let graceful = {
        let signal = signal.clone();
        async move { signal.cancelled().await }
    };
    let drain_deadline = async {
        signal.cancelled().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    };

    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(graceful) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                return Err(e.into());
            }
        }
        _ = drain_deadline => {
            warn!("drain deadline reached, forcing shutdown");
        }
    }

    shutdown.cancel();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
