// Posture streaming web server. The same binary runs as an inference worker
// when started with --worker.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use tokio::task::JoinHandle;

use textneck_server::web::config::{ServerArgs, ServerConfig};
use textneck_server::web::database::{Database, SharedDatabase};
use textneck_server::web::logger::{setup_logging, setup_worker_logging};
use textneck_server::web::routes::{handle_request, AppState};
use textneck_server::web::worker::{worker_main, SharedWorkerPool, WorkerPool};
use textneck_server::{sys_error, sys_info, sys_warn};

fn main() -> Result<()> {
    let args = ServerArgs::parse();

    // Worker mode is a plain blocking stdin loop; it must not start a runtime.
    if args.worker {
        if let Err(e) = setup_worker_logging(args.log_level()) {
            eprintln!("Failed to set up worker logging: {e}");
        }
        return worker_main::run_worker(&args.model).map_err(anyhow::Error::msg);
    }

    let config = args.into_config().map_err(anyhow::Error::msg)?;
    if let Err(e) = setup_logging(&config.log_dir, config.log_level) {
        eprintln!("Failed to set up logging: {e}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<()> {
    // Fail fast: never accept connections the pool cannot serve.
    let pool: SharedWorkerPool = Arc::new(WorkerPool::start(&config.worker_spec, config.workers)?);

    let db: Option<SharedDatabase> = if config.auth.is_some() {
        let db = Database::new(&config.db_path).map_err(anyhow::Error::msg)?;
        sys_info!("[SERVER] Database ready at {}", config.db_path.display());
        Some(Arc::new(db))
    } else {
        sys_warn!("[SERVER] No JWT secret configured: connections are anonymous and measurements are not stored");
        None
    };

    let supervisor = config
        .respawn_interval
        .map(|every| spawn_respawn_supervisor(pool.clone(), every));

    let config = Arc::new(config);
    let state = AppState {
        pool: pool.clone(),
        db,
        config: config.clone(),
    };

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone())))
        }
    });

    let server = Server::try_bind(&config.addr)
        .with_context(|| format!("Failed to bind {}", config.addr))?
        .serve(make_svc);

    sys_info!("[SERVER] Listening on http://{}", config.addr);
    sys_info!("[SERVER]   GET /health      - worker pool status");
    sys_info!("[SERVER]   GET /ws/posture  - posture stream (WebSocket)");
    sys_info!("[SERVER]   GET /dashboard   - stored measurements (JWT)");

    let result = server
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                sys_error!("[SERVER] Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            sys_info!("[SERVER] Shutdown requested");
        })
        .await;

    if let Some(supervisor) = supervisor {
        supervisor.abort();
    }
    pool.shutdown();

    result.context("HTTP server error")
}

/// Periodically restart workers whose process has died.
fn spawn_respawn_supervisor(pool: SharedWorkerPool, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pool = pool.clone();
            match tokio::task::spawn_blocking(move || pool.respawn_dead()).await {
                Ok(0) => {}
                Ok(n) => sys_info!("[POOL] Respawned {n} worker(s)"),
                Err(e) => sys_error!("[POOL] Respawn task failed: {e}"),
            }
        }
    })
}
