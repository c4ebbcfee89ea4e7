//! Pool manager mode, optionally with an in-process fetcher.
//!
//! 1. Opens the metadata store under the data directory
//! 2. Starts the pool manager (startup cleanup, pools, reaper)
//! 3. Serves the pool manager API
//! 4. In standalone mode, also serves the fetcher on its own port

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use kiln_cache::FunctionServiceCache;
use kiln_core::{HttpClient, KilnConfig};
use kiln_fetcher::Fetcher;
use kiln_poolmgr::{LocalOrchestrator, PoolManager, ServiceContext};
use kiln_store::MetadataStore;
use tokio::sync::watch;
use tracing::{error, info};

use crate::shutdown;

pub async fn run(
    config: KilnConfig,
    port: u16,
    data_dir: PathBuf,
    runtime_host: String,
    with_fetcher: bool,
) -> anyhow::Result<()> {
    info!(standalone = with_fetcher, "kiln daemon starting");

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("kiln.redb");
    let store = MetadataStore::open(&db_path)?;
    info!(path = ?db_path, "metadata store opened");

    // ── Pool manager ───────────────────────────────────────────

    let orchestrator = Arc::new(LocalOrchestrator::new(&runtime_host));
    let ctx = ServiceContext::new(orchestrator, store.clone(), config.poolmgr.clone());
    let manager = PoolManager::start(ctx, FunctionServiceCache::new()).await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown::wait_for_signal(shutdown_tx));

    // ── Fetcher (standalone only) ──────────────────────────────

    let fetcher_handle = if with_fetcher {
        let shared = &config.fetcher.shared_path;
        std::fs::create_dir_all(shared)
            .with_context(|| format!("creating shared directory {}", shared.display()))?;
        let fetcher = Fetcher::new(
            shared.clone(),
            Arc::new(store.clone()),
            HttpClient::new(),
            config.fetcher.download_timeout,
        );
        let addr = SocketAddr::from(([0, 0, 0, 0], config.fetcher.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding fetcher to {addr}"))?;
        info!(%addr, shared = %shared.display(), "fetcher listening");

        let router = kiln_fetcher::router(Arc::new(fetcher));
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown::requested(rx))
                .await;
            if let Err(e) = served {
                error!(error = %e, "fetcher server error");
            }
        }))
    } else {
        None
    };

    // ── API server ─────────────────────────────────────────────

    let router = kiln_api::build_router(Arc::clone(&manager));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding pool manager API to {addr}"))?;
    info!(%addr, instance_id = %manager.context().instance_id, "pool manager API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown::requested(shutdown_rx))
        .await?;

    if let Some(handle) = fetcher_handle {
        let _ = handle.await;
    }
    manager.shutdown().await;

    info!("kiln daemon stopped");
    Ok(())
}
