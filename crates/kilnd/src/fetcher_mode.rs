//! Fetcher sidecar mode.
//!
//! Function definitions are read from the pool manager API, since a
//! sidecar has no store of its own.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, bail};
use kiln_core::{HttpClient, KilnConfig};
use kiln_fetcher::{Fetcher, RemoteFunctionSource};
use tokio::sync::watch;
use tracing::info;

use crate::shutdown;

pub async fn run(config: KilnConfig) -> anyhow::Result<()> {
    let fetcher_config = config.fetcher;
    let Some(source_url) = fetcher_config.function_source_url.as_deref() else {
        bail!("fetcher mode needs --function-source-url or fetcher.function_source_url");
    };

    let shared = &fetcher_config.shared_path;
    std::fs::create_dir_all(shared)
        .with_context(|| format!("creating shared directory {}", shared.display()))?;

    let http = HttpClient::new();
    let source = RemoteFunctionSource::new(source_url, http.clone(), config.client.request_timeout);
    let fetcher = Fetcher::new(
        shared.clone(),
        Arc::new(source),
        http,
        fetcher_config.download_timeout,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown::wait_for_signal(shutdown_tx));

    let addr = SocketAddr::from(([0, 0, 0, 0], fetcher_config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding fetcher to {addr}"))?;
    info!(%addr, shared = %shared.display(), source = %source_url, "fetcher listening");

    axum::serve(listener, kiln_fetcher::router(Arc::new(fetcher)))
        .with_graceful_shutdown(shutdown::requested(shutdown_rx))
        .await?;

    info!("fetcher stopped");
    Ok(())
}
