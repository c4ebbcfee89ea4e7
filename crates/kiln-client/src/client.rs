//! ExecutorClient — lookup and tap against the pool manager API.

use std::time::Duration;

use kiln_core::config::ClientConfig;
use kiln_core::{FunctionIdentity, HttpClient, KilnError, KilnResult};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::tap::{TapSink, run_tap_worker};

pub struct ExecutorClient {
    base_url: String,
    http: HttpClient,
    request_timeout: Duration,
    tap_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorClient {
    /// Connect to the pool manager at `base_url` and start the tap worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(base_url: &str, config: &ClientConfig) -> KilnResult<Self> {
        config.validate().map_err(KilnError::Validation)?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = HttpClient::with_user_agent("kiln-client/0.1");
        let (tap_tx, tap_rx) = mpsc::channel(config.tap_mailbox.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sink = TapSink {
            http: http.clone(),
            url: format!("{base_url}/v2/tapService"),
            timeout: config.request_timeout,
        };
        let worker = tokio::spawn(run_tap_worker(
            tap_rx,
            sink,
            config.tap_interval,
            shutdown_rx,
        ));

        Ok(Self {
            base_url,
            http,
            request_timeout: config.request_timeout,
            tap_tx,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Address of a warm instance of `identity`, creating one if needed.
    ///
    /// A non-success answer keeps the pool manager's status and message.
    pub async fn get_service_for_function(&self, identity: &FunctionIdentity) -> KilnResult<String> {
        let url = format!("{}/v2/getServiceForFunction", self.base_url);
        let resp = self
            .http
            .post_json(&url, identity, self.request_timeout)
            .await?;

        let text = resp.text();
        if !resp.is_success() {
            debug!(%identity, status = %resp.status, "lookup failed");
            return Err(KilnError::Upstream {
                status: resp.status.as_u16(),
                message: text.trim().to_string(),
            });
        }
        Ok(text.trim().to_string())
    }

    /// Note that `address` is still in use. Never waits.
    ///
    /// Returns false if the tap was dropped because the mailbox is full or
    /// the worker has stopped.
    pub fn tap_service(&self, address: &str) -> bool {
        match self.tap_tx.try_send(address.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(address)) => {
                warn!(%address, "tap mailbox full; dropping tap");
                false
            }
            Err(TrySendError::Closed(address)) => {
                warn!(%address, "tap worker stopped; dropping tap");
                false
            }
        }
    }

    /// Stop the tap worker after one final best-effort flush.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ExecutorClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
