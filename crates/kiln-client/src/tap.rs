//! Tap coalescing.

use std::collections::HashSet;
use std::mem;
use std::time::Duration;

use kiln_core::HttpClient;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Addresses tapped since the last flush.
#[derive(Debug, Default)]
pub struct TapBuffer {
    pending: HashSet<String>,
}

impl TapBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tap. Returns false if the address was already pending.
    pub fn insert(&mut self, address: String) -> bool {
        self.pending.insert(address)
    }

    /// Swap the pending set for an empty one and return it, sorted.
    pub fn take(&mut self) -> Vec<String> {
        let mut batch: Vec<String> = mem::take(&mut self.pending).into_iter().collect();
        batch.sort();
        batch
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Where flushed batches go.
#[derive(Clone)]
pub(crate) struct TapSink {
    pub http: HttpClient,
    pub url: String,
    pub timeout: Duration,
}

impl TapSink {
    async fn send(&self, batch: Vec<String>) {
        let count = batch.len();
        match self.http.post_json(&self.url, &batch, self.timeout).await {
            Ok(resp) if resp.is_success() => debug!(count, "taps flushed"),
            Ok(resp) => warn!(count, status = %resp.status, body = %resp.text().trim(), "tap flush rejected"),
            Err(e) => warn!(count, error = %e, "tap flush failed"),
        }
    }
}

/// Owns the pending set. Flushes run on their own tasks so a slow pool
/// manager never stalls collection.
pub(crate) async fn run_tap_worker(
    mut rx: mpsc::Receiver<String>,
    sink: TapSink,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = TapBuffer::new();
    let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(?interval, "tap worker starting");

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(address) => {
                    buffer.insert(address);
                }
                None => break,
            },
            _ = tick.tick() => {
                let batch = buffer.take();
                if !batch.is_empty() {
                    let sink = sink.clone();
                    tokio::spawn(async move { sink.send(batch).await });
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Best effort: whatever is queued goes out in one last batch.
    while let Ok(address) = rx.try_recv() {
        buffer.insert(address);
    }
    let batch = buffer.take();
    if !batch.is_empty() {
        info!(count = batch.len(), "flushing pending taps before exit");
        sink.send(batch).await;
    }
    debug!("tap worker stopped");
}
