//! GenericPool — warm, unspecialized containers for one environment.
//!
//! Each container is owned by exactly one of: the idle queue, an
//! in-flight specialization, or (once specialized) a cache entry. The
//! move out of the idle queue and into `Specializing` happens under the
//! pool lock, so two allocations can never take the same container.
//!
//! Publishing a specialized container to the cache and starting its
//! teardown both happen under the pool lock as well. A cache entry is
//! therefore never left pointing at a container that is being deleted.
//!
//! ```text
//!   Pooled ──acquire──► Specializing ──commit_specialized──► Specialized
//!                            │                                 │
//!                            └───── terminate / reap ─────► Draining ──► Terminated
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kiln_cache::{FunctionServiceCache, Reservation};
use kiln_core::config::ExhaustionPolicy;
use kiln_core::{Environment, FunctionIdentity, KilnError, KilnResult};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::orchestrator::{
    ContainerInfo, ContainerSpec, LABEL_ENV_NAME, LABEL_ENV_NAMESPACE, ServiceInfo,
    managed_labels,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Pooled,
    Specializing { since: Instant },
    Specialized,
    Draining,
    Terminated,
}

/// Pool-side record of one container.
#[derive(Debug, Clone)]
pub struct Container {
    pub info: ContainerInfo,
    pub state: ContainerState,
    pub assigned: Option<FunctionIdentity>,
    /// Name of the service fronting this container once specialized.
    pub service: Option<String>,
    pub created_at: Instant,
}

impl Container {
    pub fn id(&self) -> &str {
        &self.info.id
    }
}

/// Counts by state, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub specializing: usize,
    pub specialized: usize,
    pub draining: usize,
    pub creating: u32,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.idle + self.specializing + self.specialized + self.draining + self.creating as usize
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<String>,
    containers: HashMap<String, Container>,
    /// Creations in flight; they count against the maximum.
    creating: u32,
    seq: u64,
    /// Set by `shutdown`; no container is handed out or kept afterwards.
    closed: bool,
}

impl PoolState {
    fn total(&self) -> u32 {
        self.containers.len() as u32 + self.creating
    }
}

enum Step {
    Take(Container),
    Create,
    Exhausted,
    Closed,
}

/// Warm pool for one environment.
pub struct GenericPool {
    key: String,
    ctx: ServiceContext,
    cache: FunctionServiceCache,
    env: Mutex<Environment>,
    state: Mutex<PoolState>,
    /// Fired whenever a container becomes idle or capacity frees up.
    changed: Notify,
    /// Wakes the replenisher early.
    replenish: Notify,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GenericPool {
    /// Create the pool and start its replenisher.
    pub fn start(ctx: ServiceContext, env: Environment, cache: FunctionServiceCache) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(Self {
            key: env.metadata.table_key(),
            ctx,
            cache,
            env: Mutex::new(env),
            state: Mutex::new(PoolState::default()),
            changed: Notify::new(),
            replenish: Notify::new(),
            shutdown_tx,
            task: Mutex::new(None),
        });

        let runner = Arc::clone(&pool);
        let handle = tokio::spawn(async move { runner.run_replenisher(shutdown_rx).await });
        *pool.task.lock() = Some(handle);

        info!(
            environment = %pool.key,
            target = pool.target(),
            max = pool.ctx.config.max_pool_size,
            "pool started"
        );
        pool
    }

    /// `{namespace}/{name}` of the environment.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn environment(&self) -> Environment {
        self.env.lock().clone()
    }

    /// Pick up a newer revision of the environment for future containers.
    pub fn update_environment(&self, env: &Environment) {
        let mut current = self.env.lock();
        if current.metadata.resource_version != env.metadata.resource_version {
            debug!(environment = %self.key, version = %env.metadata.resource_version, "environment updated");
            *current = env.clone();
        }
    }

    fn target(&self) -> u32 {
        let target = self
            .env
            .lock()
            .spec
            .pool_size
            .unwrap_or(self.ctx.config.pool_size);
        target.min(self.ctx.config.max_pool_size)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            creating: state.creating,
            ..PoolStats::default()
        };
        for c in state.containers.values() {
            match c.state {
                ContainerState::Pooled => stats.idle += 1,
                ContainerState::Specializing { .. } => stats.specializing += 1,
                ContainerState::Specialized => stats.specialized += 1,
                ContainerState::Draining | ContainerState::Terminated => stats.draining += 1,
            }
        }
        stats
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.state.lock().containers.contains_key(container_id)
    }

    pub fn container(&self, container_id: &str) -> Option<Container> {
        self.state.lock().containers.get(container_id).cloned()
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Take a container for specialization, creating one if the pool has
    /// capacity. The returned container is already `Specializing`.
    pub async fn acquire(&self) -> KilnResult<Container> {
        let deadline = match self.ctx.config.exhaustion {
            ExhaustionPolicy::Fail => None,
            ExhaustionPolicy::Wait { timeout } => Some(Instant::now() + timeout),
        };

        loop {
            // Register interest before inspecting state so a release that
            // lands in between is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next_step() {
                Step::Take(container) => {
                    self.replenish.notify_one();
                    debug!(environment = %self.key, container = %container.id(), "took idle container");
                    return Ok(container);
                }
                Step::Create => return self.create_for_specialization().await,
                Step::Closed => return Err(self.closed_error()),
                Step::Exhausted => {
                    let Some(deadline) = deadline else {
                        return Err(self.exhausted());
                    };
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(self.exhausted());
                    }
                }
            }
        }
    }

    fn next_step(&self) -> Step {
        let mut state = self.state.lock();
        if state.closed {
            return Step::Closed;
        }
        while let Some(id) = state.idle.pop_front() {
            if let Some(c) = state.containers.get_mut(&id) {
                if c.state == ContainerState::Pooled {
                    c.state = ContainerState::Specializing {
                        since: Instant::now(),
                    };
                    return Step::Take(c.clone());
                }
            }
        }
        if state.total() < self.ctx.config.max_pool_size {
            state.creating += 1;
            Step::Create
        } else {
            Step::Exhausted
        }
    }

    fn closed_error(&self) -> KilnError {
        KilnError::NotFound(format!("environment {} was removed", self.key))
    }

    fn exhausted(&self) -> KilnError {
        let max = self.ctx.config.max_pool_size;
        warn!(environment = %self.key, max, "pool exhausted");
        KilnError::PoolExhausted(format!(
            "environment {} has {max} of {max} containers in use",
            self.key
        ))
    }

    async fn create_for_specialization(&self) -> KilnResult<Container> {
        let created = self.create_container().await;
        let orphan = {
            let mut state = self.state.lock();
            state.creating -= 1;
            match created {
                Ok(info) if state.closed => info.id,
                Ok(info) => {
                    let container = Container {
                        info,
                        state: ContainerState::Specializing {
                            since: Instant::now(),
                        },
                        assigned: None,
                        service: None,
                        created_at: Instant::now(),
                    };
                    state
                        .containers
                        .insert(container.id().to_string(), container.clone());
                    return Ok(container);
                }
                Err(e) => {
                    drop(state);
                    self.changed.notify_waiters();
                    return Err(e);
                }
            }
        };
        self.discard(&orphan).await;
        Err(self.closed_error())
    }

    /// Create a container through the orchestrator and wait for readiness.
    ///
    /// The caller has already counted it in `creating`.
    async fn create_container(&self) -> KilnResult<ContainerInfo> {
        let env = self.environment();
        let seq = {
            let mut state = self.state.lock();
            state.seq += 1;
            state.seq
        };
        let mut labels = managed_labels(&self.ctx.instance_id);
        labels.insert(LABEL_ENV_NAME.to_string(), env.metadata.name.clone());
        labels.insert(LABEL_ENV_NAMESPACE.to_string(), env.metadata.namespace.clone());
        let spec = ContainerSpec {
            name: format!("{}-{}-{seq}", env.metadata.name, self.ctx.instance_id),
            namespace: self.ctx.config.function_namespace.clone(),
            image: env.spec.runtime.image.clone(),
            labels,
            shared_mount_path: self.ctx.config.shared_mount_path.clone(),
            fetcher_port: self.ctx.config.fetcher_port,
        };

        let timeout = self.ctx.config.call_timeout;
        let orchestrator = &self.ctx.orchestrator;
        let info = with_timeout(timeout, "create container", orchestrator.create_container(&spec))
            .await?;
        let ready = with_timeout(
            timeout,
            "wait for container",
            orchestrator.wait_ready(&info.id, timeout),
        )
        .await;
        if let Err(e) = ready {
            warn!(environment = %self.key, container = %info.id, error = %e, "container never became ready");
            if let Err(e) = orchestrator.delete_container(&info.id).await {
                warn!(container = %info.id, error = %e, "failed to delete unready container");
            }
            return Err(e);
        }
        debug!(environment = %self.key, container = %info.id, "container ready");
        Ok(info)
    }

    /// Delete a container the pool never took ownership of.
    async fn discard(&self, container_id: &str) {
        let deleted = with_timeout(
            self.ctx.config.call_timeout,
            "delete container",
            self.ctx.orchestrator.delete_container(container_id),
        )
        .await;
        if let Err(e) = deleted {
            warn!(container = %container_id, error = %e, "failed to delete container");
        }
    }

    // ── Lifecycle transitions ──────────────────────────────────────

    /// `Specializing → Specialized`, publishing `service` to the cache
    /// under the reservation.
    ///
    /// Hands the reservation back if the container was reaped or the pool
    /// shut down in the meantime.
    pub fn commit_specialized(
        &self,
        container_id: &str,
        service: &ServiceInfo,
        token: Reservation,
    ) -> Result<(), Reservation> {
        let mut state = self.state.lock();
        match state.containers.get_mut(container_id) {
            Some(c) if matches!(c.state, ContainerState::Specializing { .. }) => {
                c.state = ContainerState::Specialized;
                c.assigned = Some(token.identity().clone());
                c.service = Some(service.name.clone());
                self.cache.commit(token, &service.address, container_id);
                Ok(())
            }
            _ => Err(token),
        }
    }

    /// Drain and delete a container along with its service, if any.
    ///
    /// Any cache entry pointing at the container is dropped first. A
    /// container that is already draining or unknown is left alone.
    pub async fn terminate(&self, container_id: &str) {
        let target = {
            let mut state = self.state.lock();
            state.idle.retain(|id| id != container_id);
            match state.containers.get_mut(container_id) {
                Some(c) if c.state != ContainerState::Draining => {
                    c.state = ContainerState::Draining;
                    if let Some(evicted) = self.cache.remove_container(container_id) {
                        debug!(identity = %evicted.identity, address = %evicted.address, "cache entry dropped");
                    }
                    Some(c.clone())
                }
                _ => None,
            }
        };
        let Some(container) = target else {
            return;
        };

        let orchestrator = &self.ctx.orchestrator;
        let timeout = self.ctx.config.call_timeout;
        if let Some(service) = &container.service {
            let deleted = with_timeout(
                timeout,
                "delete service",
                orchestrator.delete_service(&container.info.namespace, service),
            )
            .await;
            if let Err(e) = deleted {
                warn!(%service, error = %e, "failed to delete service");
            }
        }
        let deleted = with_timeout(
            timeout,
            "delete container",
            orchestrator.delete_container(container_id),
        )
        .await;
        if let Err(e) = deleted {
            warn!(container = %container_id, error = %e, "failed to delete container");
        }

        // Terminated: drop from bookkeeping, freeing capacity.
        self.state.lock().containers.remove(container_id);
        info!(
            environment = %self.key,
            container = %container_id,
            function = ?container.assigned.as_ref().map(|id| id.to_string()),
            "container terminated"
        );
        self.changed.notify_waiters();
        self.replenish.notify_one();
    }

    /// Containers stuck in `Specializing` for longer than `older_than`.
    pub fn stale_specializing(&self, older_than: Duration) -> Vec<String> {
        let now = Instant::now();
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| match c.state {
                ContainerState::Specializing { since } => now.duration_since(since) > older_than,
                _ => false,
            })
            .map(|c| c.id().to_string())
            .collect()
    }

    // ── Replenishment ──────────────────────────────────────────────

    async fn run_replenisher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.ctx.config.replenish_interval);
        debug!(environment = %self.key, "replenisher starting");

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.replenish.notified() => {}
                _ = shutdown.changed() => {
                    debug!(environment = %self.key, "replenisher shutting down");
                    break;
                }
            }
            self.fill().await;
        }
    }

    /// Create containers until `idle + creating` reaches the target or the
    /// pool is full.
    pub async fn fill(&self) {
        loop {
            let target = self.target();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return;
                }
                let warm = state.idle.len() as u32 + state.creating;
                if warm >= target || state.total() >= self.ctx.config.max_pool_size {
                    return;
                }
                state.creating += 1;
            }

            let created = self.create_container().await;
            let orphan = {
                let mut state = self.state.lock();
                state.creating -= 1;
                match &created {
                    Ok(info) if state.closed => Some(info.id.clone()),
                    Ok(info) => {
                        let id = info.id.clone();
                        state.containers.insert(
                            id.clone(),
                            Container {
                                info: info.clone(),
                                state: ContainerState::Pooled,
                                assigned: None,
                                service: None,
                                created_at: Instant::now(),
                            },
                        );
                        state.idle.push_back(id);
                        None
                    }
                    Err(_) => None,
                }
            };
            if let Some(id) = orphan {
                self.discard(&id).await;
                return;
            }
            self.changed.notify_waiters();

            if let Err(e) = created {
                warn!(environment = %self.key, error = %e, "replenish failed");
                return;
            }
        }
    }

    /// Stop the replenisher and delete every container of this pool,
    /// dropping the cache entries they served.
    ///
    /// The pool stays closed: later allocations fail and containers still
    /// being created are deleted as soon as they arrive.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let ids: Vec<String> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.containers.keys().cloned().collect()
        };
        for id in ids {
            self.terminate(&id).await;
        }
        info!(environment = %self.key, "pool stopped");
    }
}

/// Bound an orchestrator call by `timeout`.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = KilnResult<T>>,
) -> KilnResult<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| KilnError::Orchestrator(format!("{what} timed out after {timeout:?}")))?
}
