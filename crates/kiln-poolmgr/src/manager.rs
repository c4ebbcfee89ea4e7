//! PoolManager — resolves function identities to warm service addresses.
//!
//! Owns one [`GenericPool`] per environment, the function service cache,
//! and the reaper task that returns idle instances to nothing.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_cache::{Evicted, FunctionServiceCache, Lookup, Reservation};
use kiln_core::{Environment, Function, FunctionIdentity, KilnError, KilnResult};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cleanup::cleanup_stale_resources;
use crate::context::ServiceContext;
use crate::pool::{GenericPool, PoolStats};
use crate::specialize::specialize;

pub struct PoolManager {
    ctx: ServiceContext,
    cache: FunctionServiceCache,
    /// Environment `{namespace}/{name}` → pool.
    pools: Mutex<HashMap<String, Arc<GenericPool>>>,
    shutdown_tx: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Clean up after earlier instances, start a pool for every stored
    /// environment, and start the reaper.
    pub async fn start(ctx: ServiceContext, cache: FunctionServiceCache) -> KilnResult<Arc<Self>> {
        ctx.config.validate().map_err(KilnError::Validation)?;
        if let Err(e) = cleanup_stale_resources(&ctx).await {
            warn!(error = %e, "startup cleanup failed");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            ctx,
            cache,
            pools: Mutex::new(HashMap::new()),
            shutdown_tx,
            reaper: Mutex::new(None),
        });

        for env in manager.ctx.store.environments().list(None)? {
            manager.pool_for(&env);
        }

        let runner = Arc::clone(&manager);
        let handle = tokio::spawn(async move { runner.run_reaper(shutdown_rx).await });
        *manager.reaper.lock() = Some(handle);

        info!(
            instance_id = %manager.ctx.instance_id,
            pools = manager.pools.lock().len(),
            "pool manager started"
        );
        Ok(manager)
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub fn cache(&self) -> &FunctionServiceCache {
        &self.cache
    }

    /// The pool for `env`, created on first use.
    pub fn pool_for(&self, env: &Environment) -> Arc<GenericPool> {
        let key = env.metadata.table_key();
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&key) {
            pool.update_environment(env);
            return Arc::clone(pool);
        }
        let pool = GenericPool::start(self.ctx.clone(), env.clone(), self.cache.clone());
        pools.insert(key, Arc::clone(&pool));
        pool
    }

    /// Shut down the pool of a deleted environment and drop the cache
    /// entries its containers served. Returns false if there was no such
    /// pool.
    pub async fn remove_pool(&self, namespace: &str, name: &str) -> bool {
        let removed = self.pools.lock().remove(&format!("{namespace}/{name}"));
        match removed {
            Some(pool) => {
                pool.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub fn pool_stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .lock()
            .iter()
            .map(|(key, pool)| (key.clone(), pool.stats()))
            .collect()
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// Address of a warm instance of `identity`, specializing one if needed.
    ///
    /// An identity without a content version refers to the stored
    /// revision. Concurrent requests for the same identity share a single
    /// specialization and all observe its outcome.
    pub async fn get_service_for_function(
        self: &Arc<Self>,
        identity: &FunctionIdentity,
    ) -> KilnResult<String> {
        let identity = if identity.is_resolved() {
            identity.clone()
        } else {
            self.load_function(identity)?.identity()
        };

        match self.cache.get_or_reserve(&identity) {
            Lookup::Found(address) => Ok(address),
            Lookup::InFlight(waiter) => waiter.wait().await,
            Lookup::Reserved(token) => {
                // Run on a separate task so a caller that gives up does not
                // cancel the specialization other callers are waiting on.
                let manager = Arc::clone(self);
                let handle = tokio::spawn(async move { manager.allocate(token).await });
                handle
                    .await
                    .map_err(|e| KilnError::Internal(format!("allocation task failed: {e}")))?
            }
        }
    }

    /// Refresh the keep-alive of every known address. Returns how many
    /// addresses matched a cache entry.
    pub fn tap(&self, addresses: &[String]) -> usize {
        let hits = addresses.iter().filter(|a| self.cache.tap(a)).count();
        debug!(tapped = addresses.len(), hits, "taps applied");
        hits
    }

    fn load_function(&self, identity: &FunctionIdentity) -> KilnResult<Function> {
        Ok(self
            .ctx
            .store
            .functions()
            .require(&identity.namespace, &identity.name)?)
    }

    /// Resolve the reservation: publish the specialized address on
    /// success, or release waiters with the error.
    async fn allocate(&self, token: Reservation) -> KilnResult<String> {
        match self.specialize_for(token).await {
            Ok(address) => Ok(address),
            Err((token, e)) => {
                self.cache.abort(token, e.clone());
                Err(e)
            }
        }
    }

    /// Allocate and specialize a container, retrying retryable failures on
    /// fresh containers. On success the entry is already committed.
    async fn specialize_for(
        &self,
        token: Reservation,
    ) -> Result<String, (Reservation, KilnError)> {
        let identity = token.identity().clone();
        let (function, env) = match self.resolve_target(&identity) {
            Ok(found) => found,
            Err(e) => return Err((token, e)),
        };
        let pool = self.pool_for(&env);
        let max_attempts = self.ctx.config.max_attempts.max(1);

        let mut token = token;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let container = match pool.acquire().await {
                Ok(container) => container,
                Err(e) => return Err((token, e)),
            };
            let container_id = container.id().to_string();
            info!(%identity, container = %container_id, attempt, "specializing");

            let error = match specialize(&self.ctx, &env, &function, &container).await {
                Ok(service) => match pool.commit_specialized(&container_id, &service, token) {
                    Ok(()) => {
                        info!(%identity, address = %service.address, container = %container_id, "specialized");
                        return Ok(service.address);
                    }
                    Err(returned) => {
                        token = returned;
                        // Reclaimed while we were working; its service must go too.
                        if let Err(e) = self
                            .ctx
                            .orchestrator
                            .delete_service(&service.namespace, &service.name)
                            .await
                        {
                            warn!(service = %service.name, error = %e, "failed to delete service of reclaimed container");
                        }
                        KilnError::Orchestrator(format!(
                            "container {container_id} was reclaimed during specialization"
                        ))
                    }
                },
                Err(failure) => {
                    if failure.timed_out {
                        warn!(container = %container_id, "call timed out; leaving container for the reaper");
                    } else {
                        pool.terminate(&container_id).await;
                    }
                    failure.error
                }
            };

            if !error.is_retryable() || attempt >= max_attempts {
                error!(%identity, attempt, error = %error, "specialization failed");
                return Err((token, error));
            }
            warn!(%identity, attempt, error = %error, "specialization attempt failed, retrying");
        }
    }

    /// The stored function for `identity`, which must be its current
    /// revision, and the environment it runs in.
    fn resolve_target(&self, identity: &FunctionIdentity) -> KilnResult<(Function, Environment)> {
        let function = self.load_function(identity)?;
        if function.identity() != *identity {
            return Err(KilnError::NotFound(format!(
                "{identity} is not the current revision (current is {})",
                function.metadata.content_version()
            )));
        }
        let env = self
            .ctx
            .store
            .environments()
            .require(&function.metadata.namespace, &function.spec.environment_name)?;
        Ok((function, env))
    }

    // ── Reclamation ────────────────────────────────────────────────

    async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.ctx.config.sweep_interval);
        debug!("reaper starting");

        loop {
            tokio::select! {
                _ = tick.tick() => self.reap().await,
                _ = shutdown.changed() => {
                    debug!("reaper shutting down");
                    break;
                }
            }
        }
    }

    /// One reclamation pass: evict idle cache entries, tear down their
    /// containers, and force-terminate containers stuck specializing.
    pub async fn reap(&self) {
        let evicted = self.cache.sweep(self.ctx.config.idle_timeout);
        for entry in evicted {
            self.reclaim(entry).await;
        }

        let pools: Vec<Arc<GenericPool>> = self.pools.lock().values().cloned().collect();
        for pool in pools {
            for container_id in pool.stale_specializing(self.ctx.config.specializing_stale_after) {
                warn!(
                    environment = %pool.key(),
                    container = %container_id,
                    "container stuck specializing, terminating"
                );
                pool.terminate(&container_id).await;
            }
        }
    }

    async fn reclaim(&self, entry: Evicted) {
        let pool = self
            .pools
            .lock()
            .values()
            .find(|p| p.contains(&entry.container_id))
            .cloned();
        match pool {
            Some(pool) => {
                info!(
                    identity = %entry.identity,
                    address = %entry.address,
                    container = %entry.container_id,
                    "reclaiming idle function instance"
                );
                pool.terminate(&entry.container_id).await;
            }
            None => {
                warn!(container = %entry.container_id, "evicted container belongs to no pool");
                if let Err(e) = self
                    .ctx
                    .orchestrator
                    .delete_container(&entry.container_id)
                    .await
                {
                    warn!(container = %entry.container_id, error = %e, "failed to delete container");
                }
            }
        }
    }

    /// Stop background tasks and tear down every pool, emptying the cache
    /// of their entries.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.reaper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let pools: Vec<Arc<GenericPool>> = self.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown().await;
        }
        info!("pool manager stopped");
    }
}
