//! FunctionServiceCache with single-flight reservations and idle sweep.
//!
//! All bookkeeping (entries, the address index, and in-flight
//! reservations) sits behind one `parking_lot::Mutex`. The lock is only
//! held for map operations; no await point or network call happens
//! under it. Last-used timestamps are written only under the lock, so a
//! tap that lands before a sweep reads the entry is always observed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_core::{FunctionIdentity, KilnError, KilnResult};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Outcome = Option<KilnResult<String>>;

/// Result of [`FunctionServiceCache::get_or_reserve`].
#[derive(Debug)]
pub enum Lookup {
    /// A live entry exists; its last-used time was refreshed.
    Found(String),
    /// The caller owns the allocation for this identity and must commit
    /// or abort the token.
    Reserved(Reservation),
    /// Another caller is allocating; wait for its outcome.
    InFlight(Waiter),
}

/// An entry removed from the cache whose container must be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub identity: FunctionIdentity,
    pub address: String,
    pub container_id: String,
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntrySnapshot {
    pub identity: FunctionIdentity,
    pub address: String,
    pub container_id: String,
    pub idle_for: Duration,
}

/// Accumulated cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry {
    address: String,
    container_id: String,
    last_used: Instant,
}

struct Pending {
    token_id: u64,
    tx: watch::Sender<Outcome>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<FunctionIdentity, CacheEntry>,
    /// address → identity, for taps.
    by_address: HashMap<String, FunctionIdentity>,
    pending: HashMap<FunctionIdentity, Pending>,
    next_token: u64,
    stats: CacheStats,
}

impl Inner {
    fn take_pending(&mut self, identity: &FunctionIdentity, token_id: u64) -> Option<Pending> {
        let held = self
            .pending
            .get(identity)
            .is_some_and(|p| p.token_id == token_id);
        if held {
            self.pending.remove(identity)
        } else {
            None
        }
    }

    fn evict(&mut self, identity: &FunctionIdentity) -> Option<Evicted> {
        let entry = self.entries.remove(identity)?;
        if self.by_address.get(&entry.address) == Some(identity) {
            self.by_address.remove(&entry.address);
        }
        self.stats.evictions += 1;
        Some(Evicted {
            identity: identity.clone(),
            address: entry.address,
            container_id: entry.container_id,
        })
    }
}

/// Concurrent identity → address cache. Cheap to clone.
#[derive(Clone, Default)]
pub struct FunctionServiceCache {
    inner: Arc<Mutex<Inner>>,
}

impl FunctionServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address for `identity`, without touching last-used.
    pub fn lookup(&self, identity: &FunctionIdentity) -> Option<String> {
        self.inner
            .lock()
            .entries
            .get(identity)
            .map(|e| e.address.clone())
    }

    /// Return the cached address, join an in-flight allocation, or take
    /// the reservation for a new one.
    pub fn get_or_reserve(&self, identity: &FunctionIdentity) -> Lookup {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(identity) {
            entry.last_used = Instant::now();
            let address = entry.address.clone();
            inner.stats.hits += 1;
            debug!(
                %identity,
                %address,
                cache_hits = inner.stats.hits,
                cache_misses = inner.stats.misses,
                "function service cache hit"
            );
            return Lookup::Found(address);
        }

        if let Some(pending) = inner.pending.get(identity) {
            debug!(%identity, "joining in-flight specialization");
            return Lookup::InFlight(Waiter {
                identity: identity.clone(),
                rx: pending.tx.subscribe(),
            });
        }

        inner.stats.misses += 1;
        inner.next_token += 1;
        let token_id = inner.next_token;
        let (tx, _rx) = watch::channel(None);
        inner
            .pending
            .insert(identity.clone(), Pending { token_id, tx });
        debug!(
            %identity,
            cache_hits = inner.stats.hits,
            cache_misses = inner.stats.misses,
            "function service cache miss, reserved"
        );

        Lookup::Reserved(Reservation {
            cache: self.clone(),
            identity: identity.clone(),
            token_id,
            settled: false,
        })
    }

    /// Publish the address for a reservation and wake its waiters.
    pub fn commit(&self, mut token: Reservation, address: &str, container_id: &str) {
        token.settled = true;
        let identity = token.identity.clone();

        let pending = {
            let mut inner = self.inner.lock();
            let pending = inner.take_pending(&identity, token.token_id);
            if pending.is_some() {
                inner.entries.insert(
                    identity.clone(),
                    CacheEntry {
                        address: address.to_string(),
                        container_id: container_id.to_string(),
                        last_used: Instant::now(),
                    },
                );
                inner
                    .by_address
                    .insert(address.to_string(), identity.clone());
            }
            pending
        };

        match pending {
            Some(p) => {
                info!(%identity, %address, %container_id, "function service cached");
                p.tx.send_replace(Some(Ok(address.to_string())));
            }
            None => warn!(%identity, "commit for a reservation that is no longer held"),
        }
    }

    /// Release a reservation; its waiters receive `err`.
    pub fn abort(&self, mut token: Reservation, err: KilnError) {
        token.settled = true;
        self.release(&token.identity, token.token_id, err);
    }

    fn release(&self, identity: &FunctionIdentity, token_id: u64, err: KilnError) {
        let pending = self.inner.lock().take_pending(identity, token_id);
        if let Some(p) = pending {
            warn!(%identity, error = %err, "specialization aborted");
            p.tx.send_replace(Some(Err(err)));
        }
    }

    /// Refresh last-used for the entry serving `address`.
    ///
    /// Returns false for an unknown address.
    pub fn tap(&self, address: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(identity) = inner.by_address.get(address).cloned() else {
            return false;
        };
        match inner.entries.get_mut(&identity) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove every entry unused for longer than `idle_timeout`.
    pub fn sweep(&self, idle_timeout: Duration) -> Vec<Evicted> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let idle: Vec<FunctionIdentity> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_used) > idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let evicted: Vec<Evicted> = idle.iter().filter_map(|id| inner.evict(id)).collect();
        if !evicted.is_empty() {
            info!(
                count = evicted.len(),
                cache_evictions = inner.stats.evictions,
                remaining = inner.entries.len(),
                "idle function services evicted"
            );
        }
        evicted
    }

    /// Drop the entry for `identity`, if any.
    pub fn remove(&self, identity: &FunctionIdentity) -> Option<Evicted> {
        self.inner.lock().evict(identity)
    }

    /// Drop the entry served by `container_id`, if any.
    pub fn remove_container(&self, container_id: &str) -> Option<Evicted> {
        let mut inner = self.inner.lock();
        let identity = inner
            .entries
            .iter()
            .find(|(_, e)| e.container_id == container_id)
            .map(|(id, _)| id.clone())?;
        inner.evict(&identity)
    }

    pub fn entries(&self) -> Vec<CacheEntrySnapshot> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(identity, e)| CacheEntrySnapshot {
                identity: identity.clone(),
                address: e.address.clone(),
                container_id: e.container_id.clone(),
                idle_for: now.duration_since(e.last_used),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

/// Exclusive right to allocate for one identity.
///
/// Dropping it without [`commit`](FunctionServiceCache::commit) or
/// [`abort`](FunctionServiceCache::abort) aborts with an internal error,
/// so waiters never hang on a panicked or cancelled allocation.
pub struct Reservation {
    cache: FunctionServiceCache,
    identity: FunctionIdentity,
    token_id: u64,
    settled: bool,
}

impl Reservation {
    pub fn identity(&self) -> &FunctionIdentity {
        &self.identity
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("identity", &self.identity)
            .field("token_id", &self.token_id)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.release(
                &self.identity,
                self.token_id,
                KilnError::Internal(format!(
                    "specialization of {} was abandoned",
                    self.identity
                )),
            );
        }
    }
}

/// Handle on another caller's in-flight allocation.
#[derive(Debug)]
pub struct Waiter {
    identity: FunctionIdentity,
    rx: watch::Receiver<Outcome>,
}

impl Waiter {
    /// Wait for the reservation holder's outcome.
    pub async fn wait(mut self) -> KilnResult<String> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| {
                Err(KilnError::Internal(format!(
                    "no outcome for {}",
                    self.identity
                )))
            }),
            Err(_) => Err(KilnError::Internal(format!(
                "specialization of {} ended without an outcome",
                self.identity
            ))),
        }
    }
}
