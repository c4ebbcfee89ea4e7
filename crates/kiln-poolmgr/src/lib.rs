//! kiln-poolmgr — the generic pool manager.
//!
//! Keeps warm, unspecialized runtime containers per environment and turns
//! them into function instances on demand.
//!
//! # Architecture
//!
//! ```text
//!  get_service_for_function(id)
//!        │
//!        ▼
//!  FunctionServiceCache ──hit──► address
//!        │ miss (reservation)
//!        ▼
//!  GenericPool[env].acquire ──► idle container | create | PoolExhausted
//!        │
//!        ▼
//!  fetcher POST / ──► runtime load ──► create service ──► label ──► commit
//!
//!  replenisher (per pool)   tops idle containers up to the target
//!  reaper (per manager)     sweeps idle cache entries, terminates their
//!                           containers and any stuck specializing
//! ```
//!
//! All cluster access goes through the [`Orchestrator`] trait, so the same
//! manager runs against [`LocalOrchestrator`] or a real cluster backend.

pub mod cleanup;
pub mod context;
pub mod manager;
pub mod orchestrator;
pub mod pool;
mod specialize;

pub use cleanup::cleanup_stale_resources;
pub use context::{ServiceContext, generate_instance_id};
pub use manager::PoolManager;
pub use orchestrator::{
    ContainerInfo, ContainerSpec, Labels, LocalOrchestrator, Orchestrator, ServiceInfo,
    ServiceSpec,
};
pub use pool::{ContainerState, GenericPool, PoolStats};
