//! kiln-cache — the function service cache.
//!
//! Maps a [`FunctionIdentity`](kiln_core::FunctionIdentity) to the
//! address of the container specialized for it.
//!
//! ```text
//!   get_or_reserve(id)
//!        │
//!        ├── entry present ──────────► Found(address)   (refreshes last-used)
//!        ├── reservation in flight ──► InFlight(waiter) (joins that outcome)
//!        └── otherwise ──────────────► Reserved(token)
//!                                           │
//!                         commit(token, addr, container) ─► waiters get addr
//!                         abort(token, err) / drop ───────► waiters get err
//! ```
//!
//! The cache holds container ids, never containers: `sweep` hands idle
//! entries back to the caller, which owns reclamation.

pub mod cache;

pub use cache::{
    CacheEntrySnapshot, CacheStats, Evicted, FunctionServiceCache, Lookup, Reservation, Waiter,
};
