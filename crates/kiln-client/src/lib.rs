//! kiln-client — what the router uses to reach the pool manager.
//!
//! ```text
//!  router ──get_service_for_function──► POST /v2/getServiceForFunction
//!     │
//!     └──tap_service(addr)──► mailbox ──► TapBuffer ──every tap_interval──►
//!                            (bounded)    (dedup)      POST /v2/tapService
//! ```
//!
//! Lookups are synchronous request/response. Taps never wait on the
//! network: they are queued, deduplicated, and flushed in one batch per
//! interval.

mod client;
mod tap;

pub use client::ExecutorClient;
pub use tap::TapBuffer;
