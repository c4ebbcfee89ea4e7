//! kiln-core — shared types for the Kiln warm-container scheduler.
//!
//! Everything that crosses a crate or process boundary lives here:
//!
//! - **Domain types**: functions, environments, packages, fetch and load
//!   requests, and the `FunctionIdentity` used as the service cache key
//! - **Error taxonomy**: `KilnError`, with its mapping to and from HTTP status
//! - **Checksums**: sha256 digest helpers for package verification
//! - **Configuration**: the `kiln.toml` parser
//! - **HTTP client**: a thin hyper client used for every outbound call
//! - **API envelope**: the `{success, data, error}` JSON wrapper

pub mod api;
pub mod checksum;
pub mod config;
pub mod error;
pub mod http;
pub mod types;

pub use api::ApiResponse;
pub use config::KilnConfig;
pub use error::{KilnError, KilnResult};
pub use crate::http::{HttpClient, HttpError, HttpResponse};
pub use types::*;
