//! kiln-store — embedded metadata store for Kiln definitions.
//!
//! Backed by [redb](https://docs.rs/redb). Functions, environments and
//! HTTP triggers each live in their own table, keyed `{namespace}/{name}`,
//! with the definition JSON-serialized into the value column.
//!
//! # Versioning
//!
//! Every write goes through a [`Repository`], which assigns a `uid` on
//! create and bumps `resourceVersion` on every write. The pair forms the
//! content version that keys the function service cache, so any update
//! to a function invalidates its warm instances.
//!
//! The `MetadataStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use repository::{Repository, Resource};
pub use store::MetadataStore;
