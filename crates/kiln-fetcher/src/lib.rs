//! kiln-fetcher — the code-delivery sidecar.
//!
//! Runs next to every runtime container and shares a volume with it.
//! Given a [`FetchRequest`](kiln_core::FetchRequest) it places code at
//! `<shared volume>/<filename>`:
//!
//! ```text
//!   POST /  {fetchType, function, url, filename}
//!        │
//!        ├── url ─────────────► download ──────────────────┐
//!        └── source/deployment                             │
//!               │ FunctionSource (store or pool manager)   │
//!               ├── literal ───► write bytes ──────────────┤
//!               └── reference ─► download ─► sha256 check ─┤
//!                                                          ▼
//!                                   <filename>.tmp ──rename──► <filename>
//! ```
//!
//! Content is only ever visible at its final path after it has been
//! fully written and verified.

pub mod fetcher;
pub mod server;
pub mod source;

pub use fetcher::Fetcher;
pub use server::router;
pub use source::{FunctionSource, RemoteFunctionSource};
