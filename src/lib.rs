//! `hookrelay` captures HTTP requests and relays them to other endpoints later.
//!
//! A caller obtains an identifier and points a webhook producer at `/hook/{id}`. Every request
//! arriving there is normalized into a self-describing JSON record (headers, query parameters,
//! form fields, uploaded files, JSON or raw body) and written to disk. Any stored record can then
//! be relayed to an arbitrary `http`/`https` URL, which reconstructs an equivalent `POST` request
//! and reports a bounded summary of the response.
//!
//! # Getting Started
//! ```no_run
//! use hookrelay::server::HookServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = HookServerBuilder::new()
//!         .port(5000)
//!         .storage_dir("storage")
//!         .build()?;
//!
//!     server.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Routes
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /new` | Issues a fresh identifier |
//! | `ANY /hook/{id}` | Captures the request |
//! | `GET /view/{id}` | Lists record file names, newest first |
//! | `GET /view/{id}/records/{file}` | Returns one record |
//! | `GET /view/{id}/uploads/{file}` | Returns a stored upload |
//! | `POST /view/{id}/relay` | Relays a record, body `{"url": ..., "f": ..., "mode": ...}` |
//!
//! # Relaying
//! The body of a relayed request is chosen in this order: stored files produce
//! `multipart/form-data`, form fields produce `application/x-www-form-urlencoded`, a JSON object
//! or array produces `application/json` and everything else is sent as the raw body. Query
//! parameters of the target URL win over recorded ones. Hop-by-hop headers, `Host` and cookies
//! are never forwarded.
//!
//! The engine can also be used without the HTTP surface through [`server::capture`],
//! [`server::relay`] and [`server::store`].

pub mod common;
pub mod server;

pub use common::data::{
    CapturedRequest, Identifier, MultiValue, RelayMode, RelayRequest, RelaySummary, StoredFile,
};
pub use server::{HookServer, HookServerBuilder};
