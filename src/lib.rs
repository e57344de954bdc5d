//! # EmberKV - A Persistent In-Memory Key-Value Store
//!
//! EmberKV serves string keys and opaque byte values over a small HTTP
//! API and keeps them across restarts with two cooperating persistence
//! mechanisms: an append-only log of every write and periodic full-state
//! snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           EmberKV                            │
//! │                                                              │
//! │  ┌────────────┐     ┌─────────────┐     ┌────────────────┐   │
//! │  │ HTTP (axum)│────>│  KvService  │────>│  ShardedStore  │   │
//! │  │  /v1/*     │     │ coordinator │     │ N x RwLock map │   │
//! │  └────────────┘     └──┬───┬───┬──┘     └────────────────┘   │
//! │                        │   │   │                             │
//! │              ┌─────────┘   │   └──────────┐                  │
//! │        ┌─────┴─────┐ ┌─────┴─────┐ ┌──────┴───────┐          │
//! │        │ TtlIndex  │ │ AppendLog │ │ SnapshotStore│          │
//! │        │ + expirer │ │  SET/DEL  │ │  dump-*.rdb  │          │
//! │        └───────────┘ └───────────┘ └──────────────┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability model
//!
//! - Every acknowledged write is appended to the log first (no per-write
//!   fsync; the file is synced on rewrite and shutdown).
//! - Snapshots are written on demand, on rule triggers, and at shutdown.
//! - On startup an existing append log wins; snapshots are only read when
//!   the log is disabled or absent.
//! - A corrupt log tail is truncated at the first unparseable line.
//!
//! ## Expiration
//!
//! Keys may carry a TTL in seconds. Expired keys read as absent
//! immediately (lazy expiry) and are evicted by a background worker
//! driven by a min-heap of deadlines (active expiry).
//!
//! ## Quick start
//!
//! ```ignore
//! use emberkv::{Config, KvService};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let svc = KvService::start(Config::default())?;
//!     svc.set("name", Bytes::from("ember"), 0)?;
//!
//!     let app = emberkv::server::router(Arc::clone(&svc));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:6380").await?;
//!     axum::serve(listener, app).await?;
//!     svc.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! - [`storage`]: sharded map, TTL index, append log, snapshots
//! - [`service`]: the coordinator tying storage and persistence together
//! - [`server`]: the axum HTTP surface
//! - [`protocol`]: envelope and request/response types
//! - [`client`]: envelope-aware HTTP client used by the CLI
//! - [`config`]: YAML configuration

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod service;
pub mod storage;

pub use client::{Client, ClientError};
pub use config::Config;
pub use error::{KvError, Result};
pub use service::KvService;
pub use storage::{
    AppendLog, PersistRecord, ShardedStore, SnapshotStore, Storage, StoreOptions, TtlExpirer,
    TtlIndex,
};

/// The default port the server listens on.
pub const DEFAULT_PORT: u16 = 6380;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
