//! # Cairn
//!
//! A synchronous client for Redis-compatible key-value stores.
//!
//! Cairn covers the client side of the stack:
//! - RESP2 request encoding and incremental reply parsing
//! - Blocking TCP and Unix socket connections with init-command replay
//! - Client-side sharding over a weighted consistent-hash ring
//! - Server-assisted clusters with `MOVED`/`ASK` redirection
//! - Primary/replica read routing
//! - Pipelines (standard, safe, fire-and-forget, atomic) and optimistic
//!   `WATCH`/`MULTI`/`EXEC` transactions
//!
//! ## Example
//!
//! ```no_run
//! use cairn::{Client, Commands, Config, Result};
//!
//! fn main() -> Result<()> {
//!     let config = Config::new().node("tcp://127.0.0.1:6379")?;
//!     let mut client = Client::new(config)?;
//!     client.set("greeting", "hello")?;
//!     let value = client.get("greeting")?;
//!     assert_eq!(value.as_str(), Some("hello"));
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/cairn/0.1.0")]
#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::type_complexity,            // Factory closures and fn-pointer tables
    clippy::new_without_default,
    clippy::len_without_is_empty
)]

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

/// High-level client facade.
pub mod client;
/// Sharded and server-assisted cluster routing.
pub mod cluster;
/// Command model, command table and reply post-processing.
pub mod command;
/// Client configuration.
pub mod config;
/// Connection trait, parameters and socket transport.
pub mod connection;
/// Error types and result aliases.
pub mod error;
/// Pipeline executors.
pub mod pipeline;
/// RESP2 wire codec.
pub mod protocol;
/// Primary/replica routing.
pub mod replication;
/// `MULTI`/`EXEC` transactions.
pub mod transaction;

// ─────────────────────────────────────────────────────────────────────────────
// Common Re-exports
// ─────────────────────────────────────────────────────────────────────────────

// Error handling
pub use error::{Error, Result};

// Protocol
pub use protocol::{Reply, ReplyParser};

// Commands
pub use command::{Argument, Command, CommandTable, KeyPrefix, Value};

// Connections
pub use connection::{Connection, ConnectionParameters, StreamConnection};

// Client
pub use client::{Client, Commands};
pub use config::{Config, Mode, RingAlgorithm};

// Batches
pub use pipeline::{Pipeline, PipelineMode};
pub use transaction::{Transaction, TransactionOptions};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Crate version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default server port.
pub const DEFAULT_PORT: u16 = 6379;

/// Maximum bulk string size accepted from the wire (512 MiB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum element count accepted for one array reply.
pub const MAX_ARRAY_LEN: usize = 16 * 1024 * 1024;

/// Maximum nesting of array replies accepted from the wire.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Number of hash slots in a server-assisted cluster.
pub const CLUSTER_SLOTS: usize = 16384;
