//! Docpool - Connection-Pooled Document Database Client
//!
//! A small client core for MongoDB-compatible servers: connection strings,
//! connections over a pluggable transport, a bounded FIFO connection pool, and
//! a command executor for the handful of operations the `docpool` CLI needs.
//!
//! # Control Flow
//! Acquire a [`Connection`] from the [`Pool`], pass it to the [`executor`]
//! functions, release it back to the pool.
//!
//! # Module Organization
//! - [`error`] - Error taxonomy and stable error codes
//! - [`uri`] - Connection string parsing
//! - [`connection`] - Connections, commands, cursors, transports
//! - [`pool`] - Connection pool
//! - [`executor`] - Ping, insert, count, index, drop, find
//! - [`catalog`] - Deterministic sample data and store workflows
//! - [`config`] - Client settings resolution
//! - [`output`] - JSON output envelopes
//! - [`app`] - Application handle driving the CLI modes

pub mod app;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod output;
pub mod pool;
pub mod uri;

pub use app::{App, Mode, Outcome};
pub use config::{ClientSettings, ProfileRegistry, SettingsOverrides, StoredProfile};
pub use connection::{
    Command, CommandReply, Connection, Connector, Cursor, ServerDescription, SocketState, Transport,
};
pub use error::{DocpoolError, Result};
pub use executor::IndexSpec;
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use pool::{Pool, PoolOptions, PoolStatus, PooledConnection};
pub use uri::{ConnectionConfig, Endpoint};
