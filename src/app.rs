//! Application Handle
//!
//! [`App`] owns the connection pool for the lifetime of a CLI run. Every mode
//! checks one connection out, runs, and returns it, including on failure. The
//! pool is shut down by [`App::shutdown`] or, failing that, when the handle is
//! dropped.

use clap::ValueEnum;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::catalog::{self, CATEGORIES_COLLECTION};
use crate::config::ClientSettings;
use crate::connection::memory::MemoryServer;
use crate::connection::wire::TcpConnector;
use crate::connection::{Connection, Connector};
use crate::error::{DocpoolError, Result};
use crate::executor::{self, IndexSpec};
use crate::output::{document_to_json, Metadata, SuccessEnvelope};
use crate::pool::{Pool, PoolStatus};

/// What a run does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Liveness check against the database
    Ping,
    /// Drop the database
    Drop,
    /// Insert the sample categories and products
    Insert,
    /// Index products by price and category
    Index,
    /// Report product counts and list categories
    Find,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Drop => "drop",
            Self::Insert => "insert",
            Self::Index => "index",
            Self::Find => "find",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one mode
#[derive(Debug, Clone)]
pub struct Outcome {
    pub data: Value,
    pub documents_returned: Option<usize>,
}

/// Explicitly owned client state: settings plus the pool
#[derive(Debug)]
pub struct App {
    settings: ClientSettings,
    pool: Pool,
}

impl App {
    /// Build an app over an arbitrary connector
    pub fn new(settings: ClientSettings, connector: Arc<dyn Connector>) -> Result<Self> {
        let pool = Pool::new(settings.connection.clone(), connector, settings.pool)?;
        Ok(Self { settings, pool })
    }

    /// Build an app talking TCP to the configured servers
    pub fn connect(settings: ClientSettings) -> Result<Self> {
        Self::new(settings, Arc::new(TcpConnector))
    }

    /// Build an app over a fresh in-process server
    pub fn in_memory(settings: ClientSettings) -> Result<Self> {
        Self::new(settings, Arc::new(MemoryServer::new().connector()))
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.settings.database
    }

    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Run `mode` on one pooled connection
    pub async fn run(&self, mode: Mode) -> Result<Outcome> {
        let mut connection = self.pool.checkout(self.settings.pool.acquire_timeout).await?;
        debug!(%mode, connection = connection.id(), "running");
        dispatch(mode, &mut connection, &self.settings.database).await
    }

    /// Run `mode` and wrap the result in a success envelope
    pub async fn run_enveloped(&self, mode: Mode) -> Result<SuccessEnvelope<Value>> {
        let started = Instant::now();
        let outcome = self.run(mode).await?;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut meta = Metadata::new(elapsed).with_pool(self.status());
        if let Some(count) = outcome.documents_returned {
            meta = meta.with_documents(count);
        }
        Ok(SuccessEnvelope::new(mode.as_str(), self.database(), outcome.data, meta))
    }

    /// Close the pool; later runs fail with `PoolClosed`
    pub fn shutdown(&self) {
        self.pool.shutdown();
        info!(status = %self.pool.status(), "client shut down");
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

async fn dispatch(mode: Mode, connection: &mut Connection, database: &str) -> Result<Outcome> {
    let data = match mode {
        Mode::Ping => {
            let reply = executor::ping(connection, database).await?;
            document_to_json(&reply.document)
        }
        Mode::Drop => {
            executor::drop_database(connection, database).await?;
            json!({ "dropped": database })
        }
        Mode::Insert => to_json(&catalog::seed_store(connection, database).await?)?,
        Mode::Index => {
            let reply = catalog::index_products(connection, database).await?;
            let names: Vec<String> =
                catalog::product_indexes().iter().map(IndexSpec::index_name).collect();
            json!({ "indexes": names, "reply": document_to_json(&reply.document) })
        }
        Mode::Find => {
            let report = catalog::product_report(connection, database).await?;
            let categories =
                executor::find(connection, database, CATEGORIES_COLLECTION, None, None).await?;
            let count = categories.len();
            let categories: Vec<Value> = categories.iter().map(document_to_json).collect();
            let mut data = to_json(&report)?;
            data["categories"] = Value::Array(categories);
            return Ok(Outcome { data, documents_returned: Some(count) });
        }
    };
    Ok(Outcome { data, documents_returned: None })
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DocpoolError::serialization(e.to_string()))
}
