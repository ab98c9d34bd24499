//! Connections and Command Dispatch
//!
//! A [`Connection`] is one logical link to a database server. It is opened
//! through a [`Connector`], which produces a boxed [`Transport`]; the transport
//! only knows how to move one request document and its reply.
//!
//! # Lifecycle
//! - `open`: connect to the first reachable endpoint and run the `hello` handshake
//! - `send_command`: append `$db`, round-trip, check `ok`
//! - `close`: drop the transport (idempotent)
//!
//! A transport error during `send_command` marks the connection
//! [`SocketState::Broken`]; the pool discards broken connections on release.
//! Nothing here retries.
//!
//! # Transports
//! - [`wire`]: TCP with `OP_MSG` framing
//! - [`memory`]: in-process server used by tests and the `--memory` CLI switch

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{DocpoolError, Result};
use crate::uri::{ConnectionConfig, Endpoint};

pub mod memory;
pub mod wire;

/// Moves request documents to a server and returns its replies
///
/// Implementations report link-level problems as
/// [`DocpoolError::TransportFailure`].
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Send one request and wait for the matching reply
    async fn round_trip(&mut self, request: &Document) -> Result<Document>;

    /// Adopt the limits the server reported in its handshake
    fn apply_limits(&mut self, _server: &ServerDescription) {}

    /// Release the underlying link
    fn shutdown(&mut self) {}
}

/// Produces transports for endpoints
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Establish a transport to `endpoint`
    ///
    /// Failures are reported as [`DocpoolError::ConnectFailure`].
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>>;
}

/// State of a connection's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketState {
    Disconnected,
    Connected,
    Broken,
}

/// Server limits reported by the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescription {
    pub max_wire_version: i32,
    pub max_bson_object_size: usize,
    pub max_message_size_bytes: usize,
    pub max_write_batch_size: usize,
}

impl Default for ServerDescription {
    fn default() -> Self {
        Self {
            max_wire_version: 0,
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: wire::DEFAULT_MAX_MESSAGE_SIZE,
            max_write_batch_size: 100_000,
        }
    }
}

impl ServerDescription {
    /// Read limits from a `hello` reply, keeping defaults for missing fields
    #[must_use]
    pub fn from_hello(reply: &Document) -> Self {
        let defaults = Self::default();
        let limit = |key: &str, fallback: usize| {
            reply.get(key).and_then(as_i64).filter(|v| *v > 0).map_or(fallback, |v| v as usize)
        };
        Self {
            max_wire_version: reply.get("maxWireVersion").and_then(as_i64).unwrap_or(0) as i32,
            max_bson_object_size: limit("maxBsonObjectSize", defaults.max_bson_object_size),
            max_message_size_bytes: limit("maxMessageSizeBytes", defaults.max_message_size_bytes),
            max_write_batch_size: limit("maxWriteBatchSize", defaults.max_write_batch_size),
        }
    }
}

/// A command addressed to one database
///
/// The command name is the first key of the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    target_database: String,
    payload: Document,
}

impl Command {
    /// Build a command; the payload must not be empty
    pub fn new(target_database: impl Into<String>, payload: Document) -> Result<Self> {
        let target_database = target_database.into();
        if target_database.is_empty() {
            return Err(DocpoolError::invalid_input("command database name is empty"));
        }
        let name = payload
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| DocpoolError::invalid_input("command payload is empty"))?;
        Ok(Self { name, target_database, payload })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn target_database(&self) -> &str {
        &self.target_database
    }

    #[must_use]
    pub fn payload(&self) -> &Document {
        &self.payload
    }

    /// Payload with `$db` appended, as sent on the wire
    #[must_use]
    pub fn to_request(&self) -> Document {
        let mut request = self.payload.clone();
        request.insert("$db", self.target_database.as_str());
        request
    }
}

/// Decoded server reply
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub ok: bool,
    pub document: Document,
    pub error_message: Option<String>,
}

impl CommandReply {
    #[must_use]
    pub fn from_document(document: Document) -> Self {
        let ok = document.get("ok").and_then(as_f64).is_some_and(|v| v == 1.0);
        let error_message = document.get_str("errmsg").ok().map(str::to_string);
        Self { ok, document, error_message }
    }

    /// Server error code, 0 when absent
    #[must_use]
    pub fn code(&self) -> i32 {
        self.document.get("code").and_then(as_i64).unwrap_or(0) as i32
    }

    fn into_failure(self) -> DocpoolError {
        let code = self.code();
        let message = self.error_message.unwrap_or_else(|| "command failed".to_string());
        DocpoolError::command_failure(code, message)
    }
}

/// A single logical link to a server
pub struct Connection {
    id: u64,
    config: Arc<ConnectionConfig>,
    endpoint: Endpoint,
    state: SocketState,
    transport: Option<Box<dyn Transport>>,
    server: ServerDescription,
    pool_closed: Option<Arc<AtomicBool>>,
    /// Set while a request awaits its reply; still set if that wait was abandoned
    in_flight: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to the first reachable endpoint and perform the handshake
    ///
    /// Each endpoint is tried once, in source order. `connectTimeoutMS` bounds
    /// every attempt.
    pub async fn open(
        id: u64,
        config: Arc<ConnectionConfig>,
        connector: &dyn Connector,
    ) -> Result<Self> {
        let mut last_error = None;

        for endpoint in &config.endpoints {
            let attempt = handshake(connector, endpoint, &config);
            let outcome = match config.connect_timeout() {
                Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                    Err(DocpoolError::connect_failure(format!(
                        "timed out after {}ms connecting to {endpoint}",
                        limit.as_millis()
                    )))
                }),
                None => attempt.await,
            };

            match outcome {
                Ok((transport, server)) => {
                    debug!(connection = id, %endpoint, "connection established");
                    return Ok(Self {
                        id,
                        config: Arc::clone(&config),
                        endpoint: endpoint.clone(),
                        state: SocketState::Connected,
                        transport: Some(transport),
                        server,
                        pool_closed: None,
                        in_flight: false,
                    });
                }
                Err(err) => {
                    warn!(connection = id, %endpoint, error = %err, "endpoint unavailable");
                    last_error = Some(err);
                }
            }
        }

        Err(match last_error {
            Some(DocpoolError::ConnectFailure(message)) => DocpoolError::ConnectFailure(message),
            Some(other) => DocpoolError::connect_failure(other.message()),
            None => DocpoolError::connect_failure("no endpoints configured"),
        })
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current state; a connection whose last request was abandoned before
    /// its reply arrived reports `Broken`
    #[must_use]
    pub const fn state(&self) -> SocketState {
        if self.in_flight {
            SocketState::Broken
        } else {
            self.state
        }
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state() == SocketState::Broken
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn server(&self) -> &ServerDescription {
        &self.server
    }

    /// Tie this connection to a pool's shutdown flag
    pub(crate) fn attach_pool(&mut self, closed: Arc<AtomicBool>) {
        self.pool_closed = Some(closed);
    }

    /// Send a command and decode the reply
    ///
    /// `ok != 1` becomes [`DocpoolError::CommandFailure`] carrying the server
    /// message. A transport error leaves the connection broken.
    pub async fn send_command(&mut self, command: &Command) -> Result<CommandReply> {
        if self.pool_closed.as_ref().is_some_and(|closed| closed.load(Ordering::Acquire)) {
            self.close();
            return Err(DocpoolError::PoolClosed);
        }

        if self.state() != SocketState::Connected {
            let state = self.state();
            self.mark_broken();
            return Err(DocpoolError::transport_failure(format!(
                "connection {} is not connected ({state:?})",
                self.id
            )));
        }

        let Some(transport) = self.transport.as_mut() else {
            self.mark_broken();
            return Err(DocpoolError::transport_failure(format!(
                "connection {} has no transport",
                self.id
            )));
        };

        debug!(
            connection = self.id,
            command = command.name(),
            db = command.target_database(),
            "send"
        );
        self.in_flight = true;
        let outcome = transport.round_trip(&command.to_request()).await;
        self.in_flight = false;
        match outcome {
            Ok(document) => {
                let reply = CommandReply::from_document(document);
                if reply.ok {
                    Ok(reply)
                } else {
                    Err(reply.into_failure())
                }
            }
            Err(err) if err.is_transport() => {
                warn!(connection = self.id, error = %err, "transport failed, connection broken");
                self.mark_broken();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Release the transport; safe to call repeatedly
    pub fn close(&mut self) {
        if self.in_flight {
            self.in_flight = false;
            self.state = SocketState::Broken;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
            debug!(connection = self.id, "connection closed");
        }
        if self.state != SocketState::Broken {
            self.state = SocketState::Disconnected;
        }
    }

    fn mark_broken(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
        self.in_flight = false;
        self.state = SocketState::Broken;
    }
}

async fn handshake(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    config: &ConnectionConfig,
) -> Result<(Box<dyn Transport>, ServerDescription)> {
    let mut transport = connector.connect(endpoint).await.map_err(|err| match err {
        DocpoolError::ConnectFailure(message) => DocpoolError::ConnectFailure(message),
        other => DocpoolError::connect_failure(format!("{endpoint}: {}", other.message())),
    })?;

    let mut hello = doc! { "hello": 1 };
    if let Some(app_name) = config.app_name() {
        hello.insert("client", doc! { "application": { "name": app_name } });
    }
    hello.insert("$db", "admin");

    let document = transport.round_trip(&hello).await.map_err(|err| {
        DocpoolError::connect_failure(format!("{endpoint}: handshake failed: {}", err.message()))
    })?;

    let reply = CommandReply::from_document(document);
    if !reply.ok {
        transport.shutdown();
        let message = reply.error_message.unwrap_or_else(|| "handshake rejected".to_string());
        return Err(DocpoolError::connect_failure(format!("{endpoint}: {message}")));
    }

    let server = ServerDescription::from_hello(&reply.document);
    transport.apply_limits(&server);
    Ok((transport, server))
}

/// Server-side cursor drained through `getMore`
///
/// Borrows the connection for its whole life, so the connection cannot be
/// released while a cursor is open.
#[derive(Debug)]
pub struct Cursor<'a> {
    connection: &'a mut Connection,
    database: String,
    collection: String,
    id: i64,
    buffer: VecDeque<Document>,
    batch_size: Option<i32>,
}

impl<'a> Cursor<'a> {
    /// Build a cursor from a `find`/`aggregate` reply
    pub fn from_reply(
        connection: &'a mut Connection,
        database: impl Into<String>,
        reply: &CommandReply,
        batch_size: Option<i32>,
    ) -> Result<Self> {
        let cursor = reply
            .document
            .get_document("cursor")
            .map_err(|e| DocpoolError::serialization(format!("reply has no cursor: {e}")))?;
        let (id, namespace, batch) = cursor_fields(cursor, "firstBatch")?;
        let collection = namespace.split_once('.').map_or(namespace.as_str(), |(_, coll)| coll);

        Ok(Self {
            connection,
            database: database.into(),
            collection: collection.to_string(),
            id,
            buffer: batch.into(),
            batch_size,
        })
    }

    /// Server cursor id; 0 once exhausted
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// Next document, fetching another batch when the buffer runs dry
    pub async fn next(&mut self) -> Result<Option<Document>> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                return Ok(Some(document));
            }
            if self.id == 0 {
                return Ok(None);
            }
            self.get_more().await?;
        }
    }

    /// Drain every remaining document
    pub async fn collect_all(mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::with_capacity(self.buffer.len());
        while let Some(document) = self.next().await? {
            documents.push(document);
        }
        Ok(documents)
    }

    /// Kill the server cursor if it is still open
    pub async fn close(mut self) -> Result<()> {
        if self.id != 0 {
            let payload = doc! {
                "killCursors": self.collection.as_str(),
                "cursors": [Bson::Int64(self.id)],
            };
            self.connection.send_command(&Command::new(self.database.as_str(), payload)?).await?;
            self.id = 0;
        }
        Ok(())
    }

    async fn get_more(&mut self) -> Result<()> {
        let mut payload = doc! {
            "getMore": Bson::Int64(self.id),
            "collection": self.collection.as_str(),
        };
        if let Some(batch_size) = self.batch_size {
            payload.insert("batchSize", batch_size);
        }
        let reply =
            self.connection.send_command(&Command::new(self.database.as_str(), payload)?).await?;
        let cursor = reply
            .document
            .get_document("cursor")
            .map_err(|e| DocpoolError::serialization(format!("getMore reply has no cursor: {e}")))?;
        let (id, _, batch) = cursor_fields(cursor, "nextBatch")?;
        self.id = id;
        self.buffer.extend(batch);
        Ok(())
    }
}

fn cursor_fields(cursor: &Document, batch_key: &str) -> Result<(i64, String, Vec<Document>)> {
    let id = cursor
        .get("id")
        .and_then(as_i64)
        .ok_or_else(|| DocpoolError::serialization("cursor reply has no id"))?;
    let namespace = cursor.get_str("ns").unwrap_or_default().to_string();
    let batch = cursor
        .get_array(batch_key)
        .map_err(|e| DocpoolError::serialization(format!("cursor reply has no {batch_key}: {e}")))?
        .iter()
        .filter_map(|value| value.as_document().cloned())
        .collect();
    Ok((id, namespace, batch))
}

/// Numeric BSON value widened to `i64`
pub(crate) fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Numeric BSON value widened to `f64`
pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}
