//! In-Process Document Server
//!
//! [`MemoryServer`] answers the same command documents a real server would,
//! so connections, the pool and the executor can be exercised without a
//! network. [`MemoryConnector`] hands out [`MemoryTransport`]s bound to one
//! server.
//!
//! # Supported Commands
//! `hello`/`isMaster`, `ping`, `insert`, `find`, `getMore`, `killCursors`,
//! `aggregate` (`$match`, `$skip`, `$limit`, `$group`, `$count`), `count`,
//! `createIndexes`, `dropDatabase`.
//!
//! # Fault Injection
//! - [`MemoryServer::set_refuse_connections`] / [`MemoryServer::refuse_host`]
//! - [`MemoryServer::break_links`]: every live transport fails its next request
//! - [`MemoryServer::break_links_after`]: the same, after a number of replies
//! - [`MemoryServer::with_message_limits`]: oversized requests drop the link
//! - [`MemoryServer::set_legacy_drop_errors`]: dropping a missing database
//!   reports `NamespaceNotFound`, as older servers do

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::wire::{DEFAULT_MAX_MESSAGE_SIZE, OP_MSG_OVERHEAD};
use super::{as_f64, as_i64, Connector, Transport};
use crate::error::{DocpoolError, Result};
use crate::uri::Endpoint;

const DEFAULT_BATCH_SIZE: usize = 101;
const MAX_WIRE_VERSION: i32 = 17;

/// Shared handle to one in-process server
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a smaller `maxWriteBatchSize` in the handshake
    #[must_use]
    pub fn with_max_write_batch_size(self, size: usize) -> Self {
        self.state.lock().max_write_batch_size = Some(size);
        self
    }

    /// Advertise smaller `maxBsonObjectSize` and `maxMessageSizeBytes` limits
    ///
    /// Requests larger than the message limit drop the link, as a real server
    /// does.
    #[must_use]
    pub fn with_message_limits(self, max_bson_object_size: usize, max_message_size: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.max_bson_object_size = Some(max_bson_object_size);
            state.max_message_size = Some(max_message_size);
        }
        self
    }

    /// Connector producing transports bound to this server
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { server: self.clone() }
    }

    /// Execute one request document and return the reply document
    #[must_use]
    pub fn handle(&self, request: &Document) -> Document {
        self.state.lock().handle(request)
    }

    /// Number of transports successfully opened so far
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.state.lock().connects
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    pub fn refuse_host(&self, host: &str) {
        self.state.lock().refused_hosts.insert(host.to_string());
    }

    /// Sever every transport opened before this call
    pub fn break_links(&self) {
        self.state.lock().generation += 1;
    }

    /// Answer `requests` more requests, then break every live link
    pub fn break_links_after(&self, requests: u64) {
        self.state.lock().break_after = Some(requests);
    }

    pub fn set_legacy_drop_errors(&self, legacy: bool) {
        self.state.lock().legacy_drop_errors = legacy;
    }

    /// Server cursors not yet exhausted or killed
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.state.lock().cursors.len()
    }

    #[must_use]
    pub fn document_count(&self, database: &str, collection: &str) -> usize {
        self.state.lock().documents(database, collection).len()
    }

    #[must_use]
    pub fn index_names(&self, database: &str, collection: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .databases
            .get(database)
            .and_then(|db| db.get(collection))
            .map(|coll| coll.indexes.iter().map(|index| index.name.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        self.state.lock().databases.keys().cloned().collect()
    }
}

/// Opens [`MemoryTransport`]s
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl MemoryConnector {
    #[must_use]
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        let mut state = self.server.state.lock();
        if state.refuse_all || state.refused_hosts.contains(&endpoint.host) {
            return Err(DocpoolError::connect_failure(format!("{endpoint}: connection refused")));
        }
        state.connects += 1;
        Ok(Box::new(MemoryTransport {
            server: self.server.clone(),
            generation: state.generation,
            closed: false,
        }))
    }
}

/// Transport that executes requests directly against a [`MemoryServer`]
#[derive(Debug)]
pub struct MemoryTransport {
    server: MemoryServer,
    generation: u64,
    closed: bool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn round_trip(&mut self, request: &Document) -> Result<Document> {
        let mut state = self.server.state.lock();
        if let Some(remaining) = state.break_after {
            if remaining == 0 {
                state.break_after = None;
                state.generation += 1;
            } else {
                state.break_after = Some(remaining - 1);
            }
        }
        if self.closed || state.generation != self.generation {
            return Err(DocpoolError::transport_failure("connection reset by peer"));
        }
        if let Some(limit) = state.max_message_size {
            let mut encoded = Vec::new();
            request.to_writer(&mut encoded)?;
            if encoded.len() + OP_MSG_OVERHEAD > limit {
                self.closed = true;
                return Err(DocpoolError::transport_failure(format!(
                    "message of {} bytes exceeds maxMessageSizeBytes {limit}",
                    encoded.len() + OP_MSG_OVERHEAD
                )));
            }
        }
        Ok(state.handle(request))
    }

    fn shutdown(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Default)]
struct ServerState {
    databases: BTreeMap<String, BTreeMap<String, CollectionState>>,
    cursors: HashMap<i64, OpenCursor>,
    next_cursor_id: i64,
    generation: u64,
    connects: u64,
    refuse_all: bool,
    refused_hosts: HashSet<String>,
    legacy_drop_errors: bool,
    max_write_batch_size: Option<usize>,
    max_bson_object_size: Option<usize>,
    max_message_size: Option<usize>,
    break_after: Option<u64>,
}

#[derive(Debug)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<IndexDefinition>,
}

impl Default for CollectionState {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![IndexDefinition {
                name: "_id_".to_string(),
                key: doc! { "_id": 1 },
                unique: true,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct IndexDefinition {
    name: String,
    key: Document,
    unique: bool,
}

#[derive(Debug)]
struct OpenCursor {
    namespace: String,
    remaining: VecDeque<Document>,
}

/// Error reply produced by a command handler
#[derive(Debug)]
struct ServerError {
    code: i32,
    code_name: &'static str,
    message: String,
}

impl ServerError {
    fn new(code: i32, code_name: &'static str, message: impl Into<String>) -> Self {
        Self { code, code_name, message: message.into() }
    }

    fn bad_value(message: impl Into<String>) -> Self {
        Self::new(2, "BadValue", message)
    }

    fn into_document(self) -> Document {
        doc! {
            "ok": 0.0,
            "errmsg": self.message,
            "code": self.code,
            "codeName": self.code_name,
        }
    }
}

type ServerResult<T> = std::result::Result<T, ServerError>;

type Handled = ServerResult<Document>;

impl ServerState {
    fn handle(&mut self, request: &Document) -> Document {
        match self.dispatch(request) {
            Ok(mut reply) => {
                reply.insert("ok", 1.0);
                reply
            }
            Err(err) => err.into_document(),
        }
    }

    fn dispatch(&mut self, request: &Document) -> Handled {
        let Some(name) = request.keys().next().cloned() else {
            return Err(ServerError::new(9, "FailedToParse", "empty command document"));
        };

        if matches!(name.as_str(), "hello" | "isMaster" | "ismaster") {
            return Ok(self.hello());
        }

        let database = request
            .get_str("$db")
            .map_err(|_| {
                ServerError::new(40571, "Location40571", "OP_MSG requests require a $db argument")
            })?
            .to_string();

        match name.as_str() {
            "ping" => Ok(Document::new()),
            "insert" => self.insert(&database, request),
            "find" => self.find(&database, request),
            "getMore" => self.get_more(request),
            "killCursors" => Ok(self.kill_cursors(request)),
            "aggregate" => self.aggregate(&database, request),
            "count" => self.count(&database, request),
            "createIndexes" => self.create_indexes(&database, request),
            "dropDatabase" => self.drop_database(&database),
            other => Err(ServerError::new(
                59,
                "CommandNotFound",
                format!("no such command: '{other}'"),
            )),
        }
    }

    fn hello(&self) -> Document {
        let batch = self.max_write_batch_size.unwrap_or(100_000) as i32;
        let object = self.max_bson_object_size.unwrap_or(16 * 1024 * 1024) as i32;
        let message = self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE) as i32;
        doc! {
            "isWritablePrimary": true,
            "maxBsonObjectSize": object,
            "maxMessageSizeBytes": message,
            "maxWriteBatchSize": batch,
            "minWireVersion": 0,
            "maxWireVersion": MAX_WIRE_VERSION,
        }
    }

    fn documents(&self, database: &str, collection: &str) -> &[Document] {
        self.databases
            .get(database)
            .and_then(|db| db.get(collection))
            .map_or(&[], |coll| coll.documents.as_slice())
    }

    fn collection_mut(&mut self, database: &str, collection: &str) -> &mut CollectionState {
        self.databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
    }

    fn insert(&mut self, database: &str, request: &Document) -> Handled {
        let name = collection_arg(request, "insert")?;
        let documents = request
            .get_array("documents")
            .map_err(|_| ServerError::bad_value("insert requires a 'documents' array"))?;
        let ordered = request.get_bool("ordered").unwrap_or(true);
        let namespace = format!("{database}.{name}");
        let collection = self.collection_mut(database, &name);

        let mut inserted = 0;
        let mut write_errors = Vec::new();
        for (index, value) in documents.iter().enumerate() {
            let outcome = match value.as_document() {
                Some(document) => {
                    let document = with_id(document);
                    collection.check_unique(&namespace, &document).map(|()| document)
                }
                None => Err(ServerError::bad_value("document to insert must be an object")),
            };
            match outcome {
                Ok(document) => {
                    collection.documents.push(document);
                    inserted += 1;
                }
                Err(err) => {
                    write_errors.push(Bson::Document(doc! {
                        "index": index as i32,
                        "code": err.code,
                        "errmsg": err.message,
                    }));
                    if ordered {
                        break;
                    }
                }
            }
        }

        let mut reply = doc! { "n": inserted };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        Ok(reply)
    }

    fn find(&mut self, database: &str, request: &Document) -> Handled {
        let name = collection_arg(request, "find")?;
        let filter = optional_document(request, "filter")?;
        let skip = optional_count(request, "skip")?.unwrap_or(0);
        let limit = optional_count(request, "limit")?.filter(|n| *n > 0);
        let batch_size = optional_count(request, "batchSize")?;

        let mut matched = filter_documents(self.documents(database, &name), &filter)?;
        matched.drain(..skip.min(matched.len()));
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(self.open_cursor(format!("{database}.{name}"), matched, batch_size))
    }

    fn get_more(&mut self, request: &Document) -> Handled {
        let id = request
            .get("getMore")
            .and_then(as_i64)
            .ok_or_else(|| {
                ServerError::new(14, "TypeMismatch", "getMore cursor id must be a number")
            })?;
        let batch_size =
            optional_count(request, "batchSize")?.unwrap_or(DEFAULT_BATCH_SIZE).max(1);

        let cursor = self
            .cursors
            .get_mut(&id)
            .ok_or_else(|| {
                ServerError::new(43, "CursorNotFound", format!("cursor id {id} not found"))
            })?;
        let take = batch_size.min(cursor.remaining.len());
        let batch: Vec<Bson> = cursor.remaining.drain(..take).map(Bson::Document).collect();
        let namespace = cursor.namespace.clone();
        let next_id = if cursor.remaining.is_empty() {
            self.cursors.remove(&id);
            0
        } else {
            id
        };

        Ok(doc! { "cursor": { "id": Bson::Int64(next_id), "ns": namespace, "nextBatch": batch } })
    }

    fn kill_cursors(&mut self, request: &Document) -> Document {
        let ids: Vec<i64> = request
            .get_array("cursors")
            .map(|ids| ids.iter().filter_map(as_i64).collect())
            .unwrap_or_default();

        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in ids {
            if self.cursors.remove(&id).is_some() {
                killed.push(Bson::Int64(id));
            } else {
                not_found.push(Bson::Int64(id));
            }
        }
        doc! { "cursorsKilled": killed, "cursorsNotFound": not_found }
    }

    fn aggregate(&mut self, database: &str, request: &Document) -> Handled {
        let name = collection_arg(request, "aggregate")?;
        let pipeline = request.get_array("pipeline").map_err(|_| {
            ServerError::new(14, "TypeMismatch", "'pipeline' option must be specified as an array")
        })?;
        let batch_size = match request.get_document("cursor") {
            Ok(cursor) => optional_count(cursor, "batchSize")?,
            Err(_) => {
                return Err(ServerError::new(
                    9,
                    "FailedToParse",
                    "The 'cursor' option is required, except for aggregate with the explain \
                     argument",
                ))
            }
        };

        let mut documents = self.documents(database, &name).to_vec();
        for stage in pipeline {
            let stage = stage
                .as_document()
                .filter(|stage| stage.len() == 1)
                .ok_or_else(|| {
                    ServerError::new(
                        40323,
                        "Location40323",
                        "A pipeline stage specification object must contain exactly one field.",
                    )
                })?;
            let Some((operator, argument)) = stage.iter().next() else { continue };
            documents = match operator.as_str() {
                "$match" => {
                    let filter = argument
                        .as_document()
                        .ok_or_else(|| {
                            ServerError::bad_value(
                                "the match filter must be an expression in an object",
                            )
                        })?;
                    filter_documents(&documents, filter)?
                }
                "$skip" => {
                    let n = stage_count(argument, "$skip")?;
                    documents.into_iter().skip(n).collect()
                }
                "$limit" => {
                    let n = stage_count(argument, "$limit")?;
                    documents.into_iter().take(n).collect()
                }
                "$count" => {
                    let field = argument
                        .as_str()
                        .filter(|f| !f.is_empty() && !f.starts_with('$'))
                        .ok_or_else(|| {
                            ServerError::bad_value("the count field must be a non-empty string")
                        })?;
                    if documents.is_empty() {
                        Vec::new()
                    } else {
                        vec![doc! { field: documents.len() as i32 }]
                    }
                }
                "$group" => {
                    let spec = argument
                        .as_document()
                        .ok_or_else(|| {
                            ServerError::new(
                                15947,
                                "Location15947",
                                "a group's fields must be specified in an object",
                            )
                        })?;
                    group(&documents, spec)?
                }
                other => {
                    return Err(ServerError::new(
                        40324,
                        "Location40324",
                        format!("Unrecognized pipeline stage name: '{other}'"),
                    ))
                }
            };
        }

        Ok(self.open_cursor(format!("{database}.{name}"), documents, batch_size))
    }

    fn count(&mut self, database: &str, request: &Document) -> Handled {
        let name = collection_arg(request, "count")?;
        let filter = optional_document(request, "query")?;
        let n = filter_documents(self.documents(database, &name), &filter)?.len();
        Ok(doc! { "n": n as i32 })
    }

    fn create_indexes(&mut self, database: &str, request: &Document) -> Handled {
        let name = collection_arg(request, "createIndexes")?;
        let specs = request
            .get_array("indexes")
            .map_err(|_| ServerError::bad_value("'indexes' must be an array"))?;
        if specs.is_empty() {
            return Err(ServerError::bad_value("Must specify at least one index."));
        }

        let namespace = format!("{database}.{name}");
        let existed = self.databases.get(database).is_some_and(|db| db.contains_key(&name));
        let collection = self.collection_mut(database, &name);
        let before = collection.indexes.len();

        let mut pending: Vec<IndexDefinition> = Vec::new();
        for spec in specs {
            let spec = spec
                .as_document()
                .ok_or_else(|| ServerError::bad_value("index specification must be an object"))?;
            let key = spec.get_document("key").map_err(|_| {
                ServerError::bad_value(
                    "The 'key' field is a required property of an index specification",
                )
            })?;
            if key.is_empty() {
                return Err(ServerError::new(
                    67,
                    "CannotCreateIndex",
                    "Index keys cannot be empty.",
                ));
            }
            let index_name = spec.get_str("name").map_err(|_| {
                ServerError::bad_value(
                    "The 'name' field is a required property of an index specification",
                )
            })?;
            let definition = IndexDefinition {
                name: index_name.to_string(),
                key: key.clone(),
                unique: spec.get_bool("unique").unwrap_or(false),
            };

            let known = collection.indexes.iter().chain(pending.iter());
            let mut duplicate = false;
            for existing in known {
                if existing == &definition {
                    duplicate = true;
                    break;
                }
                if existing.name == definition.name {
                    return Err(ServerError::new(
                        86,
                        "IndexKeySpecsConflict",
                        format!(
                            "An existing index has the same name as the requested index but \
                             different options. Requested index: {}, existing index: {}",
                            definition.name, existing.name
                        ),
                    ));
                }
                if existing.key == definition.key {
                    return Err(ServerError::new(
                        85,
                        "IndexOptionsConflict",
                        format!("Index already exists with a different name: {}", existing.name),
                    ));
                }
            }
            if duplicate {
                continue;
            }
            if definition.unique {
                collection.check_unique_index(&namespace, &definition)?;
            }
            pending.push(definition);
        }

        collection.indexes.extend(pending);
        let after = collection.indexes.len();
        let mut reply = doc! {
            "createdCollectionAutomatically": !existed,
            "numIndexesBefore": before as i32,
            "numIndexesAfter": after as i32,
        };
        if before == after {
            reply.insert("note", "all indexes already exist");
        }
        Ok(reply)
    }

    fn drop_database(&mut self, database: &str) -> Handled {
        if self.databases.remove(database).is_some() {
            return Ok(doc! { "dropped": database });
        }
        if self.legacy_drop_errors {
            return Err(ServerError::new(26, "NamespaceNotFound", "ns not found"));
        }
        Ok(Document::new())
    }

    fn open_cursor(
        &mut self,
        namespace: String,
        documents: Vec<Document>,
        batch_size: Option<usize>,
    ) -> Document {
        let mut remaining: VecDeque<Document> = documents.into();
        let take = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).min(remaining.len());
        let first: Vec<Bson> = remaining.drain(..take).map(Bson::Document).collect();

        let id = if remaining.is_empty() {
            0
        } else {
            self.next_cursor_id += 1;
            let cursor = OpenCursor {
                namespace: namespace.clone(),
                remaining,
            };
            self.cursors.insert(self.next_cursor_id, cursor);
            self.next_cursor_id
        };

        doc! { "cursor": { "id": Bson::Int64(id), "ns": namespace, "firstBatch": first } }
    }
}

impl CollectionState {
    fn check_unique(&self, namespace: &str, document: &Document) -> ServerResult<()> {
        for index in self.indexes.iter().filter(|index| index.unique) {
            let candidate = index_key(document, &index.key);
            let taken = self
                .documents
                .iter()
                .any(|existing| keys_equal(&index_key(existing, &index.key), &candidate));
            if taken {
                return Err(duplicate_key(namespace, index, &candidate));
            }
        }
        Ok(())
    }

    fn check_unique_index(&self, namespace: &str, index: &IndexDefinition) -> ServerResult<()> {
        let keys: Vec<Vec<Bson>> =
            self.documents.iter().map(|doc| index_key(doc, &index.key)).collect();
        for (i, key) in keys.iter().enumerate() {
            if keys[..i].iter().any(|earlier| keys_equal(earlier, key)) {
                return Err(duplicate_key(namespace, index, key));
            }
        }
        Ok(())
    }
}

fn duplicate_key(namespace: &str, index: &IndexDefinition, key: &[Bson]) -> ServerError {
    let fields: Vec<String> = index
        .key
        .keys()
        .zip(key)
        .map(|(field, value)| format!("{field}: {value}"))
        .collect();
    ServerError::new(
        11000,
        "DuplicateKey",
        format!(
            "E11000 duplicate key error collection: {namespace} index: {} dup key: {{ {} }}",
            index.name,
            fields.join(", ")
        ),
    )
}

fn index_key(document: &Document, key: &Document) -> Vec<Bson> {
    key.keys().map(|field| lookup_path(document, field).cloned().unwrap_or(Bson::Null)).collect()
}

fn keys_equal(a: &[Bson], b: &[Bson]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| compare_values(x, y) == Some(Ordering::Equal))
}

/// Copy of `document` with an `_id` first, generating one when missing
fn with_id(document: &Document) -> Document {
    if document.contains_key("_id") {
        return document.clone();
    }
    let mut with_id = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        with_id.insert(key.clone(), value.clone());
    }
    with_id
}

fn collection_arg(request: &Document, command: &str) -> ServerResult<String> {
    match request.get(command) {
        Some(Bson::String(name)) if !name.is_empty() => Ok(name.clone()),
        Some(Bson::String(_)) => Err(ServerError::new(
            73,
            "InvalidNamespace",
            "Invalid namespace specified",
        )),
        _ => Err(ServerError::new(
            2,
            "BadValue",
            format!("collection name has invalid type for command '{command}'"),
        )),
    }
}

fn optional_document(request: &Document, key: &str) -> ServerResult<Document> {
    match request.get(key) {
        None | Some(Bson::Null) => Ok(Document::new()),
        Some(Bson::Document(document)) => Ok(document.clone()),
        Some(_) => Err(ServerError::new(14, "TypeMismatch", format!("'{key}' must be an object"))),
    }
}

fn optional_count(request: &Document, key: &str) -> ServerResult<Option<usize>> {
    match request.get(key) {
        None => Ok(None),
        Some(value) => match as_i64(value) {
            Some(n) if n >= 0 => Ok(Some(n as usize)),
            _ => Err(ServerError::bad_value(format!("'{key}' must be a non-negative number"))),
        },
    }
}

fn stage_count(argument: &Bson, stage: &str) -> ServerResult<usize> {
    match as_i64(argument) {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(ServerError::bad_value(format!("invalid argument to {stage} stage"))),
    }
}

fn filter_documents(documents: &[Document], filter: &Document) -> ServerResult<Vec<Document>> {
    validate_filter(filter)?;
    let mut matched = Vec::new();
    for document in documents {
        if matches(document, filter)? {
            matched.push(document.clone());
        }
    }
    Ok(matched)
}

/// Reject unknown operators and malformed clauses before any document is seen
fn validate_filter(filter: &Document) -> ServerResult<()> {
    for (key, condition) in filter {
        match key.as_str() {
            "$and" | "$or" => {
                for clause in clauses(condition, key)? {
                    validate_filter(clause)?;
                }
            }
            operator if operator.starts_with('$') => {
                return Err(ServerError::bad_value(format!(
                    "unknown top level operator: {operator}"
                )))
            }
            _ => validate_condition(condition)?,
        }
    }
    Ok(())
}

fn validate_condition(condition: &Bson) -> ServerResult<()> {
    let operators = match condition {
        Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => ops,
        _ => return Ok(()),
    };
    for (operator, operand) in operators {
        match operator.as_str() {
            "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$exists" => {}
            "$in" | "$nin" => {
                if operand.as_array().is_none() {
                    return Err(ServerError::bad_value(format!("{operator} needs an array")));
                }
            }
            other => return Err(ServerError::bad_value(format!("unknown operator: {other}"))),
        }
    }
    Ok(())
}

fn matches(document: &Document, filter: &Document) -> ServerResult<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(condition, key)? {
                    if !matches(document, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(condition, key)? {
                    if matches(document, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            operator if operator.starts_with('$') => {
                return Err(ServerError::bad_value(format!(
                    "unknown top level operator: {operator}"
                )))
            }
            path => matches_field(lookup_path(document, path), condition)?,
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(condition: &'a Bson, operator: &str) -> ServerResult<Vec<&'a Document>> {
    let array = condition
        .as_array()
        .filter(|array| !array.is_empty())
        .ok_or_else(|| ServerError::bad_value(format!("{operator} must be a nonempty array")))?;
    array
        .iter()
        .map(|clause| {
            clause
                .as_document()
                .ok_or_else(|| {
                    ServerError::bad_value(format!("{operator} entries need to be full objects"))
                })
        })
        .collect()
}

fn matches_field(value: Option<&Bson>, condition: &Bson) -> ServerResult<bool> {
    let operators = match condition {
        Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => ops,
        _ => return Ok(equals(value, condition)),
    };

    for (operator, operand) in operators {
        let satisfied = match operator.as_str() {
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            "$gt" => ordered(value, operand, |o| o == Ordering::Greater),
            "$gte" => ordered(value, operand, |o| o != Ordering::Less),
            "$lt" => ordered(value, operand, |o| o == Ordering::Less),
            "$lte" => ordered(value, operand, |o| o != Ordering::Greater),
            "$in" | "$nin" => {
                let candidates = operand
                    .as_array()
                    .ok_or_else(|| ServerError::bad_value(format!("{operator} needs an array")))?;
                let found = candidates.iter().any(|candidate| equals(value, candidate));
                if operator == "$in" {
                    found
                } else {
                    !found
                }
            }
            "$exists" => value.is_some() == truthy(operand),
            other => return Err(ServerError::bad_value(format!("unknown operator: {other}"))),
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn equals(value: Option<&Bson>, operand: &Bson) -> bool {
    match value {
        None => matches!(operand, Bson::Null),
        Some(Bson::Array(items)) if !matches!(operand, Bson::Array(_)) => {
            items.iter().any(|item| compare_values(item, operand) == Some(Ordering::Equal))
        }
        Some(value) => compare_values(value, operand) == Some(Ordering::Equal),
    }
}

fn ordered(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    value.and_then(|v| compare_values(v, operand)).is_some_and(accept)
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null => false,
        other => as_f64(other).map_or(true, |n| n != 0.0),
    }
}

/// Compare values of the same kind; numbers compare across widths
fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

enum Sum {
    Int(i64),
    Float(f64),
}

impl Sum {
    fn add(self, value: &Bson) -> Self {
        match (self, value) {
            (Self::Int(total), Bson::Int32(_) | Bson::Int64(_)) => {
                Self::Int(total + as_i64(value).unwrap_or(0))
            }
            (Self::Int(total), Bson::Double(v)) => Self::Float(total as f64 + v),
            (Self::Float(total), other) => Self::Float(total + as_f64(other).unwrap_or(0.0)),
            (sum, _) => sum,
        }
    }

    fn into_bson(self) -> Bson {
        match self {
            Self::Int(v) => i32::try_from(v).map_or(Bson::Int64(v), Bson::Int32),
            Self::Float(v) => Bson::Double(v),
        }
    }
}

/// `$group` with a constant or `$field` key and `$sum` accumulators
fn group(documents: &[Document], spec: &Document) -> ServerResult<Vec<Document>> {
    let id_spec = spec
        .get("_id")
        .ok_or_else(|| {
            ServerError::new(15955, "Location15955", "a group specification must include an _id")
        })?;

    let mut accumulators = Vec::new();
    for (field, accumulator) in spec.iter().filter(|(field, _)| field.as_str() != "_id") {
        let (operator, operand) = accumulator
            .as_document()
            .and_then(|acc| acc.iter().next())
            .ok_or_else(|| {
                ServerError::new(
                    40234,
                    "Location40234",
                    format!("The field '{field}' must be an accumulator object"),
                )
            })?;
        if operator != "$sum" {
            return Err(ServerError::new(
                15952,
                "Location15952",
                format!("unknown group operator '{operator}'"),
            ));
        }
        accumulators.push((field.clone(), operand.clone()));
    }

    let resolve = |document: &Document, expression: &Bson| -> Bson {
        match expression {
            Bson::String(path) if path.starts_with('$') => {
                lookup_path(document, &path[1..]).cloned().unwrap_or(Bson::Null)
            }
            constant => constant.clone(),
        }
    };

    let mut groups: Vec<(Bson, Vec<Sum>)> = Vec::new();
    for document in documents {
        let key = resolve(document, id_spec);
        let position = match groups.iter().position(|(existing, _)| {
            compare_values(existing, &key) == Some(Ordering::Equal)
        }) {
            Some(position) => position,
            None => {
                groups.push((key, accumulators.iter().map(|_| Sum::Int(0)).collect()));
                groups.len() - 1
            }
        };
        let sums = std::mem::take(&mut groups[position].1);
        groups[position].1 = sums
            .into_iter()
            .zip(&accumulators)
            .map(|(sum, (_, operand))| sum.add(&resolve(document, operand)))
            .collect();
    }

    Ok(groups
        .into_iter()
        .map(|(key, sums)| {
            let mut result = doc! { "_id": key };
            for ((field, _), sum) in accumulators.iter().zip(sums) {
                result.insert(field.clone(), sum.into_bson());
            }
            result
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(server: &MemoryServer, command: Document) -> Document {
        let mut request = command;
        request.insert("$db", "store");
        server.handle(&request)
    }

    fn ok(reply: &Document) -> bool {
        reply.get("ok").and_then(as_f64) == Some(1.0)
    }

    fn seed(server: &MemoryServer) {
        let documents: Vec<Document> = (1..=20)
            .map(|i| {
                doc! { "_id": i, "category_id": i % 4, "price": f64::from(i) * 10.0, "tags": ["a"] }
            })
            .collect();
        let reply = run(server, doc! { "insert": "products", "documents": documents });
        assert_eq!(reply.get_i32("n").unwrap(), 20);
    }

    fn create_index(collection: &str, index: Document) -> Document {
        doc! { "createIndexes": collection, "indexes": [index] }
    }

    fn count(server: &MemoryServer, filter: Document) -> Document {
        run(server, doc! { "count": "products", "query": filter })
    }

    #[test]
    fn test_hello_advertises_limits() {
        let server = MemoryServer::new().with_max_write_batch_size(3);
        let reply = server.handle(&doc! { "hello": 1, "$db": "admin" });
        assert!(ok(&reply));
        assert_eq!(reply.get_i32("maxWriteBatchSize").unwrap(), 3);
    }

    #[test]
    fn test_missing_db_is_rejected() {
        let server = MemoryServer::new();
        let reply = server.handle(&doc! { "ping": 1 });
        assert!(!ok(&reply));
        assert_eq!(reply.get_i32("code").unwrap(), 40571);
    }

    #[test]
    fn test_insert_generates_object_id() {
        let server = MemoryServer::new();
        let reply = run(&server, doc! { "insert": "things", "documents": [{ "name": "x" }] });
        assert!(ok(&reply));
        let found = run(&server, doc! { "find": "things" });
        let batch = found.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
        let first = batch[0].as_document().unwrap();
        assert_eq!(first.keys().next().map(String::as_str), Some("_id"));
        assert!(matches!(first.get("_id"), Some(Bson::ObjectId(_))));
    }

    #[test]
    fn test_unordered_insert_reports_every_duplicate() {
        let server = MemoryServer::new();
        run(&server, doc! { "insert": "c", "documents": [{ "_id": 1 }] });
        let reply = run(
            &server,
            doc! {
                "insert": "c",
                "documents": [{ "_id": 1 }, { "_id": 2 }, { "_id": 2 }],
                "ordered": false
            },
        );
        assert!(ok(&reply));
        assert_eq!(reply.get_i32("n").unwrap(), 1);
        let errors = reply.get_array("writeErrors").unwrap();
        let indices: Vec<i32> =
            errors.iter().map(|e| e.as_document().unwrap().get_i32("index").unwrap()).collect();
        assert_eq!(indices, vec![0, 2]);
        let first = errors[0].as_document().unwrap();
        assert_eq!(first.get_i32("code").unwrap(), 11000);
        assert!(first.get_str("errmsg").unwrap().contains("store.c"));
    }

    #[test]
    fn test_ordered_insert_stops_at_first_error() {
        let server = MemoryServer::new();
        let documents = vec![doc! { "_id": 1 }, doc! { "_id": 1 }, doc! { "_id": 2 }];
        let reply = run(&server, doc! { "insert": "c", "documents": documents });
        assert_eq!(reply.get_i32("n").unwrap(), 1);
        assert_eq!(reply.get_array("writeErrors").unwrap().len(), 1);
        assert_eq!(server.document_count("store", "c"), 1);
    }

    #[test]
    fn test_numeric_equality_across_types() {
        let server = MemoryServer::new();
        seed(&server);
        let reply = count(&server, doc! { "_id": 3.0 });
        assert_eq!(reply.get_i32("n").unwrap(), 1);
        let reply = count(&server, doc! { "_id": Bson::Int64(3) });
        assert_eq!(reply.get_i32("n").unwrap(), 1);
    }

    #[test]
    fn test_comparison_operators() {
        let server = MemoryServer::new();
        seed(&server);
        let n = |filter| count(&server, filter).get_i32("n").unwrap();
        assert_eq!(n(doc! { "price": { "$lte": 50.0 } }), 5);
        assert_eq!(n(doc! { "price": { "$gt": 50.0, "$lt": 100.0 } }), 4);
        assert_eq!(n(doc! { "category_id": { "$in": [1, 2] } }), 10);
        assert_eq!(n(doc! { "category_id": { "$nin": [1, 2] } }), 10);
        assert_eq!(n(doc! { "category_id": { "$ne": 0 } }), 15);
        assert_eq!(n(doc! { "missing": { "$exists": false } }), 20);
        assert_eq!(n(doc! { "tags": "a" }), 20);
        assert_eq!(
            n(doc! {
                "$or": [{ "_id": 1 }, { "_id": 2 }],
                "$and": [{ "price": { "$gte": 20.0 } }]
            }),
            1
        );
    }

    #[test]
    fn test_unknown_operator_is_bad_value() {
        let server = MemoryServer::new();
        seed(&server);
        let reply = count(&server, doc! { "price": { "$near": 3 } });
        assert!(!ok(&reply));
        assert_eq!(reply.get_i32("code").unwrap(), 2);
        assert!(reply.get_str("errmsg").unwrap().contains("$near"));

        let reply = count(&server, doc! { "$where": "1" });
        assert!(!ok(&reply));
    }

    #[test]
    fn test_bad_filter_rejected_without_matching_documents() {
        let server = MemoryServer::new();
        let reply = count(&server, doc! { "price": { "$between": [1, 2] } });
        assert!(!ok(&reply));
        assert_eq!(reply.get_str("errmsg").unwrap(), "unknown operator: $between");

        // the first clause matches everything, the second is still checked
        seed(&server);
        let filter = doc! { "$or": [{ "price": { "$gte": 0 } }, { "price": { "$between": 1 } }] };
        assert!(!ok(&count(&server, filter)));
        assert!(!ok(&count(&server, doc! { "tags": { "$in": 3 } })));
    }

    #[test]
    fn test_dotted_paths() {
        let server = MemoryServer::new();
        let documents = vec![doc! { "_id": 1, "a": { "b": 5 } }, doc! { "_id": 2, "a": 1 }];
        run(&server, doc! { "insert": "c", "documents": documents });
        let reply = run(&server, doc! { "count": "c", "query": { "a.b": 5 } });
        assert_eq!(reply.get_i32("n").unwrap(), 1);
    }

    #[test]
    fn test_aggregate_group_count() {
        let server = MemoryServer::new();
        seed(&server);
        let reply = run(
            &server,
            doc! {
                "aggregate": "products",
                "pipeline": [
                    { "$match": { "category_id": 1 } },
                    { "$group": { "_id": 1, "n": { "$sum": 1 } } },
                ],
                "cursor": {},
            },
        );
        assert!(ok(&reply));
        let batch = reply.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].as_document().unwrap().get_i32("n").unwrap(), 5);
    }

    #[test]
    fn test_aggregate_group_by_field_sums_prices() {
        let server = MemoryServer::new();
        seed(&server);
        let reply = run(
            &server,
            doc! {
                "aggregate": "products",
                "pipeline": [
                    { "$match": { "category_id": { "$lte": 1 } } },
                    { "$group": { "_id": "$category_id", "total": { "$sum": "$price" } } },
                ],
                "cursor": {},
            },
        );
        let batch = reply.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
        assert_eq!(batch.len(), 2);
        let first = batch[0].as_document().unwrap();
        // first group seen is category 1 (_id 1): 1, 5, 9, 13, 17
        assert_eq!(first.get_i32("_id").unwrap(), 1);
        assert_eq!(first.get_f64("total").unwrap(), 450.0);
    }

    #[test]
    fn test_aggregate_errors() {
        let server = MemoryServer::new();
        seed(&server);
        let reply = run(
            &server,
            doc! { "aggregate": "products", "pipeline": [{ "$bogus": {} }], "cursor": {} },
        );
        assert_eq!(reply.get_i32("code").unwrap(), 40324);
        let reply = run(&server, doc! { "aggregate": "products", "pipeline": [] });
        assert_eq!(reply.get_i32("code").unwrap(), 9);
    }

    #[test]
    fn test_aggregate_empty_collection() {
        let server = MemoryServer::new();
        let reply = run(
            &server,
            doc! {
                "aggregate": "nothing",
                "pipeline": [{ "$group": { "_id": 1, "n": { "$sum": 1 } } }],
                "cursor": {},
            },
        );
        assert!(ok(&reply));
        let batch = reply.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_get_more_and_cursor_exhaustion() {
        let server = MemoryServer::new();
        seed(&server);
        let reply = run(&server, doc! { "find": "products", "batchSize": 15 });
        let cursor = reply.get_document("cursor").unwrap();
        let id = cursor.get_i64("id").unwrap();
        assert_ne!(id, 0);
        assert_eq!(server.open_cursors(), 1);

        let reply = run(&server, doc! { "getMore": id, "collection": "products", "batchSize": 15 });
        let cursor = reply.get_document("cursor").unwrap();
        assert_eq!(cursor.get_i64("id").unwrap(), 0);
        assert_eq!(cursor.get_array("nextBatch").unwrap().len(), 5);
        assert_eq!(server.open_cursors(), 0);

        let reply = run(&server, doc! { "getMore": id, "collection": "products" });
        assert_eq!(reply.get_i32("code").unwrap(), 43);
    }

    #[test]
    fn test_find_skip_and_limit() {
        let server = MemoryServer::new();
        seed(&server);
        let reply = run(&server, doc! { "find": "products", "filter": {}, "skip": 18, "limit": 5 });
        let batch = reply.get_document("cursor").unwrap().get_array("firstBatch").unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_create_indexes_is_idempotent() {
        let server = MemoryServer::new();
        let command = doc! {
            "createIndexes": "products",
            "indexes": [{ "key": { "price": 1 }, "name": "price_1" }],
        };
        let first = run(&server, command.clone());
        assert!(ok(&first));
        assert_eq!(first.get_i32("numIndexesAfter").unwrap(), 2);
        assert!(first.get_bool("createdCollectionAutomatically").unwrap());

        let second = run(&server, command);
        assert!(ok(&second));
        assert_eq!(second.get_i32("numIndexesBefore").unwrap(), 2);
        assert_eq!(second.get_i32("numIndexesAfter").unwrap(), 2);
        assert_eq!(second.get_str("note").unwrap(), "all indexes already exist");
        assert_eq!(server.index_names("store", "products"), vec!["_id_", "price_1"]);
    }

    #[test]
    fn test_create_indexes_conflicts() {
        let server = MemoryServer::new();
        run(&server, create_index("p", doc! { "key": { "price": 1 }, "name": "price_1" }));

        let same_name =
            run(&server, create_index("p", doc! { "key": { "price": -1 }, "name": "price_1" }));
        assert_eq!(same_name.get_i32("code").unwrap(), 86);

        let same_key =
            run(&server, create_index("p", doc! { "key": { "price": 1 }, "name": "by_price" }));
        assert_eq!(same_key.get_i32("code").unwrap(), 85);

        let empty = run(&server, doc! { "createIndexes": "p", "indexes": [] });
        assert_eq!(empty.get_i32("code").unwrap(), 2);
    }

    #[test]
    fn test_unique_index_rejects_duplicates() {
        let server = MemoryServer::new();
        run(&server, doc! { "insert": "u", "documents": [{ "_id": 1, "sku": "a" }] });
        let unique_sku = doc! { "key": { "sku": 1 }, "name": "sku_1", "unique": true };
        run(&server, create_index("u", unique_sku.clone()));

        let reply = run(
            &server,
            doc! { "insert": "u", "documents": [{ "_id": 2, "sku": "a" }], "ordered": false },
        );
        let errors = reply.get_array("writeErrors").unwrap();
        assert!(errors[0].as_document().unwrap().get_str("errmsg").unwrap().contains("sku_1"));

        let documents = vec![doc! { "_id": 1, "sku": "a" }, doc! { "_id": 2, "sku": "a" }];
        run(&server, doc! { "insert": "v", "documents": documents });
        let reply = run(&server, create_index("v", unique_sku));
        assert_eq!(reply.get_i32("code").unwrap(), 11000);
    }

    #[test]
    fn test_drop_database_modes() {
        let server = MemoryServer::new();
        seed(&server);
        let reply = run(&server, doc! { "dropDatabase": 1 });
        assert_eq!(reply.get_str("dropped").unwrap(), "store");
        assert!(server.database_names().is_empty());

        assert!(ok(&run(&server, doc! { "dropDatabase": 1 })));

        server.set_legacy_drop_errors(true);
        let reply = run(&server, doc! { "dropDatabase": 1 });
        assert_eq!(reply.get_i32("code").unwrap(), 26);
        assert_eq!(reply.get_str("errmsg").unwrap(), "ns not found");
    }

    #[test]
    fn test_unknown_command() {
        let server = MemoryServer::new();
        let reply = run(&server, doc! { "shutdown": 1 });
        assert_eq!(reply.get_i32("code").unwrap(), 59);
        assert_eq!(reply.get_str("codeName").unwrap(), "CommandNotFound");
    }

    #[tokio::test]
    async fn test_transport_breaks_with_generation() {
        let server = MemoryServer::new();
        let connector = server.connector();
        let endpoint = Endpoint::new("mem", 27017);
        let mut before = connector.connect(&endpoint).await.unwrap();
        server.break_links();
        let mut after = connector.connect(&endpoint).await.unwrap();

        let ping = doc! { "ping": 1, "$db": "admin" };
        assert!(before.round_trip(&ping).await.unwrap_err().is_transport());
        assert!(after.round_trip(&ping).await.is_ok());
        assert_eq!(server.connects(), 2);
    }
}
