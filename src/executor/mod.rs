//! Command Executor
//!
//! Stateless operations over an acquired [`Connection`]. Each builds a
//! [`Command`], sends it, and decodes the reply into a domain result.
//!
//! | Operation        | Command          | Failure mapping                            |
//! |------------------|------------------|--------------------------------------------|
//! | `ping`           | `ping`           | as reported                                |
//! | `insert_many`    | `insert`         | write errors -> `PartialInsertFailure`     |
//! | `count_where`    | `aggregate`      | server errors -> `QueryFailure`            |
//! | `create_indexes` | `createIndexes`  | as reported                                |
//! | `drop_database`  | `dropDatabase`   | "ns not found" -> success                  |
//! | `find`           | `find`/`getMore` | server errors -> `QueryFailure`            |
//!
//! Transport errors pass through unchanged so callers can tell a dead link
//! from a rejected request. The exception is `insert_many` once a batch has
//! been written: the error then reports what was already inserted.

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::wire::OP_MSG_OVERHEAD;
use crate::connection::{as_i64, Command, CommandReply, Connection, Cursor, ServerDescription};
use crate::error::{DocpoolError, Result};

/// Server code for a missing namespace
const NAMESPACE_NOT_FOUND: i32 = 26;

/// Liveness check
pub async fn ping(connection: &mut Connection, database: &str) -> Result<CommandReply> {
    connection.send_command(&Command::new(database, doc! { "ping": 1 })?).await
}

/// Insert `documents`, continuing past rejected ones
///
/// Documents are sent unordered, in batches bounded by the server's
/// `maxWriteBatchSize` and `maxMessageSizeBytes`. A document larger than
/// `maxBsonObjectSize` is never sent and counts as rejected. Returns the
/// inserted count when every document was accepted. Otherwise fails with
/// [`DocpoolError::PartialInsertFailure`] listing the rejected positions in
/// `documents`.
///
/// If a batch fails outright after earlier batches were written, the error is
/// also a `PartialInsertFailure`: the earlier counts are kept and every
/// document from the failed batch onwards is listed as rejected.
pub async fn insert_many(
    connection: &mut Connection,
    database: &str,
    collection: &str,
    documents: &[Document],
) -> Result<u64> {
    if documents.is_empty() {
        return Ok(0);
    }

    let plan = plan_batches(documents, database, collection, connection.server())?;
    let mut succeeded = 0u64;
    let mut failed_indices: Vec<usize> = plan.oversized.iter().map(|(index, _)| *index).collect();
    let mut first_message = plan.oversized.first().map(|(_, message)| message.clone());

    for (batch_number, batch) in plan.batches.iter().enumerate() {
        let batch_documents: Vec<Bson> =
            batch.iter().map(|&i| Bson::Document(documents[i].clone())).collect();
        let payload = doc! {
            "insert": collection,
            "documents": batch_documents,
            "ordered": false
        };
        let reply = match connection.send_command(&Command::new(database, payload)?).await {
            Ok(reply) => reply,
            Err(err) if batch_number == 0 => return Err(err),
            Err(err) => {
                warn!(
                    database,
                    collection,
                    batch = batch_number,
                    error = %err,
                    "insert batch failed"
                );
                failed_indices.extend(plan.batches[batch_number..].iter().flatten().copied());
                failed_indices.sort_unstable();
                return Err(DocpoolError::PartialInsertFailure {
                    succeeded,
                    failed_indices,
                    message: err.message(),
                });
            }
        };
        succeeded += reply.document.get("n").and_then(as_i64).unwrap_or(0).max(0) as u64;

        for error in write_errors(&reply.document) {
            let position = error.get("index").and_then(as_i64).unwrap_or(0).max(0) as usize;
            if let Some(&index) = batch.get(position) {
                failed_indices.push(index);
            }
            if first_message.is_none() {
                first_message = error.get_str("errmsg").ok().map(str::to_string);
            }
        }
    }

    if failed_indices.is_empty() {
        debug!(database, collection, inserted = succeeded, "insert complete");
        return Ok(succeeded);
    }

    failed_indices.sort_unstable();
    warn!(
        database,
        collection,
        succeeded,
        failed = failed_indices.len(),
        "insert partially rejected"
    );
    Err(DocpoolError::PartialInsertFailure {
        succeeded,
        failed_indices,
        message: first_message.unwrap_or_else(|| "write error".to_string()),
    })
}

/// Positions of `documents` grouped into sendable batches
#[derive(Debug, Default, PartialEq)]
struct BatchPlan {
    batches: Vec<Vec<usize>>,
    /// Documents over `maxBsonObjectSize`, with the reason
    oversized: Vec<(usize, String)>,
}

fn plan_batches(
    documents: &[Document],
    database: &str,
    collection: &str,
    server: &ServerDescription,
) -> Result<BatchPlan> {
    let envelope = doc! {
        "insert": collection,
        "documents": [],
        "ordered": false,
        "$db": database
    };
    let message_budget = server
        .max_message_size_bytes
        .saturating_sub(OP_MSG_OVERHEAD + encoded_len(&envelope)?);
    let max_count = server.max_write_batch_size.max(1);

    let mut plan = BatchPlan::default();
    let mut current = Vec::new();
    let mut current_bytes = 0;
    for (index, document) in documents.iter().enumerate() {
        let size = encoded_len(document)?;
        if size > server.max_bson_object_size {
            plan.oversized.push((
                index,
                format!(
                    "document of {size} bytes exceeds maxBsonObjectSize {}",
                    server.max_bson_object_size
                ),
            ));
            continue;
        }

        let full = current.len() == max_count
            || current_bytes + element_len(size, current.len()) > message_budget;
        if full && !current.is_empty() {
            plan.batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += element_len(size, current.len());
        current.push(index);
    }
    if !current.is_empty() {
        plan.batches.push(current);
    }
    Ok(plan)
}

/// Bytes a document takes as array element `position`: type byte, decimal
/// key and its terminator
fn element_len(size: usize, position: usize) -> usize {
    size + position.to_string().len() + 2
}

fn encoded_len(document: &Document) -> Result<usize> {
    let mut buffer = Vec::new();
    document.to_writer(&mut buffer)?;
    Ok(buffer.len())
}

fn write_errors(reply: &Document) -> impl Iterator<Item = &Document> {
    reply
        .get_array("writeErrors")
        .map(|errors| errors.as_slice())
        .unwrap_or_default()
        .iter()
        .filter_map(Bson::as_document)
}

/// Count documents matching `filter` (all documents when `None`)
pub async fn count_where(
    connection: &mut Connection,
    database: &str,
    collection: &str,
    filter: Option<Document>,
) -> Result<u64> {
    let payload = doc! {
        "aggregate": collection,
        "pipeline": [
            { "$match": filter.unwrap_or_default() },
            { "$group": { "_id": 1, "n": { "$sum": 1 } } }
        ],
        "cursor": {}
    };
    let command = Command::new(database, payload)?;
    let reply = connection.send_command(&command).await.map_err(into_query_failure)?;
    let rows = Cursor::from_reply(connection, database, &reply, None)?
        .collect_all()
        .await
        .map_err(into_query_failure)?;

    // an empty match produces no group at all
    let count = rows.first().and_then(|row| row.get("n")).and_then(as_i64).unwrap_or(0);
    Ok(count.max(0) as u64)
}

/// Run a `find` and drain its cursor
pub async fn find(
    connection: &mut Connection,
    database: &str,
    collection: &str,
    filter: Option<Document>,
    batch_size: Option<i32>,
) -> Result<Vec<Document>> {
    let mut payload = doc! { "find": collection, "filter": filter.unwrap_or_default() };
    if let Some(batch_size) = batch_size {
        payload.insert("batchSize", batch_size);
    }
    let reply = connection
        .send_command(&Command::new(database, payload)?)
        .await
        .map_err(into_query_failure)?;
    Cursor::from_reply(connection, database, &reply, batch_size)?
        .collect_all()
        .await
        .map_err(into_query_failure)
}

fn into_query_failure(err: DocpoolError) -> DocpoolError {
    match err {
        DocpoolError::CommandFailure { message, .. } => DocpoolError::QueryFailure(message),
        other => other,
    }
}

/// Index key pattern plus options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub keys: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    #[must_use]
    pub fn new(keys: Document) -> Self {
        Self { keys, name: None, unique: false }
    }

    /// Single-field ascending index
    #[must_use]
    pub fn ascending(field: &str) -> Self {
        Self::new(doc! { field: 1 })
    }

    /// Single-field descending index
    #[must_use]
    pub fn descending(field: &str) -> Self {
        Self::new(doc! { field: -1 })
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Explicit name, or the server convention: `field_direction` pairs joined by `_`
    #[must_use]
    pub fn index_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.keys
            .iter()
            .map(|(field, direction)| match direction {
                Bson::String(kind) => format!("{field}_{kind}"),
                other => format!("{field}_{}", as_i64(other).unwrap_or(1)),
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    fn to_document(&self) -> Document {
        let mut spec = doc! { "key": self.keys.clone(), "name": self.index_name() };
        if self.unique {
            spec.insert("unique", true);
        }
        spec
    }
}

/// Create indexes; re-creating an identical index succeeds without change
pub async fn create_indexes(
    connection: &mut Connection,
    database: &str,
    collection: &str,
    specs: &[IndexSpec],
) -> Result<CommandReply> {
    if specs.is_empty() {
        return Err(DocpoolError::invalid_input("at least one index is required"));
    }
    if let Some(spec) = specs.iter().find(|spec| spec.keys.is_empty()) {
        return Err(DocpoolError::invalid_input(format!(
            "index {:?} has no key fields",
            spec.name.as_deref().unwrap_or("<unnamed>")
        )));
    }

    let indexes: Vec<Bson> = specs.iter().map(|spec| Bson::Document(spec.to_document())).collect();
    let payload = doc! { "createIndexes": collection, "indexes": indexes };
    let reply = connection.send_command(&Command::new(database, payload)?).await?;
    debug!(
        database,
        collection,
        before = reply.document.get("numIndexesBefore").and_then(as_i64),
        after = reply.document.get("numIndexesAfter").and_then(as_i64),
        "indexes ensured"
    );
    Ok(reply)
}

/// Drop `database`; a database that does not exist counts as dropped
pub async fn drop_database(connection: &mut Connection, database: &str) -> Result<()> {
    let command = Command::new(database, doc! { "dropDatabase": 1 })?;
    match connection.send_command(&command).await {
        Ok(_) => Ok(()),
        Err(DocpoolError::CommandFailure { code, message })
            if code == NAMESPACE_NOT_FOUND || message.contains("ns not found") =>
        {
            debug!(database, "database did not exist");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
