//! JSON Output Envelope Types
//!
//! Every CLI run prints exactly one envelope on stdout.
//!
//! # Output Contract
//! - Success: `{"ok": true, "command": "...", "database": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "command": "...", "database": "...",
//!   "error": {"code": "...", "message": "..."}}`

use bson::Document;
use serde::{Deserialize, Serialize};

use crate::error::DocpoolError;
use crate::pool::PoolStatus;

/// Success envelope for operation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Mode that was run (ping, drop, insert, index, find)
    pub command: String,

    /// Database the mode ran against
    pub database: String,

    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(
        command: impl Into<String>,
        database: impl Into<String>,
        data: T,
        meta: Metadata,
    ) -> Self {
        Self { ok: true, command: command.into(), database: database.into(), data, meta }
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    pub command: String,

    /// Empty when the failure happened before a database was resolved
    pub database: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(command: impl Into<String>, database: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, command: command.into(), database: database.into(), error }
    }

    pub fn from_error(
        command: impl Into<String>,
        database: impl Into<String>,
        err: &DocpoolError,
    ) -> Self {
        Self::new(command, database, ErrorInfo::from(err))
    }
}

/// Error information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. "POOL_EXHAUSTED", "CONNECT_FAILURE")
    pub code: String,

    /// Server or transport message, verbatim
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

impl From<&DocpoolError> for ErrorInfo {
    fn from(err: &DocpoolError) -> Self {
        Self::new(err.error_code(), err.message())
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub execution_ms: u64,

    /// Documents returned by a read, when the mode reads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents_returned: Option<usize>,

    /// Pool counters after the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
}

impl Metadata {
    #[must_use]
    pub fn new(execution_ms: u64) -> Self {
        Self { execution_ms, documents_returned: None, pool: None }
    }

    #[must_use]
    pub fn with_documents(mut self, documents_returned: usize) -> Self {
        self.documents_returned = Some(documents_returned);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolStatus) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// Render a server document as relaxed extended JSON
#[must_use]
pub fn document_to_json(document: &Document) -> serde_json::Value {
    bson::Bson::Document(document.clone()).into_relaxed_extjson()
}
