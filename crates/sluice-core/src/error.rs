//! Typed errors shared across the workspace.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ColumnType;

/// Errors that can occur while migrating data into the destination.
#[derive(Debug, Error)]
pub enum Error {
    /// The destination refused the login credentials.
    #[error("destination refused the login credentials")]
    ConnectionFailed,

    /// An operation was attempted before connecting.
    #[error("not connected to the destination")]
    NotConnected,

    /// A transport-level failure (non-2xx response, socket error).
    #[error("request failed: {0}")]
    Request(String),

    /// The destination reported a failed query.
    #[error("query failed: {query}")]
    Query {
        query: String,
        response: Option<String>,
    },

    /// The destination is restarting; the query may be retried shortly.
    #[error("destination is restarting, query may be retried: {query}")]
    ServerRestart { query: String },

    /// The destination reported a warning while ingesting data.
    #[error("destination warned while importing: {query}")]
    ImportWarning { query: String },

    /// A chunk path resolved outside of the upload folder.
    #[error("import path escapes the upload folder: {}", path.display())]
    InvalidImportPath { path: PathBuf },

    /// A retry stage gave up on a message.
    #[error("gave up on message after {attempts} attempt(s)")]
    RetryExhausted { attempts: u32 },

    /// A message was enqueued on a processor that is no longer running.
    #[error("processor has been stopped")]
    Stopped,

    /// A singleton packet lookup found no packet of the requested kind.
    #[error("message is missing a {0} packet")]
    MissingPacket(&'static str),

    /// A textual value could not be parsed as the expected cell type.
    #[error("could not parse {value:?} as {ty}")]
    Parse { ty: ColumnType, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is the destination's transient restart notice.
    pub fn is_server_restart(&self) -> bool {
        matches!(self, Error::ServerRestart { .. })
    }
}
