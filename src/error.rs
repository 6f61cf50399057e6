// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the document store core.
//!
//! Errors are categorized by where they come from (the remote peer, the
//! local row store, the blob directory, configuration) and carry enough
//! context to be logged usefully.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `TransientNetwork` | Yes | Connect/read failures, timeouts, dropped connections |
//! | `RemoteProtocol` | Only for 408/429/5xx | Non-success status or malformed response |
//! | `LocalStorage` | No | SQLite errors (aborts the current transaction) |
//! | `BlobIo` | No | Blob directory I/O failure |
//! | `NotFound` | No | Missing blob, document or revision |
//! | `Conflict` | No | Update based on a revision that is no longer a leaf |
//! | `Config` | No | Bad database name, bad URL, bad settings |
//! | `Encryption` | No | Key or ciphertext problems (corruption or wrong key) |
//! | `Serialization` | No | JSON that could not be encoded or decoded |
//! | `InvalidState` | No | Operation attempted in the wrong state |
//! | `Timeout` | No | A bounded wait expired (map safety valve) |
//! | `Shutdown` | No | The owning component is stopping |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`CoreError::is_retryable()`] to decide whether a replication should
//! back off and try again. Everything else is surfaced to observers and ends
//! the current session (or, for local storage errors, the current batch).

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// HTTP statuses treated as transient by the replicator and change tracker.
pub const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Returns true for HTTP statuses worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    TRANSIENT_STATUSES.contains(&status)
}

/// Errors that can occur anywhere in the core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Network or transport failure talking to the remote peer.
    ///
    /// Always retryable with backoff.
    #[error("Transient network error ({operation}): {message}")]
    TransientNetwork {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The remote answered with an error status or an unusable body.
    ///
    /// `status` is `None` for malformed responses.
    #[error("Remote protocol error ({}): {message}", status.map(|s| s.to_string()).unwrap_or_else(|| "malformed".to_string()))]
    RemoteProtocol { status: Option<u16>, message: String },

    /// SQLite failure in the local row store.
    #[error("Local storage error: {0}")]
    LocalStorage(#[from] sqlx::Error),

    /// File system failure inside the blob store.
    #[error("Blob store I/O error ({path}): {source}")]
    BlobIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A blob, document or revision does not exist (or could not be read).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A local write named a parent revision that is not current.
    #[error("Document update conflict: {0}")]
    Conflict(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sealing or opening encrypted content failed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// State machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// A bounded wait ran out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Create a transient network error from a reqwest error.
    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::TransientNetwork {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transient network error without a source.
    pub fn network_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error for an HTTP status.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::RemoteProtocol {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Create a protocol error for a body we could not interpret.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::RemoteProtocol {
            status: None,
            message: message.into(),
        }
    }

    /// Create a blob I/O error.
    pub fn blob_io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::BlobIo {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } => true,
            Self::RemoteProtocol { status: Some(s), .. } => is_transient_status(*s),
            Self::RemoteProtocol { status: None, .. } => false,
            Self::LocalStorage(_) => false,
            Self::BlobIo { .. } => false,
            Self::NotFound(_) => false,
            Self::Conflict(_) => false,
            Self::Config(_) => false,
            Self::Encryption(_) => false,
            Self::Serialization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Timeout(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Missing things are treated as absent, not as crashes.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::RemoteProtocol { status: Some(404), .. }
        )
    }

    /// The HTTP status this error would be reported as.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RemoteProtocol { status: Some(s), .. } => *s,
            Self::RemoteProtocol { status: None, .. } => 502,
            Self::TransientNetwork { .. } => 502,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Config(_) | Self::InvalidState { .. } => 400,
            Self::Timeout(_) => 504,
            Self::Shutdown => 503,
            _ => 500,
        }
    }
}

/// Status for a per-document error entry in a `_bulk_docs` response.
pub fn status_from_bulk_docs_error(error: &str) -> u16 {
    match error {
        "unauthorized" => 401,
        "forbidden" => 403,
        "conflict" => 409,
        _ => 502,
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::status(status.as_u16(), e.to_string());
        }
        Self::network("request", e)
    }
}
