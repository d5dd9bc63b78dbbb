//! Error types for the metricus agent and counter store

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scraping, streaming or persisting counters
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Request failed below the HTTP layer (connect, timeout, DNS, body read)
    #[error("Network error after {attempts} attempt(s): {source}")]
    Network {
        #[source]
        source: reqwest::Error,
        attempts: u32,
    },

    /// Remote kept answering 5xx or 429 until the retry budget ran out
    #[error("Server error {status} after {attempts} attempt(s)")]
    ServerStatus { status: u16, attempts: u32 },

    /// Remote answered with a status that is never retried
    #[error("Request rejected with status {status}: {body}")]
    ClientStatus { status: u16, body: String },

    /// Operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid request description (bad URL, bad method)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// Malformed payload
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    // =========================================================================
    // Counter Store Errors
    // =========================================================================
    /// Durable backend failure
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Store has already been closed
    #[error("Counter store is closed")]
    StoreClosed,

    // =========================================================================
    // Stream Errors
    // =========================================================================
    /// Writing a frame to the subscriber failed
    #[error("Failed to write event to subscriber: {0}")]
    StreamWrite(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the retrying transport should try the request again.
    ///
    /// Transport failures, 429 and 5xx are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } => true,
            Error::ServerStatus { .. } => true,
            _ => false,
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::ServerStatus { status, .. } | Error::ClientStatus { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}
