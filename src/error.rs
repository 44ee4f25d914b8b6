//! Error types for the telemetry extension.
//!
//! A single enum for every fallible internal operation, mirroring the
//! teacher's `ethhook_common::error` shape: one variant per subsystem, a
//! `thiserror` derive, and a crate-wide `Result` alias.

use thiserror::Error;

/// Main error type for extension operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid environment configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Host lifecycle API protocol violation or unrecoverable failure.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Ingest backend rejected or never acknowledged a POST.
    #[error("backend error: {0}")]
    Backend(String),

    /// Payload body could not be decoded as gzip/deflate.
    #[error("payload decode error: {0}")]
    Decode(String),

    /// Host logs-subscription API rejected the subscribe request.
    #[error("logs subscription error: {0}")]
    LogsSubscribe(String),

    /// Lower-level HTTP client failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Underlying I/O failure (decompression streams, socket binds).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for extension operations.
pub type Result<T> = std::result::Result<T, Error>;
