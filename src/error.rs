//! Error types for hotdl.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server ignored range request starting at {requested}")]
    RangeIgnored { requested: u64 },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download for {0} is already running")]
    AlreadyRunning(String),

    #[error("segment {start}-{end} failed after {attempts} attempts")]
    SegmentExhausted { start: u64, end: u64, attempts: u32 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("missing expected hash for {0}")]
    MissingHash(String),

    #[error("unsupported hash length {0}")]
    UnsupportedHash(usize),

    #[error("download was cancelled")]
    Cancelled,

    #[error("segment worker stopped unexpectedly: {0}")]
    Worker(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is empty")]
    Empty,

    #[error("invalid size {value:?} on line {line}")]
    InvalidSize { line: usize, value: String },

    #[error("invalid base URL {0:?}: {1}")]
    InvalidBaseUrl(String, #[source] url::ParseError),

    #[error("cannot resolve {0:?} against the base URL: {1}")]
    InvalidPath(String, #[source] url::ParseError),
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;
