//! Error taxonomy for the library.
//!
//! Per-shard failures ([`ShardError`]) are recovered inside the loader; only
//! total unavailability surfaces as a [`SearchError`]. Summarizer failures are
//! kept in their own type so they can never be mistaken for search failures.

use std::path::PathBuf;

/// Failure reading or parsing a single shard or manifest file.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("shard {shard_id} declares {declared} chunks but contains {actual}")]
    ChunkCountMismatch {
        shard_id: String,
        declared: usize,
        actual: usize,
    },

    #[error("timed out after {0} seconds")]
    Timeout(u64),
}

/// Request-level search failure.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("no shards could be loaded ({failed} of {requested} failed)")]
    NoShardsLoaded { requested: usize, failed: usize },

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Failure calling the downstream summarization service.
#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("summarizer is disabled; set [summarizer] provider in config")]
    Disabled,

    #[error("summarizer request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("summarizer returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid summarizer response: {0}")]
    InvalidResponse(String),

    #[error("unknown summarizer provider: {0}")]
    UnknownProvider(String),

    #[error("summarizer misconfigured: {0}")]
    Config(String),
}

/// Failure during an index build. Any of these aborts the build before the
/// manifest is replaced.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse extracted document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no extracted documents found in {0}")]
    NoInput(PathBuf),

    #[error("duplicate chunk id: {0}")]
    DuplicateChunk(String),

    #[error("failed to serialize output: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Shard(#[from] ShardError),
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}
