//! Shard loading for the query path.
//!
//! The loader resolves the manifest and fetches the shards it names from a
//! [`ShardSource`]: a local directory or a static file host reached over
//! HTTP. Fetches run concurrently and fail independently:
//!
//! - a missing, malformed, or late shard is logged and skipped;
//! - only a missing manifest or zero loaded shards fails the request.
//!
//! Nothing is cached between requests. Every fetch of one request shares a
//! single deadline, and dropping the returned future aborts the fetches still
//! in flight.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::SearchConfig;
use crate::error::{SearchError, ShardError};
use crate::shard::{parse_manifest, Shard, ShardIndexEntry, MANIFEST_FILE};

/// Somewhere shard files and the manifest can be read from.
#[async_trait]
pub trait ShardSource: Send + Sync {
    /// Human-readable location, used in log events and error messages.
    fn describe(&self) -> String;

    /// Read the raw bytes of `name` (the manifest or a shard file).
    async fn read(&self, name: &str) -> Result<Vec<u8>, ShardError>;

    /// The directory backing this source, when it is a local one.
    fn local_dir(&self) -> Option<&Path> {
        None
    }
}

/// Shards stored in a local directory.
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Manifest entries are data, not trusted paths: only bare file names are
/// accepted.
fn check_file_name(name: &str) -> Result<(), ShardError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ShardError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid shard file name: {:?}", name),
        )));
    }
    Ok(())
}

#[async_trait]
impl ShardSource for DirSource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn local_dir(&self) -> Option<&Path> {
        Some(&self.root)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, ShardError> {
        check_file_name(name)?;
        Ok(tokio::fs::read(self.root.join(name)).await?)
    }
}

/// Shards published as static files under a base URL.
pub struct HttpSource {
    base: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, ShardError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ShardSource for HttpSource {
    fn describe(&self) -> String {
        self.base.clone()
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, ShardError> {
        check_file_name(name)?;
        let url = format!("{}/{}", self.base, name);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ShardError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Pick a source for `location`: an `http(s)://` URL or a directory path.
pub fn open_source(location: &str, timeout: Duration) -> Result<Arc<dyn ShardSource>, ShardError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Arc::new(HttpSource::new(location, timeout)?))
    } else {
        Ok(Arc::new(DirSource::new(location)))
    }
}

/// Fan-out limits for one request.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Load only the first `n` manifest entries. `None` loads every shard.
    pub max_shards: Option<usize>,
    /// Maximum fetches in flight at once.
    pub concurrency: usize,
    /// Deadline for the whole fetch phase.
    pub timeout: Duration,
}

impl LoadOptions {
    pub fn from_config(search: &SearchConfig) -> Self {
        Self {
            max_shards: search.max_shards,
            concurrency: search.fetch_concurrency,
            timeout: Duration::from_secs(search.fetch_timeout_secs),
        }
    }

    /// Load every shard regardless of `max_shards`.
    pub fn unbounded(self) -> Self {
        Self {
            max_shards: None,
            ..self
        }
    }
}

/// Shards that loaded successfully, in manifest order.
#[derive(Debug, Default)]
pub struct LoadedShards {
    pub shards: Vec<Shard>,
    pub requested: usize,
    pub failed: usize,
}

/// Read and parse the manifest.
pub async fn load_manifest(source: &dyn ShardSource) -> Result<Vec<ShardIndexEntry>, SearchError> {
    let bytes = source.read(MANIFEST_FILE).await.map_err(|e| {
        SearchError::IndexUnavailable(format!(
            "cannot read {} from {}: {}",
            MANIFEST_FILE,
            source.describe(),
            e
        ))
    })?;
    parse_manifest(&bytes).map_err(|e| {
        SearchError::IndexUnavailable(format!("malformed {}: {}", MANIFEST_FILE, e))
    })
}

/// Fetch and parse the shards named by `entries`.
///
/// Returns [`SearchError::NoShardsLoaded`] when nothing could be loaded.
pub async fn load_shards(
    source: Arc<dyn ShardSource>,
    entries: &[ShardIndexEntry],
    opts: LoadOptions,
) -> Result<LoadedShards, SearchError> {
    let selected = &entries[..opts.max_shards.unwrap_or(entries.len()).min(entries.len())];
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let deadline = Instant::now() + opts.timeout;
    let timeout_secs = opts.timeout.as_secs();

    let mut tasks = JoinSet::new();
    for (position, entry) in selected.iter().cloned().enumerate() {
        let source = Arc::clone(&source);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let fetch = async {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| ShardError::Io(std::io::Error::other(e)))?;
                let bytes = source.read(&entry.filename).await?;
                Shard::from_slice(&bytes)
            };
            let result = match tokio::time::timeout_at(deadline, fetch).await {
                Ok(result) => result,
                Err(_) => Err(ShardError::Timeout(timeout_secs)),
            };
            (position, entry, result)
        });
    }

    let mut loaded: Vec<(usize, Shard)> = Vec::with_capacity(selected.len());
    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((position, entry, Ok(shard))) => {
                if shard.chunk_count != entry.chunk_count {
                    tracing::warn!(
                        shard = %entry.shard_id,
                        manifest = entry.chunk_count,
                        actual = shard.chunk_count,
                        "manifest chunk count is stale"
                    );
                }
                loaded.push((position, shard));
            }
            Ok((_, entry, Err(e))) => {
                failed += 1;
                tracing::warn!(shard = %entry.shard_id, file = %entry.filename, error = %e, "skipping shard");
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "shard fetch task failed");
            }
        }
    }

    if loaded.is_empty() {
        return Err(SearchError::NoShardsLoaded {
            requested: selected.len(),
            failed,
        });
    }

    loaded.sort_by_key(|(position, _)| *position);
    Ok(LoadedShards {
        shards: loaded.into_iter().map(|(_, shard)| shard).collect(),
        requested: selected.len(),
        failed,
    })
}
