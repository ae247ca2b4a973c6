//! TOML configuration.
//!
//! ```toml
//! [paths]
//! extracted_dir = "./data/extracted"
//! index_dir = "./public/index-shards"
//! public_dir = "./public"
//!
//! [index]
//! shard_size = 100
//! group_by = "meeting_month"
//!
//! [search]
//! default_size = 50
//! max_shards = 10
//!
//! [server]
//! bind = "127.0.0.1:8787"
//!
//! [summarizer]
//! provider = "http"
//! endpoint = "http://127.0.0.1:9000/summarize"
//! ```
//!
//! Every section except `[paths]` may be omitted.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::bm25::{DEFAULT_B, DEFAULT_K1, DEFAULT_TITLE_BOOST};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Directory of extracted document JSON files (builder input).
    pub extracted_dir: PathBuf,
    /// Directory receiving shard files and `_index.json`.
    pub index_dir: PathBuf,
    /// Directory receiving `docs-meta.json` and `trends/`.
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("./public")
}

/// How chunks are grouped before being split into shards.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// `"{meeting}_{YYYY-MM}"`
    #[default]
    MeetingMonth,
    Meeting,
    Agency,
    Month,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_shard_size")]
    pub shard_size: usize,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default = "default_k1")]
    pub k1: f64,
    #[serde(default = "default_b")]
    pub b: f64,
    /// Where the query engine reads shards from: a directory path or an
    /// `http(s)://` base URL. Defaults to `paths.index_dir`.
    #[serde(default)]
    pub location: Option<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            shard_size: default_shard_size(),
            group_by: GroupBy::default(),
            k1: default_k1(),
            b: default_b(),
            location: None,
        }
    }
}

fn default_shard_size() -> usize {
    100
}
fn default_k1() -> f64 {
    DEFAULT_K1
}
fn default_b() -> f64 {
    DEFAULT_B
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_size")]
    pub default_size: usize,
    #[serde(default = "default_from")]
    pub default_from: String,
    #[serde(default = "default_to")]
    pub default_to: String,
    #[serde(default = "default_title_boost")]
    pub title_boost: f64,
    #[serde(default = "default_snippet_window")]
    pub snippet_window: usize,
    #[serde(default = "default_snippet_stride")]
    pub snippet_stride: usize,
    /// Load at most this many shards (a prefix of the manifest). Fewer shards
    /// use less memory but can silently omit matches. `None` loads all.
    #[serde(default)]
    pub max_shards: Option<usize>,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_size: default_size(),
            default_from: default_from(),
            default_to: default_to(),
            title_boost: default_title_boost(),
            snippet_window: default_snippet_window(),
            snippet_stride: default_snippet_stride(),
            max_shards: None,
            fetch_concurrency: default_fetch_concurrency(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_size() -> usize {
    50
}
fn default_from() -> String {
    "2020-01-01".to_string()
}
fn default_to() -> String {
    "2030-12-31".to_string()
}
fn default_title_boost() -> f64 {
    DEFAULT_TITLE_BOOST
}
fn default_snippet_window() -> usize {
    200
}
fn default_snippet_stride() -> usize {
    50
}
fn default_fetch_concurrency() -> usize {
    16
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding a bearer token for the endpoint.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            api_key_env: None,
            max_chunks: default_max_chunks(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_chunks() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

impl SummarizerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// Configuration with every default, reading and writing under `root`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            paths: PathsConfig {
                extracted_dir: root.join("data").join("extracted"),
                index_dir: root.join("public").join("index-shards"),
                public_dir: root.join("public"),
            },
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            server: ServerConfig::default(),
            summarizer: SummarizerConfig::default(),
        }
    }

    /// The shard location the query engine reads from.
    pub fn index_location(&self) -> String {
        self.index
            .location
            .clone()
            .unwrap_or_else(|| self.paths.index_dir.to_string_lossy().into_owned())
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.index_dir == self.paths.extracted_dir
            || self.paths.index_dir == self.paths.public_dir
        {
            anyhow::bail!("paths.index_dir must differ from paths.extracted_dir and paths.public_dir");
        }
        if self.index.shard_size == 0 {
            anyhow::bail!("index.shard_size must be > 0");
        }
        if self.index.k1 <= 0.0 {
            anyhow::bail!("index.k1 must be > 0");
        }
        if !(0.0..=1.0).contains(&self.index.b) {
            anyhow::bail!("index.b must be in [0.0, 1.0]");
        }

        if self.search.default_size == 0 {
            anyhow::bail!("search.default_size must be > 0");
        }
        if self.search.snippet_window == 0 || self.search.snippet_stride == 0 {
            anyhow::bail!("search.snippet_window and search.snippet_stride must be > 0");
        }
        if self.search.fetch_concurrency == 0 {
            anyhow::bail!("search.fetch_concurrency must be > 0");
        }
        if self.search.max_shards == Some(0) {
            anyhow::bail!("search.max_shards must be > 0 when set");
        }

        match self.summarizer.provider.as_str() {
            "disabled" => {}
            "http" => {
                if self.summarizer.endpoint.is_none() {
                    anyhow::bail!("summarizer.endpoint must be set when provider is 'http'");
                }
            }
            other => anyhow::bail!(
                "Unknown summarizer provider: '{}'. Must be disabled or http.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
