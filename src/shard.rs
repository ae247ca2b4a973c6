//! Shards and the shard manifest.
//!
//! A shard is an immutable, self-contained partition of the corpus: its
//! chunks plus the BM25 statistics computed over exactly those chunks. The
//! manifest (`_index.json`) lists every shard file of one build.
//!
//! # File naming
//!
//! Shard files are named `{shard_id}.{hash}.json` where `hash` is the first
//! eight hex digits of the SHA-256 of the file contents and `shard_id` has
//! path-hostile characters replaced. Identical content always maps to the
//! same name, and a rebuild never rewrites a file the previous manifest still
//! references with different bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::bm25::{self, ShardStats};
use crate::error::ShardError;
use crate::models::Chunk;

/// File name of the shard manifest inside the index directory.
pub const MANIFEST_FILE: &str = "_index.json";

/// An independently loadable partition of chunks with its own statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: String,
    pub group: String,
    pub chunk_count: usize,
    pub chunks: Vec<Chunk>,
    pub idf: BTreeMap<String, f64>,
    pub avg_length: f64,
    pub k1: f64,
    pub b: f64,
}

/// One manifest row pointing at a shard file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIndexEntry {
    pub shard_id: String,
    pub filename: String,
    pub group: String,
    pub chunk_count: usize,
}

impl Shard {
    /// Build a shard and compute its statistics from `chunks`.
    pub fn build(shard_id: String, group: String, chunks: Vec<Chunk>, k1: f64, b: f64) -> Self {
        let n = chunks.len();
        let idf = bm25::document_frequencies(&chunks)
            .into_iter()
            .map(|(token, df)| (token, bm25::idf(n, df)))
            .collect();

        let total_chars: usize = chunks.iter().map(|c| c.char_count).sum();
        let avg_length = if n == 0 || total_chars == 0 {
            1.0
        } else {
            total_chars as f64 / n as f64
        };

        Self {
            shard_id,
            group,
            chunk_count: n,
            chunks,
            idf,
            avg_length,
            k1,
            b,
        }
    }

    /// Borrow the statistics needed by [`bm25::score`].
    pub fn stats(&self) -> ShardStats<'_> {
        ShardStats {
            idf: &self.idf,
            avg_length: self.avg_length,
            k1: self.k1,
            b: self.b,
        }
    }

    /// Serialize to the compact on-disk JSON form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ShardError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a shard file, validating its invariants.
    ///
    /// Chunks written without a term-frequency table get one derived from
    /// their text.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ShardError> {
        let mut shard: Shard = serde_json::from_slice(bytes)?;
        if shard.chunk_count != shard.chunks.len() {
            return Err(ShardError::ChunkCountMismatch {
                shard_id: shard.shard_id,
                declared: shard.chunk_count,
                actual: shard.chunks.len(),
            });
        }
        for chunk in &mut shard.chunks {
            chunk.ensure_term_frequencies();
        }
        Ok(shard)
    }

    /// Content-addressed file name for the given serialized bytes.
    pub fn file_name(&self, bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        format!(
            "{}.{}.json",
            sanitize_file_stem(&self.shard_id),
            hex::encode(&digest[..4])
        )
    }

    /// Manifest row for this shard stored under `filename`.
    pub fn index_entry(&self, filename: String) -> ShardIndexEntry {
        ShardIndexEntry {
            shard_id: self.shard_id.clone(),
            filename,
            group: self.group.clone(),
            chunk_count: self.chunk_count,
        }
    }
}

/// Replace characters that are unsafe in file names on common platforms.
pub fn sanitize_file_stem(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "shard".to_string()
    } else {
        cleaned
    }
}

/// Whether `name` has the `{stem}.{hash}.json` shape produced by
/// [`Shard::file_name`].
pub fn is_shard_file_name(name: &str) -> bool {
    let Some(rest) = name.strip_suffix(".json") else {
        return false;
    };
    match rest.rsplit_once('.') {
        Some((stem, hash)) => {
            !stem.is_empty()
                && hash.len() == 8
                && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

/// Parse `_index.json` contents.
pub fn parse_manifest(bytes: &[u8]) -> Result<Vec<ShardIndexEntry>, ShardError> {
    Ok(serde_json::from_slice(bytes)?)
}
