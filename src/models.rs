//! Core data models used throughout kaigi-search.
//!
//! These types represent the extracted documents consumed by the builder,
//! the chunks stored inside shards, and the hits returned by the query engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::tokenize::term_frequencies;

/// Document-level metadata written by the extraction stage.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub meeting: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// One extracted document file (`<doc_id>.json` in the extracted directory).
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedDocument {
    pub doc_id: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub pages: u32,
    #[serde(default)]
    pub chunks: Vec<RawChunk>,
}

/// A chunk as produced by the extraction stage, before tokenization.
///
/// Metadata fields are optional here; missing values fall back to the
/// owning document's [`DocumentMetadata`].
#[derive(Debug, Clone, Deserialize)]
pub struct RawChunk {
    pub chunk_id: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub meeting: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_page")]
    pub page_from: u32,
    #[serde(default = "default_page")]
    pub page_to: u32,
}

fn default_page() -> u32 {
    1
}

/// The atomic retrievable unit stored in a shard.
///
/// `tokens` and `tf` are always derived from `text` by the canonical
/// tokenizer; `char_count` is the number of characters (not bytes) of `text`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub tokens: Vec<String>,
    #[serde(default)]
    pub tf: BTreeMap<String, u32>,
    pub char_count: usize,
    pub meeting: String,
    pub agency: String,
    pub title: String,
    pub date: Option<String>,
    pub url: String,
    pub page_from: u32,
    pub page_to: u32,
}

fn pick(own: Option<String>, fallback: &Option<String>) -> Option<String> {
    own.filter(|s| !s.is_empty())
        .or_else(|| fallback.clone().filter(|s| !s.is_empty()))
}

impl Chunk {
    /// Build an indexable chunk from extraction output.
    pub fn from_raw(raw: RawChunk, doc_id: &str, meta: &DocumentMetadata) -> Self {
        let tf = term_frequencies(&raw.text);
        let tokens = tf.keys().cloned().collect();
        let page_to = raw.page_to.max(raw.page_from);

        Self {
            chunk_id: raw.chunk_id,
            doc_id: raw.doc_id.unwrap_or_else(|| doc_id.to_string()),
            char_count: raw.text.chars().count(),
            tokens,
            tf,
            meeting: pick(raw.meeting, &meta.meeting).unwrap_or_default(),
            agency: pick(raw.agency, &meta.agency).unwrap_or_default(),
            title: pick(raw.title, &meta.title).unwrap_or_default(),
            date: pick(raw.date, &meta.date),
            url: pick(raw.url, &meta.url).unwrap_or_default(),
            page_from: raw.page_from,
            page_to,
            text: raw.text,
        }
    }

    /// Restore `tf` for chunks read from shard files written without it.
    pub fn ensure_term_frequencies(&mut self) {
        if self.tf.is_empty() && !self.text.is_empty() {
            self.tf = term_frequencies(&self.text);
        }
    }

    /// Occurrences of `token` in this chunk's text.
    pub fn term_frequency(&self, token: &str) -> u32 {
        self.tf.get(token).copied().unwrap_or(0)
    }

    /// The chunk date, treating an empty string as absent.
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref().filter(|d| !d.is_empty())
    }
}

/// A ranked chunk returned for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub char_count: usize,
    pub meeting: String,
    pub agency: String,
    pub title: String,
    pub date: Option<String>,
    pub url: String,
    pub page_from: u32,
    pub page_to: u32,
    /// Relevance score rounded to one decimal place.
    pub score: f64,
    pub snippet: String,
}

impl ScoredHit {
    pub fn new(chunk: &Chunk, raw_score: f64, snippet: String) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            doc_id: chunk.doc_id.clone(),
            text: chunk.text.clone(),
            char_count: chunk.char_count,
            meeting: chunk.meeting.clone(),
            agency: chunk.agency.clone(),
            title: chunk.title.clone(),
            date: chunk.date.clone(),
            url: chunk.url.clone(),
            page_from: chunk.page_from,
            page_to: chunk.page_to,
            score: round_score(raw_score),
            snippet,
        }
    }
}

/// Round a score to one decimal place for display.
pub fn round_score(score: f64) -> f64 {
    (score * 10.0).round() / 10.0
}

/// Catalogue row describing one extracted document (`docs-meta.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMeta {
    pub doc_id: String,
    pub meeting: String,
    pub agency: String,
    pub title: String,
    pub date: Option<String>,
    pub url: String,
    pub pages: u32,
    pub chunks_count: usize,
}

impl DocMeta {
    pub fn from_document(doc: &ExtractedDocument) -> Self {
        let meta = &doc.metadata;
        Self {
            doc_id: doc.doc_id.clone(),
            meeting: meta.meeting.clone().unwrap_or_default(),
            agency: meta.agency.clone().unwrap_or_default(),
            title: meta.title.clone().unwrap_or_default(),
            date: meta.date.clone(),
            url: meta.url.clone().unwrap_or_default(),
            pages: doc.pages,
            chunks_count: doc.chunks.len(),
        }
    }
}
