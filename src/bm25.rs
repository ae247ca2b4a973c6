//! BM25 scoring with a title-match bonus.
//!
//! Statistics are per shard: each shard carries its own `idf` table,
//! average chunk length, and `k1`/`b` constants, so scores are only
//! comparable because every shard is built with the same formula.
//!
//! Length normalization uses the chunk's character count rather than its
//! token count; with the kana/kanji tokenizer character count tracks content
//! volume more closely.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::Chunk;
use crate::tokenize::tokenize;

pub const DEFAULT_K1: f64 = 1.5;
pub const DEFAULT_B: f64 = 0.75;
pub const DEFAULT_TITLE_BOOST: f64 = 2.0;

/// Shard-level statistics needed to score a chunk.
#[derive(Debug, Clone, Copy)]
pub struct ShardStats<'a> {
    pub idf: &'a BTreeMap<String, f64>,
    pub avg_length: f64,
    pub k1: f64,
    pub b: f64,
}

/// Smoothed BM25 inverse document frequency.
///
/// `ln((n - df + 0.5) / (df + 0.5) + 1)`; the `+ 1` keeps the value positive
/// even for a token present in every chunk.
pub fn idf(n: usize, df: usize) -> f64 {
    let n = n as f64;
    let df = df as f64;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

/// Document frequency of every token over `chunks`.
pub fn document_frequencies<'a, I>(chunks: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a Chunk>,
{
    let mut df = BTreeMap::new();
    for chunk in chunks {
        for token in &chunk.tokens {
            *df.entry(token.clone()).or_insert(0) += 1;
        }
    }
    df
}

/// BM25 score of `chunk` for `query_tokens`. Never negative.
pub fn score(query_tokens: &BTreeSet<String>, chunk: &Chunk, stats: &ShardStats<'_>) -> f64 {
    let avg_length = if stats.avg_length > 0.0 {
        stats.avg_length
    } else {
        1.0
    };
    let length_ratio = chunk.char_count as f64 / avg_length;
    let norm = stats.k1 * (1.0 - stats.b + stats.b * length_ratio);

    query_tokens
        .iter()
        .filter_map(|token| {
            let tf = chunk.term_frequency(token);
            let idf = stats.idf.get(token).copied().unwrap_or(0.0);
            if tf == 0 || idf <= 0.0 {
                return None;
            }
            let tf = tf as f64;
            Some(idf * tf * (stats.k1 + 1.0) / (tf + norm))
        })
        .sum()
}

/// Additive bonus for query tokens that also occur in the chunk title.
pub fn title_boost(query_tokens: &BTreeSet<String>, title: &str, weight: f64) -> f64 {
    if title.is_empty() {
        return 0.0;
    }
    let title_tokens = tokenize(title);
    let overlap = query_tokens.intersection(&title_tokens).count();
    weight * overlap as f64
}
