//! Canonical tokenizer shared by the index builder and the query engine.
//!
//! Meeting documents are mostly Japanese with embedded acronyms ("AI", "DX",
//! "5G"). Without a dictionary we approximate words with two candidate streams:
//!
//! 1. Runs of 2–4 contiguous kana/kanji characters (hiragana, katakana, the
//!    prolonged sound mark `ー`, and CJK ideographs). Longer runs are consumed
//!    left to right in pieces of at most four characters; a single leftover
//!    character is dropped.
//! 2. Runs of ASCII letters and digits of any length, so one-letter acronyms
//!    and numbers survive.
//!
//! Every candidate is lowercased. [`tokenize`] returns the deduplicated set and
//! [`term_frequencies`] returns the occurrence count of each member of that
//! set. Both use ordered collections so their output never depends on hashing
//! or call order.
//!
//! Shard files store the output of this module. Any change to the rules here
//! must be followed by a full `kaigi build`, otherwise stored tokens and
//! query tokens drift apart.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static CJK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ぁ-んァ-ヶー一-龯]{2,4}").expect("CJK pattern is valid"));

static ALNUM_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]+").expect("alphanumeric pattern is valid"));

/// Iterate over every candidate term in `text`, lowercased, duplicates included.
fn candidates(text: &str) -> impl Iterator<Item = String> + '_ {
    let cjk = CJK_RUN.find_iter(text).map(|m| m.as_str().to_string());
    let alnum = ALNUM_RUN
        .find_iter(text)
        .map(|m| m.as_str().to_ascii_lowercase());
    cjk.chain(alnum)
}

/// Convert raw text into its set of index terms.
///
/// ```rust
/// use kaigi_search::tokenize::tokenize;
///
/// let tokens = tokenize("AI戦略会議 DX");
/// assert!(tokens.contains("ai"));
/// assert!(tokens.contains("dx"));
/// assert!(tokens.contains("戦略会議"));
/// ```
pub fn tokenize(text: &str) -> BTreeSet<String> {
    candidates(text).collect()
}

/// Count how often each token of [`tokenize`] occurs in `text`.
///
/// The key set is always identical to `tokenize(text)`.
pub fn term_frequencies(text: &str) -> BTreeMap<String, u32> {
    let mut tf = BTreeMap::new();
    for term in candidates(text) {
        *tf.entry(term).or_insert(0) += 1;
    }
    tf
}
