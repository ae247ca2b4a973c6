//! Query-focused excerpts.
//!
//! A fixed-width window slides over the chunk text in character steps, with a
//! final window flush against the end of the text; the window containing the
//! most distinct query tokens wins, earliest first.
//! Matching is case-insensitive substring containment, so `AI` in the text
//! matches the token `ai` and a CJK token matches wherever it appears.

use std::collections::BTreeSet;

const ELLIPSIS: &str = "...";

/// Extract the excerpt of `text` that best covers `tokens`.
///
/// Texts no longer than `window` characters are returned whole (trimmed).
/// Otherwise `...` marks truncation on either side.
pub fn extract_snippet(text: &str, tokens: &BTreeSet<String>, window: usize, stride: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let window = window.max(1);

    if len <= window {
        return text.trim().to_string();
    }

    let last = len - window;
    let stride = stride.max(1);
    let tail = (last % stride != 0).then_some(last);

    let mut best_start = 0;
    let mut best_count = 0;
    for start in (0..=last).step_by(stride).chain(tail) {
        let lowered = chars[start..start + window]
            .iter()
            .collect::<String>()
            .to_lowercase();
        let count = tokens
            .iter()
            .filter(|t| lowered.contains(t.as_str()))
            .count();
        if count > best_count {
            best_count = count;
            best_start = start;
        }
    }

    let end = best_start + window;
    let mut snippet = String::with_capacity(window * 3 + 2 * ELLIPSIS.len());
    if best_start > 0 {
        snippet.push_str(ELLIPSIS);
    }
    snippet.extend(&chars[best_start..end]);
    if end < len {
        snippet.push_str(ELLIPSIS);
    }
    snippet.trim().to_string()
}
