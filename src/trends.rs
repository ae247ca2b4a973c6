//! Build-time catalogue outputs: the document list and monthly trends.
//!
//! Written next to the index so the presentation layer can render document
//! listings and per-month keyword charts without touching shard files.
//!
//! - `docs-meta.json`: one [`DocMeta`] per extracted document.
//! - `trends/{YYYY-MM}.json`: one [`MonthlyTrend`] per month (`undated` for
//!   chunks without a usable date).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::build::{month_of, write_atomic};
use crate::error::BuildError;
use crate::models::{Chunk, DocMeta, ExtractedDocument};

/// Number of keywords kept per month.
pub const TOP_KEYWORDS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCount {
    pub term: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingCount {
    pub meeting: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyTrend {
    pub month: String,
    pub keywords: Vec<TermCount>,
    pub meetings: Vec<MeetingCount>,
    pub doc_count: usize,
    pub chunk_count: usize,
}

#[derive(Default)]
struct MonthAccumulator<'a> {
    terms: BTreeMap<&'a str, u64>,
    meetings: BTreeMap<&'a str, u64>,
    docs: BTreeSet<&'a str>,
    chunks: usize,
}

/// Aggregate chunks into per-month trends, ordered by month.
///
/// Keywords are ranked by total occurrences (descending), ties by term.
/// Meetings are ranked by chunk count, ties by name.
pub fn monthly_trends(chunks: &[Chunk]) -> Vec<MonthlyTrend> {
    let mut months: BTreeMap<&str, MonthAccumulator> = BTreeMap::new();

    for chunk in chunks {
        let month = month_of(chunk.date()).unwrap_or("undated");
        let acc = months.entry(month).or_default();
        for (term, count) in &chunk.tf {
            *acc.terms.entry(term.as_str()).or_insert(0) += u64::from(*count);
        }
        let meeting = if chunk.meeting.is_empty() {
            "unknown"
        } else {
            chunk.meeting.as_str()
        };
        *acc.meetings.entry(meeting).or_insert(0) += 1;
        acc.docs.insert(chunk.doc_id.as_str());
        acc.chunks += 1;
    }

    months
        .into_iter()
        .map(|(month, acc)| {
            let mut keywords: Vec<TermCount> = acc
                .terms
                .into_iter()
                .map(|(term, count)| TermCount {
                    term: term.to_string(),
                    count,
                })
                .collect();
            keywords.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
            keywords.truncate(TOP_KEYWORDS);

            let mut meetings: Vec<MeetingCount> = acc
                .meetings
                .into_iter()
                .map(|(meeting, count)| MeetingCount {
                    meeting: meeting.to_string(),
                    count,
                })
                .collect();
            meetings.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.meeting.cmp(&b.meeting)));

            MonthlyTrend {
                month: month.to_string(),
                keywords,
                meetings,
                doc_count: acc.docs.len(),
                chunk_count: acc.chunks,
            }
        })
        .collect()
}

/// Serialized catalogue outputs of one build, ready to be written.
#[derive(Debug, Clone)]
pub struct Catalog {
    docs_meta: Vec<u8>,
    trend_files: Vec<(String, Vec<u8>)>,
}

impl Catalog {
    /// Compute and serialize `docs-meta.json` and every monthly trend file.
    pub fn prepare(documents: &[ExtractedDocument], chunks: &[Chunk]) -> Result<Self, BuildError> {
        let docs_meta: Vec<DocMeta> = documents.iter().map(DocMeta::from_document).collect();
        let trend_files = monthly_trends(chunks)
            .iter()
            .map(|t| Ok((format!("{}.json", t.month), serde_json::to_vec_pretty(t)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        Ok(Self {
            docs_meta: serde_json::to_vec_pretty(&docs_meta)?,
            trend_files,
        })
    }

    /// Number of monthly trend files.
    pub fn months(&self) -> usize {
        self.trend_files.len()
    }

    /// Write `docs-meta.json` and `trends/*.json` under `public_dir`.
    pub fn write(&self, public_dir: &Path) -> Result<(), BuildError> {
        let trends_dir = public_dir.join("trends");
        fs::create_dir_all(&trends_dir).map_err(|e| BuildError::io(&trends_dir, e))?;

        let docs_path = public_dir.join("docs-meta.json");
        write_atomic(&docs_path, &self.docs_meta).map_err(|e| BuildError::io(&docs_path, e))?;

        for (name, bytes) in &self.trend_files {
            let path = trends_dir.join(name);
            write_atomic(&path, bytes).map_err(|e| BuildError::io(&path, e))?;
        }
        Ok(())
    }

    /// Remove trend files for months this catalogue no longer has. Returns
    /// the number removed; failures are logged.
    pub fn remove_stale_months(&self, public_dir: &Path) -> usize {
        let current: BTreeSet<&str> = self.trend_files.iter().map(|(n, _)| n.as_str()).collect();
        let Ok(entries) = fs::read_dir(public_dir.join("trends")) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") || current.contains(name.as_str()) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(file = %name, error = %e, "failed to remove stale trend file"),
            }
        }
        removed
    }
}
