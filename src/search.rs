//! Query engine: filter, score, rank, and excerpt.
//!
//! One request runs these stages in order:
//!
//! 1. Tokenize the query text. A query without tokens returns an empty
//!    response without touching the index.
//! 2. Load the manifest and fetch shards (see [`crate::loader`]).
//! 3. Drop chunks outside the date range, agency set, or meeting set.
//! 4. Score the survivors with their own shard's BM25 statistics plus a
//!    title boost, keeping only positive totals.
//! 5. Sort by score (descending), date (newest first, undated last), then
//!    chunk id; count; truncate; attach snippets.
//!
//! Each request emits one `search` diagnostics event through `tracing`.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::bm25;
use crate::config::{Config, SearchConfig};
use crate::error::SearchError;
use crate::loader::{load_manifest, load_shards, open_source, LoadOptions, ShardSource};
use crate::models::{Chunk, ScoredHit};
use crate::shard::Shard;
use crate::snippet::extract_snippet;
use crate::tokenize::tokenize;

/// A validated search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    /// Inclusive lower date bound, `YYYY-MM-DD`.
    pub from: String,
    /// Inclusive upper date bound, `YYYY-MM-DD`.
    pub to: String,
    /// Allowed agencies. Empty allows all.
    pub agencies: BTreeSet<String>,
    /// Allowed meetings. Empty allows all.
    pub meetings: BTreeSet<String>,
    pub size: usize,
}

impl SearchQuery {
    /// A query with the configured default range and size and no filters.
    pub fn new(text: impl Into<String>, search: &SearchConfig) -> Self {
        Self {
            text: text.into(),
            from: search.default_from.clone(),
            to: search.default_to.clone(),
            agencies: BTreeSet::new(),
            meetings: BTreeSet::new(),
            size: search.default_size,
        }
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        if self.size == 0 {
            return Err(SearchError::InvalidQuery("size must be > 0".to_string()));
        }
        parse_date("from", &self.from)?;
        parse_date("to", &self.to)?;
        Ok(())
    }

    fn admits(&self, chunk: &Chunk) -> Admission {
        if let Some(date) = chunk.date() {
            if date < self.from.as_str() || date > self.to.as_str() {
                return Admission::RejectedByDate;
            }
        }
        if !self.agencies.is_empty() && !self.agencies.contains(&chunk.agency) {
            return Admission::RejectedByAgency;
        }
        if !self.meetings.is_empty() && !self.meetings.contains(&chunk.meeting) {
            return Admission::RejectedByMeeting;
        }
        Admission::Admitted
    }
}

enum Admission {
    Admitted,
    RejectedByDate,
    RejectedByAgency,
    RejectedByMeeting,
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, SearchError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        SearchError::InvalidQuery(format!("{} must be a YYYY-MM-DD date, got {:?}", field, value))
    })
}

/// Split a comma-separated filter list, dropping blank items.
pub fn split_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ranking knobs taken from `[search]`.
#[derive(Debug, Clone, Copy)]
pub struct RankParams {
    pub title_boost: f64,
    pub snippet_window: usize,
    pub snippet_stride: usize,
}

impl RankParams {
    pub fn from_config(search: &SearchConfig) -> Self {
        Self {
            title_boost: search.title_boost,
            snippet_window: search.snippet_window,
            snippet_stride: search.snippet_stride,
        }
    }
}

/// Response body for one query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<ScoredHit>,
    /// Matches before truncation to `size`.
    pub count: usize,
    pub query: String,
    pub tokens: Vec<String>,
}

impl SearchResponse {
    pub fn empty(query: &str) -> Self {
        Self {
            hits: Vec::new(),
            count: 0,
            query: query.to_string(),
            tokens: Vec::new(),
        }
    }
}

/// Per-request counters reported in the diagnostics event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub scanned: usize,
    pub by_date: usize,
    pub by_agency: usize,
    pub by_meeting: usize,
    pub zero_score: usize,
    pub matched: usize,
}

/// Filter and score every chunk of `shards`, returning the top `query.size`
/// hits with snippets, the total match count, and the filter counters.
pub fn rank(
    shards: &[Shard],
    query: &SearchQuery,
    tokens: &BTreeSet<String>,
    params: &RankParams,
) -> (Vec<ScoredHit>, usize, FilterStats) {
    let mut stats = FilterStats::default();
    let mut scored: Vec<(f64, &Chunk)> = Vec::new();

    for shard in shards {
        let shard_stats = shard.stats();
        for chunk in &shard.chunks {
            stats.scanned += 1;
            match query.admits(chunk) {
                Admission::RejectedByDate => stats.by_date += 1,
                Admission::RejectedByAgency => stats.by_agency += 1,
                Admission::RejectedByMeeting => stats.by_meeting += 1,
                Admission::Admitted => {
                    let total = bm25::score(tokens, chunk, &shard_stats)
                        + bm25::title_boost(tokens, &chunk.title, params.title_boost);
                    if total > 0.0 {
                        scored.push((total, chunk));
                    } else {
                        stats.zero_score += 1;
                    }
                }
            }
        }
    }

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.date().cmp(&a.date()))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    let count = scored.len();
    stats.matched = count;
    scored.truncate(query.size);

    let hits = scored
        .into_iter()
        .map(|(score, chunk)| {
            let snippet =
                extract_snippet(&chunk.text, tokens, params.snippet_window, params.snippet_stride);
            ScoredHit::new(chunk, score, snippet)
        })
        .collect();

    (hits, count, stats)
}

/// Run one query against `source`.
pub async fn execute(
    source: Arc<dyn ShardSource>,
    query: &SearchQuery,
    search: &SearchConfig,
) -> Result<SearchResponse, SearchError> {
    let tokens = tokenize(&query.text);
    if tokens.is_empty() {
        return Ok(SearchResponse::empty(&query.text));
    }
    query.validate()?;

    let started = Instant::now();
    let entries = load_manifest(source.as_ref()).await?;
    let loaded = load_shards(source, &entries, LoadOptions::from_config(search)).await?;
    let (hits, count, stats) = rank(&loaded.shards, query, &tokens, &RankParams::from_config(search));

    tracing::info!(
        query = %query.text,
        tokens = tokens.len(),
        shards_requested = loaded.requested,
        shards_loaded = loaded.shards.len(),
        shards_failed = loaded.failed,
        scanned = stats.scanned,
        filtered_by_date = stats.by_date,
        filtered_by_agency = stats.by_agency,
        filtered_by_meeting = stats.by_meeting,
        zero_score = stats.zero_score,
        matched = stats.matched,
        returned = hits.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "search"
    );

    Ok(SearchResponse {
        hits,
        count,
        query: query.text.clone(),
        tokens: tokens.into_iter().collect(),
    })
}

/// Open the configured shard location for the query path.
pub fn open_index(config: &Config) -> Result<Arc<dyn ShardSource>> {
    let timeout = std::time::Duration::from_secs(config.search.fetch_timeout_secs);
    Ok(open_source(&config.index_location(), timeout)?)
}

/// `kaigi search`: run one query and print the hits.
pub async fn run_search(config: &Config, query: &SearchQuery, json: bool) -> Result<()> {
    let source = open_index(config)?;
    let response = execute(source, query, &config.search).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if response.hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in response.hits.iter().enumerate() {
        let title_display = if hit.title.is_empty() {
            "(untitled)"
        } else {
            hit.title.as_str()
        };
        println!("{}. [{:.1}] {} / {}", i + 1, hit.score, hit.meeting, title_display);
        println!("    date: {}", hit.date.as_deref().unwrap_or("-"));
        if !hit.agency.is_empty() {
            println!("    agency: {}", hit.agency);
        }
        println!("    pages: {}-{}", hit.page_from, hit.page_to);
        if !hit.url.is_empty() {
            println!("    url: {}", hit.url);
        }
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!("    id: {}", hit.chunk_id);
        println!();
    }
    println!(
        "{} matches (showing {})",
        response.count,
        response.hits.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentMetadata, RawChunk};

    struct Doc<'a> {
        id: &'a str,
        meeting: &'a str,
        agency: &'a str,
        title: &'a str,
        date: Option<&'a str>,
        text: &'a str,
    }

    fn chunk(d: &Doc<'_>) -> Chunk {
        let raw = RawChunk {
            chunk_id: d.id.to_string(),
            doc_id: Some(format!("doc_{}", d.id)),
            text: d.text.to_string(),
            meeting: Some(d.meeting.to_string()),
            agency: Some(d.agency.to_string()),
            title: Some(d.title.to_string()),
            date: d.date.map(str::to_string),
            url: None,
            page_from: 1,
            page_to: 1,
        };
        Chunk::from_raw(raw, "doc", &DocumentMetadata::default())
    }

    fn shard(id: &str, docs: &[Doc<'_>]) -> Shard {
        Shard::build(
            id.to_string(),
            id.to_string(),
            docs.iter().map(chunk).collect(),
            bm25::DEFAULT_K1,
            bm25::DEFAULT_B,
        )
    }

    fn corpus() -> Vec<Shard> {
        vec![
            shard(
                "s0",
                &[
                    Doc {
                        id: "ai_strategy",
                        meeting: "AI戦略会議",
                        agency: "内閣府",
                        title: "AI戦略",
                        date: Some("2025-08-01"),
                        text: "AI戦略の方向性について議論した。AIの社会実装を進める。",
                    },
                    Doc {
                        id: "budget",
                        meeting: "予算委員会",
                        agency: "財務省",
                        title: "予算報告",
                        date: Some("2025-08-02"),
                        text: "来年度予算の概要を報告した。",
                    },
                ],
            ),
            shard(
                "s1",
                &[Doc {
                    id: "ai_cases",
                    meeting: "デジタル会議",
                    agency: "デジタル庁",
                    title: "AI活用事例",
                    date: Some("2025-07-15"),
                    text: "自治体におけるAI活用事例を紹介した。",
                }],
            ),
        ]
    }

    fn query(text: &str) -> SearchQuery {
        SearchQuery::new(text, &SearchConfig::default())
    }

    fn params() -> RankParams {
        RankParams::from_config(&SearchConfig::default())
    }

    fn ids(hits: &[ScoredHit]) -> Vec<&str> {
        hits.iter().map(|h| h.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_ai_query_excludes_unrelated_chunk() {
        let q = query("AI");
        let (hits, count, stats) = rank(&corpus(), &q, &tokenize(&q.text), &params());
        assert_eq!(count, 2);
        assert!(!ids(&hits).contains(&"budget"));
        assert!(hits.iter().all(|h| h.score > 0.0));
        assert_eq!(stats.zero_score, 1);
    }

    #[test]
    fn test_date_range_scenario() {
        let shards = vec![shard(
            "s",
            &[
                Doc {
                    id: "A",
                    meeting: "AI戦略会議",
                    agency: "デジタル庁",
                    title: "AI戦略",
                    date: Some("2025-08-01"),
                    text: "AI戦略の方向性について議論した。",
                },
                Doc {
                    id: "B",
                    meeting: "予算委員会",
                    agency: "総務省",
                    title: "予算報告",
                    date: Some("2025-09-01"),
                    text: "来年度予算の概要を報告した。",
                },
                Doc {
                    id: "C",
                    meeting: "デジタル会議",
                    agency: "デジタル庁",
                    title: "AI活用事例",
                    date: Some("2024-01-01"),
                    text: "自治体のAI活用事例を紹介した。",
                },
            ],
        )];
        let mut q = query("AI");
        q.from = "2025-01-01".to_string();
        q.to = "2025-12-31".to_string();
        let tokens = tokenize(&q.text);
        let (hits, count, stats) = rank(&shards, &q, &tokens, &params());
        assert_eq!(ids(&hits), vec!["A"]);
        assert_eq!(count, 1);
        assert_eq!(stats.by_date, 1);
        assert_eq!(stats.zero_score, 1);

        let body_only = bm25::score(&tokens, &shards[0].chunks[0], &shards[0].stats());
        assert!(hits[0].score >= round_score_floor(body_only + bm25::DEFAULT_TITLE_BOOST));
    }

    fn round_score_floor(score: f64) -> f64 {
        (score * 10.0).floor() / 10.0
    }

    #[test]
    fn test_sorted_by_score_descending() {
        let q = query("AI 戦略");
        let (hits, _, _) = rank(&corpus(), &q, &tokenize(&q.text), &params());
        assert_eq!(hits[0].chunk_id, "ai_strategy");
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_agency_filter_restricts_hits() {
        let mut q = query("AI");
        q.agencies = split_list("デジタル庁");
        let (hits, count, stats) = rank(&corpus(), &q, &tokenize(&q.text), &params());
        assert_eq!(ids(&hits), vec!["ai_cases"]);
        assert_eq!(count, 1);
        assert_eq!(stats.by_agency, 2);
    }

    #[test]
    fn test_filters_are_intersective() {
        let mut q = query("AI");
        q.agencies = split_list("デジタル庁");
        q.meetings = split_list("AI戦略会議");
        let (hits, count, _) = rank(&corpus(), &q, &tokenize(&q.text), &params());
        assert!(hits.is_empty());
        assert_eq!(count, 0);
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let mut q = query("AI");
        q.from = "2025-08-01".to_string();
        q.to = "2025-08-01".to_string();
        let (hits, _, stats) = rank(&corpus(), &q, &tokenize(&q.text), &params());
        assert_eq!(ids(&hits), vec!["ai_strategy"]);
        assert_eq!(stats.by_date, 2);
    }

    #[test]
    fn test_undated_chunk_passes_date_filter() {
        let shards = vec![shard(
            "s",
            &[Doc {
                id: "undated",
                meeting: "m",
                agency: "a",
                title: "",
                date: None,
                text: "AI",
            }],
        )];
        let mut q = query("AI");
        q.from = "2030-01-01".to_string();
        let (hits, _, _) = rank(&shards, &q, &tokenize(&q.text), &params());
        assert_eq!(ids(&hits), vec!["undated"]);
    }

    #[test]
    fn test_size_caps_hits_but_not_count() {
        let mut q = query("AI");
        q.size = 1;
        let (hits, count, _) = rank(&corpus(), &q, &tokenize(&q.text), &params());
        assert_eq!(hits.len(), 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_ties_broken_by_date_then_id() {
        let docs = [
            Doc { id: "b", meeting: "m", agency: "a", title: "", date: Some("2025-01-01"), text: "DX" },
            Doc { id: "a", meeting: "m", agency: "a", title: "", date: Some("2025-01-01"), text: "DX" },
            Doc { id: "c", meeting: "m", agency: "a", title: "", date: Some("2025-03-01"), text: "DX" },
            Doc { id: "d", meeting: "m", agency: "a", title: "", date: None, text: "DX" },
            Doc { id: "x", meeting: "m", agency: "a", title: "", date: None, text: "その他" },
        ];
        let q = query("DX");
        let (hits, _, _) = rank(&[shard("s", &docs)], &q, &tokenize(&q.text), &params());
        assert_eq!(ids(&hits), vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn test_title_only_match_is_candidate() {
        let docs = [
            Doc { id: "t", meeting: "m", agency: "a", title: "DX推進", date: None, text: "本文のみ" },
            Doc { id: "u", meeting: "m", agency: "a", title: "", date: None, text: "本文のみ" },
        ];
        let q = query("DX");
        let (hits, _, _) = rank(&[shard("s", &docs)], &q, &tokenize(&q.text), &params());
        assert_eq!(ids(&hits), vec!["t"]);
        assert_eq!(hits[0].score, 2.0);
    }

    #[test]
    fn test_hits_carry_snippets() {
        // Matches on the title token only; the body is short enough to return whole
        let q = query("予算報告");
        let (hits, _, _) = rank(&corpus(), &q, &tokenize(&q.text), &params());
        assert_eq!(ids(&hits), vec!["budget"]);
        assert_eq!(hits[0].snippet, "来年度予算の概要を報告した。");
    }

    #[test]
    fn test_validate() {
        assert!(query("AI").validate().is_ok());
        let mut q = query("AI");
        q.size = 0;
        assert!(matches!(q.validate(), Err(SearchError::InvalidQuery(_))));
        let mut q = query("AI");
        q.from = "yesterday".to_string();
        assert!(matches!(q.validate(), Err(SearchError::InvalidQuery(_))));
    }

    #[test]
    fn test_split_list() {
        let set = split_list(" 総務省, ,デジタル庁 ");
        assert_eq!(set.len(), 2);
        assert!(set.contains("総務省"));
        assert!(set.contains("デジタル庁"));
    }

    #[tokio::test]
    async fn test_empty_query_does_not_touch_index() {
        // The source points nowhere; an empty query must still succeed.
        let source: Arc<dyn ShardSource> =
            Arc::new(crate::loader::DirSource::new("/nonexistent/kaigi-index"));
        let response = execute(source, &query("、。！"), &SearchConfig::default())
            .await
            .unwrap();
        assert!(response.hits.is_empty());
        assert_eq!(response.count, 0);
        assert!(response.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_blank_query_skips_validation() {
        let source: Arc<dyn ShardSource> =
            Arc::new(crate::loader::DirSource::new("/nonexistent/kaigi-index"));
        let mut q = query("");
        q.size = 0;
        let response = execute(source.clone(), &q, &SearchConfig::default()).await.unwrap();
        assert_eq!(response.count, 0);

        q.text = "AI".to_string();
        assert!(matches!(
            execute(source, &q, &SearchConfig::default()).await,
            Err(SearchError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_index_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let source: Arc<dyn ShardSource> = Arc::new(crate::loader::DirSource::new(tmp.path()));
        let err = execute(source, &query("AI"), &SearchConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::IndexUnavailable(_)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const AGENCIES: [&str; 3] = ["内閣府", "総務省", "デジタル庁"];
        const MEETINGS: [&str; 3] = ["AI戦略会議", "予算委員会", "デジタル会議"];
        const WORDS: [&str; 5] = ["AI", "DX", "予算", "戦略", "活用"];

        /// (agency, meeting, month, word mask) of one generated chunk.
        type Shape = (usize, usize, Option<u32>, u8);

        fn pick(names: &[&str], mask: u8) -> BTreeSet<String> {
            names
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, n)| n.to_string())
                .collect()
        }

        fn words(mask: u8) -> String {
            pick(&WORDS, mask).into_iter().collect::<Vec<_>>().join(" ")
        }

        fn date(month: u32) -> String {
            format!("2025-{:02}-01", month)
        }

        fn build_corpus(shapes: &[Shape]) -> Vec<Shard> {
            let owned: Vec<(String, Option<String>, String)> = shapes
                .iter()
                .enumerate()
                .map(|(i, (_, _, month, mask))| (format!("c{i}"), month.map(date), words(*mask)))
                .collect();
            let docs: Vec<Doc<'_>> = shapes
                .iter()
                .zip(&owned)
                .map(|((agency, meeting, _, _), (id, date, text))| Doc {
                    id,
                    meeting: MEETINGS[*meeting],
                    agency: AGENCIES[*agency],
                    title: "",
                    date: date.as_deref(),
                    text,
                })
                .collect();
            let mid = docs.len() / 2;
            vec![shard("p0", &docs[..mid]), shard("p1", &docs[mid..])]
        }

        fn matched(shards: &[Shard], q: &SearchQuery) -> BTreeSet<String> {
            let (hits, count, _) = rank(shards, q, &tokenize(&q.text), &params());
            assert_eq!(hits.len(), count);
            hits.into_iter().map(|h| h.chunk_id).collect()
        }

        fn corpus_shapes() -> impl Strategy<Value = Vec<Shape>> {
            prop::collection::vec(
                (0..3usize, 0..3usize, prop::option::of(1..=12u32), 1..32u8),
                1..16,
            )
        }

        proptest! {
            #[test]
            fn relaxing_filters_never_removes_hits(
                shapes in corpus_shapes(),
                query_words in 1..32u8,
                agency_mask in 0..8u8,
                extra_agencies in 0..8u8,
                meeting_mask in 0..8u8,
                drop_meetings in any::<bool>(),
                (lo, hi) in (1..=12u32, 1..=12u32),
                widen in 0..4u32,
            ) {
                let shards = build_corpus(&shapes);
                let mut strict = query(&words(query_words));
                strict.size = 1000;
                strict.agencies = pick(&AGENCIES, agency_mask);
                strict.meetings = pick(&MEETINGS, meeting_mask);
                strict.from = date(lo.min(hi));
                strict.to = date(lo.max(hi));

                let mut relaxed = strict.clone();
                if agency_mask != 0 {
                    relaxed.agencies = pick(&AGENCIES, agency_mask | extra_agencies);
                }
                if drop_meetings {
                    relaxed.meetings.clear();
                }
                relaxed.from = date(lo.min(hi).saturating_sub(widen).max(1));
                relaxed.to = date((lo.max(hi) + widen).min(12));

                let strict_hits = matched(&shards, &strict);
                let relaxed_hits = matched(&shards, &relaxed);
                prop_assert!(strict_hits.is_subset(&relaxed_hits));
            }

            #[test]
            fn combined_filters_intersect(
                shapes in corpus_shapes(),
                query_words in 1..32u8,
                agency_mask in 1..8u8,
                meeting_mask in 1..8u8,
            ) {
                let shards = build_corpus(&shapes);
                let mut by_agency = query(&words(query_words));
                by_agency.size = 1000;
                by_agency.agencies = pick(&AGENCIES, agency_mask);

                let mut by_meeting = by_agency.clone();
                by_meeting.agencies.clear();
                by_meeting.meetings = pick(&MEETINGS, meeting_mask);

                let mut both = by_agency.clone();
                both.meetings = by_meeting.meetings.clone();

                let expected: BTreeSet<String> = matched(&shards, &by_agency)
                    .intersection(&matched(&shards, &by_meeting))
                    .cloned()
                    .collect();
                prop_assert_eq!(matched(&shards, &both), expected);
            }
        }
    }
}
