//! Summarization boundary.
//!
//! The top hits of a query are forwarded to an external summarization
//! service; its answer is passed through unchanged. The service is an
//! opaque HTTP endpoint:
//!
//! ```text
//! POST {endpoint}
//! { "query": "...", "chunks": [ { meeting, agency, date, title, snippet, url, page_from, page_to } ] }
//!
//! 200 { "summary": "...", "sources": [ { doc_url, meeting, date, pages } ],
//!       "cost_estimate": { prompt_tokens, completion_tokens } }
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, SummarizerConfig};
use crate::error::SummarizeError;
use crate::models::ScoredHit;
use crate::search::{execute, open_index, SearchQuery};

/// One hit as sent to the summarization service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryChunk {
    pub meeting: String,
    pub agency: String,
    pub date: Option<String>,
    pub title: String,
    pub snippet: String,
    pub url: String,
    pub page_from: u32,
    pub page_to: u32,
}

impl From<&ScoredHit> for SummaryChunk {
    fn from(hit: &ScoredHit) -> Self {
        Self {
            meeting: hit.meeting.clone(),
            agency: hit.agency.clone(),
            date: hit.date.clone(),
            title: hit.title.clone(),
            snippet: hit.snippet.clone(),
            url: hit.url.clone(),
            page_from: hit.page_from,
            page_to: hit.page_to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub query: String,
    pub chunks: Vec<SummaryChunk>,
}

impl SummaryRequest {
    /// Take the first `max_chunks` hits, in rank order.
    pub fn from_hits(query: &str, hits: &[ScoredHit], max_chunks: usize) -> Self {
        Self {
            query: query.to_string(),
            chunks: hits.iter().take(max_chunks).map(SummaryChunk::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarySource {
    #[serde(default)]
    pub doc_url: String,
    #[serde(default)]
    pub meeting: String,
    #[serde(default)]
    pub date: Option<String>,
    /// Page reference as returned by the service (`"3-5"`, `[3, 5]`, ...).
    #[serde(default)]
    pub pages: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<SummarySource>,
    #[serde(default)]
    pub cost_estimate: CostEstimate,
}

impl SummaryResponse {
    /// The answer for a query without hits. The service is not called.
    pub fn empty() -> Self {
        Self {
            summary: String::new(),
            sources: Vec::new(),
            cost_estimate: CostEstimate::default(),
        }
    }
}

/// A summarization backend.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Provider name from config (`"disabled"`, `"http"`).
    fn name(&self) -> &str;

    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse, SummarizeError>;
}

/// Used when `summarizer.provider = "disabled"`. Every call fails.
pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn summarize(&self, _request: &SummaryRequest) -> Result<SummaryResponse, SummarizeError> {
        Err(SummarizeError::Disabled)
    }
}

/// Posts requests to an HTTP summarization service with retry/backoff.
pub struct HttpSummarizer {
    endpoint: String,
    api_key: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self, SummarizeError> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            SummarizeError::Config("summarizer.endpoint required for http provider".into())
        })?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint,
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    fn name(&self) -> &str {
        "http"
    }

    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse, SummarizeError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut builder = self.client.post(&self.endpoint).json(request);
            if let Some(ref key) = self.api_key {
                builder = builder.bearer_auth(key);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body = response.bytes().await?;
                        return serde_json::from_slice(&body)
                            .map_err(|e| SummarizeError::InvalidResponse(e.to_string()));
                    }

                    let body = response.text().await.unwrap_or_default();
                    let err = SummarizeError::Api {
                        status: status.as_u16(),
                        body,
                    };
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, status = status.as_u16(), "summarizer request failed, retrying");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "summarizer request failed, retrying");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            SummarizeError::InvalidResponse("summarization failed after retries".into())
        }))
    }
}

/// Instantiate the summarizer named by `config.provider`.
pub fn create_summarizer(config: &SummarizerConfig) -> Result<Arc<dyn Summarizer>, SummarizeError> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledSummarizer)),
        "http" => Ok(Arc::new(HttpSummarizer::new(config)?)),
        other => Err(SummarizeError::UnknownProvider(other.to_string())),
    }
}

/// Summarize the first `max_chunks` of `hits`.
pub async fn summarize_hits(
    summarizer: &dyn Summarizer,
    query: &str,
    hits: &[ScoredHit],
    max_chunks: usize,
) -> Result<SummaryResponse, SummarizeError> {
    if hits.is_empty() {
        return Ok(SummaryResponse::empty());
    }
    summarizer
        .summarize(&SummaryRequest::from_hits(query, hits, max_chunks))
        .await
}

/// `kaigi summarize`: search, then summarize the top hits.
pub async fn run_summarize(config: &Config, query: &SearchQuery, json: bool) -> Result<()> {
    let summarizer = create_summarizer(&config.summarizer)?;
    if !config.summarizer.is_enabled() {
        anyhow::bail!(SummarizeError::Disabled);
    }

    let response = execute(open_index(config)?, query, &config.search).await?;
    let summary = summarize_hits(
        summarizer.as_ref(),
        &query.text,
        &response.hits,
        config.summarizer.max_chunks,
    )
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if response.hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    println!("{}", summary.summary.trim());
    if !summary.sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, source) in summary.sources.iter().enumerate() {
            let pages = match &source.pages {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(s) => format!(" p.{}", s),
                other => format!(" p.{}", other),
            };
            println!(
                "  [{}] {} {}{} {}",
                i + 1,
                source.meeting,
                source.date.as_deref().unwrap_or("-"),
                pages,
                source.doc_url
            );
        }
    }
    eprintln!(
        "tokens: prompt={} completion={}",
        summary.cost_estimate.prompt_tokens, summary.cost_estimate.completion_tokens
    );

    Ok(())
}
