//! # Kaigi Search
//!
//! Sharded BM25 keyword search over Japanese government meeting documents.
//!
//! An offline builder partitions extracted document chunks into independent
//! shards, each carrying its own BM25 statistics, and publishes them as
//! static JSON files plus a manifest. The query engine loads shards on
//! demand, filters by date, agency, and meeting, ranks with BM25 and a title
//! boost, and returns scored hits with query-focused snippets. Top hits can
//! be forwarded to an external summarization service.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌─────────────────────┐
//! │ extracted/ │──▶│  Builder   │──▶│ index-shards/*.json │
//! │  *.json    │   │ BM25 stats │   │    _index.json      │
//! └────────────┘   └────────────┘   └──────────┬──────────┘
//!                                              │ dir or HTTP
//!                                              ▼
//!                  ┌──────────┐          ┌──────────────┐
//!                  │   CLI    │◀─────────│ Query engine │──▶ Summarizer
//!                  │ (kaigi)  │   HTTP ◀─│ filter+rank  │
//!                  └──────────┘          └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kaigi build                         # build shards from data/extracted
//! kaigi search "AI 戦略" --agency 内閣府
//! kaigi serve                         # start the HTTP service
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`tokenize`] | Mixed Japanese/ASCII tokenizer |
//! | [`bm25`] | BM25 scoring and title boost |
//! | [`shard`] | Shard files and the manifest |
//! | [`build`] | Offline index builder |
//! | [`trends`] | Document catalogue and monthly trends |
//! | [`loader`] | Shard sources and concurrent loading |
//! | [`snippet`] | Query-focused excerpts |
//! | [`search`] | Filtering and ranking |
//! | [`summarize`] | Summarization service boundary |
//! | [`server`] | HTTP service |
//! | [`stats`] | Index statistics and verification |

pub mod bm25;
pub mod build;
pub mod config;
pub mod error;
pub mod loader;
pub mod models;
pub mod progress;
pub mod search;
pub mod server;
pub mod shard;
pub mod snippet;
pub mod stats;
pub mod summarize;
pub mod tokenize;
pub mod trends;
