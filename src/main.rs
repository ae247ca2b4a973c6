//! # Kaigi Search CLI (`kaigi`)
//!
//! The `kaigi` binary builds the shard index, queries it, and serves it over
//! HTTP.
//!
//! ## Usage
//!
//! ```bash
//! kaigi --config ./config/kaigi.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kaigi build` | Build shard files, the manifest, and catalogue outputs |
//! | `kaigi search "<query>"` | Search the published index |
//! | `kaigi summarize "<query>"` | Search, then summarize the top hits |
//! | `kaigi serve` | Start the HTTP search service |
//! | `kaigi stats` | Show index statistics (`--verify` checks every shard) |
//!
//! ## Examples
//!
//! ```bash
//! # Preview shard counts without writing anything
//! kaigi build --dry-run
//!
//! # Restrict to one agency and a date range
//! kaigi search "生成AI" --agency デジタル庁 --from 2025-01-01 --to 2025-06-30
//!
//! # Machine-readable output
//! kaigi search "DX 推進" --json
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kaigi_search::build::{run_build, BuildOptions};
use kaigi_search::config::{self, Config};
use kaigi_search::progress::ProgressMode;
use kaigi_search::search::{self, split_list, SearchQuery};
use kaigi_search::{server, stats, summarize};

/// Kaigi Search CLI: sharded BM25 keyword search over government meeting
/// documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "kaigi",
    about = "Kaigi Search: sharded keyword search over government meeting documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kaigi.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). Overridden by KAIGI_LOG.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Filters shared by `search` and `summarize`.
#[derive(clap::Args)]
struct QueryArgs {
    /// The search query string.
    query: String,

    /// Only return chunks dated on or after this date (YYYY-MM-DD).
    #[arg(long)]
    from: Option<String>,

    /// Only return chunks dated on or before this date (YYYY-MM-DD).
    #[arg(long)]
    to: Option<String>,

    /// Restrict to an agency. Repeatable; commas also separate values.
    #[arg(long = "agency")]
    agencies: Vec<String>,

    /// Restrict to a meeting. Repeatable; commas also separate values.
    #[arg(long = "meeting")]
    meetings: Vec<String>,

    /// Maximum number of results to return.
    #[arg(long)]
    size: Option<usize>,

    /// Print JSON instead of the human-readable listing.
    #[arg(long)]
    json: bool,
}

impl QueryArgs {
    fn to_query(&self, cfg: &Config) -> SearchQuery {
        let mut query = SearchQuery::new(self.query.clone(), &cfg.search);
        if let Some(ref from) = self.from {
            query.from = from.clone();
        }
        if let Some(ref to) = self.to {
            query.to = to.clone();
        }
        query.agencies = self.agencies.iter().flat_map(|a| split_list(a)).collect();
        query.meetings = self.meetings.iter().flat_map(|m| split_list(m)).collect();
        if let Some(size) = self.size {
            query.size = size;
        }
        query
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Build the shard index from extracted documents.
    ///
    /// Reads every `*.json` file in `paths.extracted_dir`, groups and splits
    /// the chunks into shards, and publishes shard files, `_index.json`,
    /// `docs-meta.json`, and `trends/`. Rebuilding unchanged input is a
    /// no-op on disk.
    Build {
        /// Report document, chunk, and shard counts without writing.
        #[arg(long)]
        dry_run: bool,

        /// Override `index.shard_size`.
        #[arg(long)]
        shard_size: Option<usize>,

        /// Progress output on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search the published index.
    Search(QueryArgs),

    /// Search, then summarize the top hits with the configured summarizer.
    Summarize(QueryArgs),

    /// Start the HTTP search service on `server.bind`.
    Serve,

    /// Show index statistics.
    Stats {
        /// Fetch every shard and check it against the manifest.
        #[arg(long)]
        verify: bool,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("KAIGI_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Build {
            dry_run,
            shard_size,
            progress,
        } => {
            let mut opts = BuildOptions::from_config(&cfg.index);
            opts.dry_run = dry_run;
            if let Some(size) = shard_size {
                anyhow::ensure!(size > 0, "--shard-size must be > 0");
                opts.shard_size = size;
            }
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let report = run_build(&cfg, &opts, reporter.as_ref()).with_context(|| {
                format!("build from {} failed", cfg.paths.extracted_dir.display())
            })?;

            if dry_run {
                println!("Dry run: nothing written.");
            }
            println!("Documents: {}", report.documents);
            println!("Chunks:    {}", report.chunks);
            println!("Shards:    {}", report.shards);
            if !dry_run {
                println!("Written:   {}", report.shard_files_written);
                println!("Removed:   {}", report.stale_files_removed);
                println!("Months:    {}", report.trend_months);
            }
        }
        Commands::Search(args) => {
            search::run_search(&cfg, &args.to_query(&cfg), args.json).await?;
        }
        Commands::Summarize(args) => {
            summarize::run_summarize(&cfg, &args.to_query(&cfg), args.json).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Stats { verify } => {
            stats::run_stats(&cfg, verify).await?;
        }
    }

    Ok(())
}
