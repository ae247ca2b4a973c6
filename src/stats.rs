//! Index statistics and health overview.
//!
//! Summarizes the published index from its manifest: shard and chunk counts,
//! per-group breakdowns, on-disk size, and when it was last built. With
//! `--verify`, every shard is also fetched and checked against the manifest.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::loader::{load_manifest, ShardSource};
use crate::search::open_index;
use crate::shard::{Shard, ShardIndexEntry, MANIFEST_FILE};
use crate::tokenize::tokenize;

/// Per-group breakdown of shard and chunk counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub shards: usize,
    pub chunks: usize,
}

/// Aggregate manifest rows by group, largest groups first.
pub fn group_stats(entries: &[ShardIndexEntry]) -> Vec<(String, GroupStats)> {
    let mut groups: BTreeMap<&str, GroupStats> = BTreeMap::new();
    for entry in entries {
        let g = groups.entry(entry.group.as_str()).or_default();
        g.shards += 1;
        g.chunks += entry.chunk_count;
    }
    let mut rows: Vec<(String, GroupStats)> = groups
        .into_iter()
        .map(|(name, stats)| (name.to_string(), stats))
        .collect();
    rows.sort_by(|a, b| b.1.chunks.cmp(&a.1.chunks).then_with(|| a.0.cmp(&b.0)));
    rows
}

/// One problem found by [`verify_index`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyIssue {
    pub shard_id: String,
    pub problem: String,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub issues: Vec<VerifyIssue>,
}

/// Fetch every shard named by `entries` and check that it loads, that its
/// chunk count matches the manifest, and that stored tokens match the
/// tokenizer's output for each chunk text.
pub async fn verify_index(source: &dyn ShardSource, entries: &[ShardIndexEntry]) -> VerifyReport {
    let mut report = VerifyReport::default();
    for entry in entries {
        report.checked += 1;
        let mut issue = |problem: String| {
            report.issues.push(VerifyIssue {
                shard_id: entry.shard_id.clone(),
                problem,
            })
        };

        let shard = match source.read(&entry.filename).await {
            Ok(bytes) => match Shard::from_slice(&bytes) {
                Ok(shard) => shard,
                Err(e) => {
                    issue(format!("{}: {}", entry.filename, e));
                    continue;
                }
            },
            Err(e) => {
                issue(format!("{}: {}", entry.filename, e));
                continue;
            }
        };

        if shard.chunk_count != entry.chunk_count {
            issue(format!(
                "manifest lists {} chunks, shard has {}",
                entry.chunk_count, shard.chunk_count
            ));
        }
        let drifted = shard
            .chunks
            .iter()
            .filter(|c| tokenize(&c.text).into_iter().ne(c.tokens.iter().cloned()))
            .count();
        if drifted > 0 {
            issue(format!("{} chunks have stale tokens", drifted));
        }
    }
    report
}

/// Run the stats command: read the manifest and print a summary.
pub async fn run_stats(config: &Config, verify: bool) -> Result<()> {
    let source = open_index(config)?;
    let entries = load_manifest(source.as_ref()).await?;
    let total_chunks: usize = entries.iter().map(|e| e.chunk_count).sum();
    let groups = group_stats(&entries);

    println!("Kaigi Search — Index Stats");
    println!("==========================");
    println!();
    println!("  Index:       {}", source.describe());
    if let Some((size, built)) = source
        .local_dir()
        .and_then(|dir| local_index_info(dir, &entries))
    {
        println!("  Size:        {}", format_bytes(size));
        println!("  Built:       {}", format_ts_relative(built));
    }
    println!();
    println!("  Shards:      {}", entries.len());
    println!("  Chunks:      {}", total_chunks);
    println!("  Groups:      {}", groups.len());

    if !groups.is_empty() {
        println!();
        println!("  By group:");
        println!("  {:<40} {:>6} {:>8}", "GROUP", "SHARDS", "CHUNKS");
        println!("  {}", "-".repeat(56));
        for (name, g) in &groups {
            println!("  {:<40} {:>6} {:>8}", name, g.shards, g.chunks);
        }
    }
    println!();

    if verify {
        let report = verify_index(source.as_ref(), &entries).await;
        println!("  Verified {} shards", report.checked);
        for issue in &report.issues {
            println!("  ✗ {}: {}", issue.shard_id, issue.problem);
        }
        println!();
        if !report.issues.is_empty() {
            anyhow::bail!("index verification found {} problems", report.issues.len());
        }
    }

    Ok(())
}

/// Total size of the manifest plus referenced shard files, and the
/// manifest's modification time.
fn local_index_info(index_dir: &Path, entries: &[ShardIndexEntry]) -> Option<(u64, i64)> {
    let manifest = std::fs::metadata(index_dir.join(MANIFEST_FILE)).ok()?;
    let built = manifest
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let shards: u64 = entries
        .iter()
        .filter_map(|e| std::fs::metadata(index_dir.join(&e.filename)).ok())
        .map(|m| m.len())
        .sum();
    Some((manifest.len() + shards, built))
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{build_shards, publish_shards, BuildOptions};
    use crate::config::GroupBy;
    use crate::loader::DirSource;
    use crate::models::{Chunk, DocumentMetadata, RawChunk};
    use crate::progress::NoProgress;

    fn entry(id: &str, group: &str, chunks: usize) -> ShardIndexEntry {
        ShardIndexEntry {
            shard_id: id.to_string(),
            filename: format!("{id}.json"),
            group: group.to_string(),
            chunk_count: chunks,
        }
    }

    fn publish(dir: &Path) -> Vec<ShardIndexEntry> {
        let chunks: Vec<Chunk> = (0..3)
            .map(|i| {
                let raw = RawChunk {
                    chunk_id: format!("c{i}"),
                    doc_id: Some("d".to_string()),
                    text: format!("DX推進 第{i}回"),
                    meeting: Some("会議".to_string()),
                    agency: None,
                    title: None,
                    date: Some("2025-01-01".to_string()),
                    url: None,
                    page_from: 1,
                    page_to: 1,
                };
                Chunk::from_raw(raw, "d", &DocumentMetadata::default())
            })
            .collect();
        let opts = BuildOptions {
            shard_size: 2,
            group_by: GroupBy::Meeting,
            k1: 1.5,
            b: 0.75,
            dry_run: false,
        };
        publish_shards(dir, &build_shards(&chunks, &opts), &NoProgress).unwrap();
        serde_json::from_slice(&std::fs::read(dir.join(MANIFEST_FILE)).unwrap()).unwrap()
    }

    #[test]
    fn test_group_stats_ordering() {
        let rows = group_stats(&[
            entry("a_0", "a", 100),
            entry("a_1", "a", 20),
            entry("b_0", "b", 200),
            entry("c_0", "c", 5),
        ]);
        let names: Vec<&str> = rows.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(rows[1].1, GroupStats { shards: 2, chunks: 120 });
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn test_verify_clean_index() {
        let tmp = tempfile::tempdir().unwrap();
        let entries = publish(tmp.path());
        let report = verify_index(&DirSource::new(tmp.path()), &entries).await;
        assert_eq!(report.checked, 2);
        assert!(report.issues.is_empty(), "{:?}", report.issues);
    }

    #[tokio::test]
    async fn test_verify_reports_problems() {
        let tmp = tempfile::tempdir().unwrap();
        let mut entries = publish(tmp.path());
        entries[0].chunk_count += 1;
        std::fs::remove_file(tmp.path().join(&entries[1].filename)).unwrap();

        let report = verify_index(&DirSource::new(tmp.path()), &entries).await;
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues[0].problem.contains("manifest lists"));
        assert_eq!(report.issues[1].shard_id, entries[1].shard_id);
    }
}
