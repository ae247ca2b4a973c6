//! Offline index builder.
//!
//! Turns the extraction stage's output into shard files plus a manifest:
//!
//! ```text
//! extracted/*.json ──▶ Chunk::from_raw ──▶ group ──▶ split ──▶ Shard::build (parallel)
//!                                                                   │
//!   _index.json ◀── rename ◀── catalogue ◀── shard files ◀── serialize ◀┘
//! ```
//!
//! A build is all-or-nothing. Every shard and catalogue file is computed and
//! serialized before the first byte is written; shard files are written under
//! content-addressed names via temp-then-rename; the catalogue follows; the
//! manifest is swapped last. If anything fails before the swap, shard files
//! created by this run are removed and the previous manifest keeps pointing
//! at the previous, untouched shard files.
//!
//! Shard files stay on disk for one generation after their manifest is
//! replaced, so a reader holding the previous manifest can still load them.
//! Cleanup only considers names shaped like shard files.

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{Config, GroupBy, IndexConfig};
use crate::error::BuildError;
use crate::models::{Chunk, ExtractedDocument};
use crate::progress::{BuildProgressEvent, BuildProgressReporter};
use crate::shard::{is_shard_file_name, parse_manifest, Shard, ShardIndexEntry, MANIFEST_FILE};
use crate::trends;

/// Parameters of one build invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub shard_size: usize,
    pub group_by: GroupBy,
    pub k1: f64,
    pub b: f64,
    pub dry_run: bool,
}

impl BuildOptions {
    pub fn from_config(index: &IndexConfig) -> Self {
        Self {
            shard_size: index.shard_size,
            group_by: index.group_by,
            k1: index.k1,
            b: index.b,
            dry_run: false,
        }
    }
}

/// Everything read from the extracted directory.
#[derive(Debug, Default)]
pub struct Corpus {
    pub documents: Vec<ExtractedDocument>,
    pub chunks: Vec<Chunk>,
}

/// Summary of a finished build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub documents: usize,
    pub chunks: usize,
    pub shards: usize,
    pub shard_files_written: usize,
    pub stale_files_removed: usize,
    pub trend_months: usize,
}

/// Run a full build from `config.paths.extracted_dir` into the index and
/// public directories.
pub fn run_build(
    config: &Config,
    opts: &BuildOptions,
    progress: &dyn BuildProgressReporter,
) -> Result<BuildReport, BuildError> {
    let corpus = load_extractions(&config.paths.extracted_dir, progress)?;
    let shards = build_shards(&corpus.chunks, opts);
    progress.report(BuildProgressEvent::Sharding {
        shards: shards.len() as u64,
    });

    let mut report = BuildReport {
        documents: corpus.documents.len(),
        chunks: corpus.chunks.len(),
        shards: shards.len(),
        ..Default::default()
    };

    if opts.dry_run {
        return Ok(report);
    }

    let catalog = trends::Catalog::prepare(&corpus.documents, &corpus.chunks)?;
    let index = PreparedIndex::new(&shards)?;
    let public_dir = &config.paths.public_dir;

    let published = publish_index(&config.paths.index_dir, &index, progress, || {
        catalog.write(public_dir)
    })?;
    catalog.remove_stale_months(public_dir);

    report.shard_files_written = published.written;
    report.stale_files_removed = published.removed;
    report.trend_months = catalog.months();

    tracing::info!(
        documents = report.documents,
        chunks = report.chunks,
        shards = report.shards,
        written = report.shard_files_written,
        removed = report.stale_files_removed,
        "index build complete"
    );

    Ok(report)
}

/// Read every `*.json` file directly inside `dir`, in path order.
pub fn load_extractions(
    dir: &Path,
    progress: &dyn BuildProgressReporter,
) -> Result<Corpus, BuildError> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            BuildError::io(path, e.into())
        })?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path.to_path_buf());
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(BuildError::NoInput(dir.to_path_buf()));
    }

    let total = paths.len() as u64;
    let mut corpus = Corpus::default();
    let mut seen: HashSet<String> = HashSet::new();

    for (i, path) in paths.iter().enumerate() {
        let bytes = fs::read(path).map_err(|e| BuildError::io(path, e))?;
        let doc: ExtractedDocument =
            serde_json::from_slice(&bytes).map_err(|source| BuildError::Parse {
                path: path.clone(),
                source,
            })?;

        for raw in doc.chunks.iter().cloned() {
            let chunk = Chunk::from_raw(raw, &doc.doc_id, &doc.metadata);
            if !seen.insert(chunk.chunk_id.clone()) {
                return Err(BuildError::DuplicateChunk(chunk.chunk_id));
            }
            corpus.chunks.push(chunk);
        }
        corpus.documents.push(doc);

        let n = i as u64 + 1;
        if n % 100 == 0 || n == total {
            progress.report(BuildProgressEvent::Loading { n, total });
        }
    }

    tracing::debug!(
        documents = corpus.documents.len(),
        chunks = corpus.chunks.len(),
        "loaded extracted documents"
    );

    Ok(corpus)
}

/// The year-month prefix of an ISO date, if it has one.
pub fn month_of(date: Option<&str>) -> Option<&str> {
    date.and_then(|d| d.get(..7)).filter(|m| m.len() == 7)
}

/// Group key of a chunk under the given grouping strategy.
pub fn group_key(chunk: &Chunk, group_by: GroupBy) -> String {
    let meeting = non_empty(&chunk.meeting).unwrap_or("unknown");
    let month = month_of(chunk.date()).unwrap_or("undated");
    match group_by {
        GroupBy::MeetingMonth => format!("{}_{}", meeting, month),
        GroupBy::Meeting => meeting.to_string(),
        GroupBy::Agency => non_empty(&chunk.agency).unwrap_or("unknown").to_string(),
        GroupBy::Month => month.to_string(),
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Partition chunks by group, split each group into shards of at most
/// `opts.shard_size` chunks, and compute per-shard statistics in parallel.
///
/// Groups are emitted in key order and chunks keep their input order inside
/// a group, so the result is deterministic.
pub fn build_shards(chunks: &[Chunk], opts: &BuildOptions) -> Vec<Shard> {
    let shard_size = opts.shard_size.max(1);

    let mut groups: BTreeMap<String, Vec<&Chunk>> = BTreeMap::new();
    for chunk in chunks {
        groups
            .entry(group_key(chunk, opts.group_by))
            .or_default()
            .push(chunk);
    }

    let plan: Vec<(String, String, Vec<Chunk>)> = groups
        .into_iter()
        .flat_map(|(group, members)| {
            members
                .chunks(shard_size)
                .enumerate()
                .map(|(i, part)| {
                    (
                        format!("{}_{}", group, i),
                        group.clone(),
                        part.iter().map(|c| (*c).clone()).collect(),
                    )
                })
                .collect::<Vec<_>>()
        })
        .collect();

    plan.into_par_iter()
        .map(|(shard_id, group, members)| Shard::build(shard_id, group, members, opts.k1, opts.b))
        .collect()
}

/// Outcome of publishing shard files and the manifest.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishReport {
    pub written: usize,
    pub removed: usize,
}

/// Shard files and manifest of one build, serialized but not yet written.
#[derive(Debug, Clone)]
pub struct PreparedIndex {
    files: Vec<(String, Vec<u8>)>,
    entries: Vec<ShardIndexEntry>,
    manifest: Vec<u8>,
}

impl PreparedIndex {
    pub fn new(shards: &[Shard]) -> Result<Self, BuildError> {
        let mut files = Vec::with_capacity(shards.len());
        let mut entries = Vec::with_capacity(shards.len());
        for shard in shards {
            let bytes = shard.to_bytes()?;
            let filename = shard.file_name(&bytes);
            entries.push(shard.index_entry(filename.clone()));
            files.push((filename, bytes));
        }
        let manifest = serde_json::to_vec_pretty(&entries)?;
        Ok(Self {
            files,
            entries,
            manifest,
        })
    }
}

/// Write shard files and swap the manifest in `index_dir`.
pub fn publish_shards(
    index_dir: &Path,
    shards: &[Shard],
    progress: &dyn BuildProgressReporter,
) -> Result<PublishReport, BuildError> {
    publish_index(index_dir, &PreparedIndex::new(shards)?, progress, || Ok(()))
}

/// Write shard files, run `before_swap`, then swap the manifest.
///
/// An error from any step before the swap removes the shard files this call
/// created and leaves the previous manifest in place. After the swap, shard
/// files referenced by neither the new nor the previous manifest are deleted.
pub fn publish_index(
    index_dir: &Path,
    index: &PreparedIndex,
    progress: &dyn BuildProgressReporter,
    before_swap: impl FnOnce() -> Result<(), BuildError>,
) -> Result<PublishReport, BuildError> {
    fs::create_dir_all(index_dir).map_err(|e| BuildError::io(index_dir, e))?;
    let manifest_path = index_dir.join(MANIFEST_FILE);
    let previous = read_previous_manifest(&manifest_path);

    let mut created: Vec<PathBuf> = Vec::new();
    let total = index.files.len() as u64;
    for (i, (filename, bytes)) in index.files.iter().enumerate() {
        let path = index_dir.join(filename);
        // Same name means same content hash, so an existing file is reused.
        if !path.exists() {
            if let Err(e) = write_atomic(&path, bytes) {
                remove_all(&created);
                return Err(BuildError::io(&path, e));
            }
            created.push(path);
        }
        progress.report(BuildProgressEvent::Writing {
            n: i as u64 + 1,
            total,
        });
    }

    if let Err(e) = before_swap() {
        remove_all(&created);
        return Err(e);
    }

    if let Err(e) = write_atomic(&manifest_path, &index.manifest) {
        remove_all(&created);
        return Err(BuildError::io(&manifest_path, e));
    }

    let removed = match previous {
        Some(previous) => {
            let keep: BTreeSet<&str> = index
                .entries
                .iter()
                .chain(previous.iter())
                .map(|e| e.filename.as_str())
                .collect();
            remove_unreferenced(index_dir, &keep)
        }
        None => 0,
    };

    Ok(PublishReport {
        written: created.len(),
        removed,
    })
}

/// Entries of the manifest about to be replaced. An absent manifest yields
/// no entries; an unreadable one yields `None` and disables cleanup.
fn read_previous_manifest(path: &Path) -> Option<Vec<ShardIndexEntry>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Some(Vec::new()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read previous manifest; skipping cleanup");
            return None;
        }
    };
    match parse_manifest(&bytes) {
        Ok(entries) => Some(entries),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "previous manifest is malformed; skipping cleanup");
            None
        }
    }
}

/// Write `bytes` to a hidden temporary sibling, sync it, then rename it over
/// `path`. Readers observe either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", name));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to clean up partial build output");
        }
    }
}

/// Delete shard files in `dir` that are not in `keep`. Other files are left
/// alone. Failures are logged, never fatal: the manifest has already been
/// swapped.
fn remove_unreferenced(dir: &Path, keep: &BTreeSet<&str>) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot list index directory for cleanup");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_shard_file_name(&name) || keep.contains(name.as_str()) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(file = %name, error = %e, "failed to remove stale shard file"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentMetadata, RawChunk};
    use crate::progress::NoProgress;
    use crate::tokenize::tokenize;

    fn chunk(id: &str, meeting: &str, date: Option<&str>, text: &str) -> Chunk {
        let raw = RawChunk {
            chunk_id: id.to_string(),
            doc_id: Some("d".to_string()),
            text: text.to_string(),
            meeting: Some(meeting.to_string()),
            agency: Some("デジタル庁".to_string()),
            title: Some("資料".to_string()),
            date: date.map(str::to_string),
            url: None,
            page_from: 1,
            page_to: 1,
        };
        Chunk::from_raw(raw, "d", &DocumentMetadata::default())
    }

    fn opts(shard_size: usize) -> BuildOptions {
        BuildOptions {
            shard_size,
            group_by: GroupBy::MeetingMonth,
            k1: 1.5,
            b: 0.75,
            dry_run: false,
        }
    }

    #[test]
    fn test_group_key_strategies() {
        let c = chunk("a", "AI戦略会議", Some("2025-08-01"), "x");
        assert_eq!(group_key(&c, GroupBy::MeetingMonth), "AI戦略会議_2025-08");
        assert_eq!(group_key(&c, GroupBy::Meeting), "AI戦略会議");
        assert_eq!(group_key(&c, GroupBy::Agency), "デジタル庁");
        assert_eq!(group_key(&c, GroupBy::Month), "2025-08");

        let undated = chunk("b", "", None, "x");
        assert_eq!(group_key(&undated, GroupBy::MeetingMonth), "unknown_undated");
    }

    #[test]
    fn test_month_of() {
        assert_eq!(month_of(Some("2025-08-01")), Some("2025-08"));
        assert_eq!(month_of(Some("2025")), None);
        assert_eq!(month_of(None), None);
    }

    #[test]
    fn test_shards_respect_size_limit() {
        let chunks: Vec<Chunk> = (0..7)
            .map(|i| chunk(&format!("c{i}"), "会議", Some("2025-01-05"), "AI"))
            .collect();
        let shards = build_shards(&chunks, &opts(3));
        let sizes: Vec<usize> = shards.iter().map(|s| s.chunk_count).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        let ids: Vec<&str> = shards.iter().map(|s| s.shard_id.as_str()).collect();
        assert_eq!(ids, vec!["会議_2025-01_0", "会議_2025-01_1", "会議_2025-01_2"]);
    }

    #[test]
    fn test_shards_partition_by_group() {
        let chunks = vec![
            chunk("a", "B会議", Some("2025-02-01"), "AI"),
            chunk("b", "A会議", Some("2025-02-01"), "DX"),
            chunk("c", "B会議", Some("2025-03-01"), "AI"),
            chunk("d", "B会議", Some("2025-02-11"), "予算"),
        ];
        let shards = build_shards(&chunks, &opts(100));
        let groups: Vec<&str> = shards.iter().map(|s| s.group.as_str()).collect();
        assert_eq!(groups, vec!["A会議_2025-02", "B会議_2025-02", "B会議_2025-03"]);
        let b_feb: Vec<&str> = shards[1].chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(b_feb, vec!["a", "d"]);
    }

    #[test]
    fn test_stored_tokens_match_tokenizer() {
        let texts = [
            "生成AIの利活用に関するガイドラインを策定した。",
            "デジタル社会推進会議 第5回 議事録 DX",
            "令和7年度予算概算要求について",
        ];
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| chunk(&format!("c{i}"), "会議", Some("2025-01-01"), t))
            .collect();
        for shard in build_shards(&chunks, &opts(2)) {
            for c in &shard.chunks {
                let expected: Vec<String> = tokenize(&c.text).into_iter().collect();
                assert_eq!(c.tokens, expected);
            }
        }
    }

    fn file_names(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn single(text: &str) -> Vec<Shard> {
        build_shards(&[chunk("a", "会議", Some("2025-01-01"), text)], &opts(10))
    }

    #[test]
    fn test_publish_keeps_previous_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("index");

        publish_shards(&dir, &single("AI"), &NoProgress).unwrap();
        let first = file_names(&dir);
        assert_eq!(first.len(), 2);

        let report = publish_shards(&dir, &single("DX"), &NoProgress).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.removed, 0);
        assert!(first.is_subset(&file_names(&dir)));

        let report = publish_shards(&dir, &single("予算"), &NoProgress).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.removed, 1);
        let third = file_names(&dir);
        assert_eq!(third.len(), 3);
        assert!(first.iter().all(|n| n == MANIFEST_FILE || !third.contains(n)));

        let manifest: Vec<ShardIndexEntry> =
            serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest.len(), 1);
        assert!(dir.join(&manifest[0].filename).exists());
    }

    #[tokio::test]
    async fn test_reader_of_previous_manifest_survives_rebuild() {
        use crate::loader::{load_manifest, load_shards, DirSource, LoadOptions};
        use std::sync::Arc;
        use std::time::Duration;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("index");
        let source = Arc::new(DirSource::new(&dir));
        let load_opts = LoadOptions {
            max_shards: None,
            concurrency: 2,
            timeout: Duration::from_secs(5),
        };

        publish_shards(&dir, &single("AI"), &NoProgress).unwrap();
        let old_entries = load_manifest(source.as_ref()).await.unwrap();

        publish_shards(&dir, &single("DX"), &NoProgress).unwrap();
        let loaded = load_shards(source.clone(), &old_entries, load_opts).await.unwrap();
        assert_eq!(loaded.shards.len(), 1);
        assert_eq!(loaded.failed, 0);
        assert_eq!(loaded.shards[0].chunks[0].text, "AI");

        publish_shards(&dir, &single("予算"), &NoProgress).unwrap();
        assert!(load_shards(source, &old_entries, load_opts).await.is_err());
    }

    #[test]
    fn test_cleanup_ignores_foreign_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("index");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("notes.json"), "{}").unwrap();
        fs::write(dir.join("docs-meta.json"), "[]").unwrap();
        fs::write(dir.join("README.md"), "x").unwrap();

        for text in ["AI", "DX", "予算"] {
            publish_shards(&dir, &single(text), &NoProgress).unwrap();
        }
        let names = file_names(&dir);
        assert!(names.contains("notes.json"));
        assert!(names.contains("docs-meta.json"));
        assert!(names.contains("README.md"));
    }

    #[test]
    fn test_failed_catalogue_leaves_previous_index() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::with_root(tmp.path());
        let extracted = &config.paths.extracted_dir;
        fs::create_dir_all(extracted).unwrap();
        let write_doc = |text: &str| {
            let doc = serde_json::json!({
                "doc_id": "d1",
                "metadata": {"meeting": "会議", "agency": "総務省", "title": "資料", "date": "2025-01-01", "url": "u"},
                "pages": 1,
                "chunks": [{"chunk_id": "d1_c0", "text": text, "page_from": 1, "page_to": 1}]
            });
            fs::write(extracted.join("d1.json"), doc.to_string()).unwrap();
        };

        let build_opts = BuildOptions::from_config(&config.index);
        write_doc("AI戦略");
        run_build(&config, &build_opts, &NoProgress).unwrap();
        let index_dir = &config.paths.index_dir;
        let before = file_names(index_dir);
        let manifest_before = fs::read(index_dir.join(MANIFEST_FILE)).unwrap();

        let trends_dir = config.paths.public_dir.join("trends");
        fs::remove_dir_all(&trends_dir).unwrap();
        fs::write(&trends_dir, "not a directory").unwrap();

        write_doc("予算報告");
        assert!(run_build(&config, &build_opts, &NoProgress).is_err());
        assert_eq!(fs::read(index_dir.join(MANIFEST_FILE)).unwrap(), manifest_before);
        assert_eq!(file_names(index_dir), before);
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.json");
        write_atomic(&path, b"[]").unwrap();
        write_atomic(&path, b"[1]").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[1]");
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn stored_tokens_match_query_tokenizer(
                texts in prop::collection::vec("[A-Za-z0-9ぁ-んァ-ヶー一-龯、。 ]{0,48}", 1..6),
            ) {
                let chunks: Vec<Chunk> = texts
                    .iter()
                    .enumerate()
                    .map(|(i, t)| chunk(&format!("c{i}"), "会議", Some("2025-01-01"), t))
                    .collect();
                for shard in build_shards(&chunks, &opts(2)) {
                    let restored = Shard::from_slice(&shard.to_bytes().unwrap()).unwrap();
                    for c in &restored.chunks {
                        let expected: Vec<String> = tokenize(&c.text).into_iter().collect();
                        prop_assert_eq!(&c.tokens, &expected);
                        prop_assert!(c.tf.keys().eq(expected.iter()));
                        for token in &expected {
                            prop_assert!(restored.idf.contains_key(token));
                        }
                    }
                }
            }
        }
    }
}
