//! Incremental sync: filtered walk, fingerprint diff, node extraction,
//! embedding refresh, and atomic snapshot publication.
//!
//! A successful sync leaves a consistent `(manifest, vector store, graph)`
//! triple on disk and returns the fresh in-memory snapshot. Partial
//! embedding failures are logged and leave the affected nodes with empty
//! embeddings; the vector store skips them until a later sync succeeds.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::graph::CodeGraph;
use crate::parser;
use crate::pathfilter::{PathClass, PathTrie};
use crate::provider::ModelClient;
use crate::store::VectorStore;
use crate::types::{
    fingerprint, CodeNode, Manifest, NodeArena, ProjectConfig, Snapshot, SyncReport,
    EMBED_BATCH_SIZE, MAX_FILE_READ,
};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Directory names excluded from every scan unless an include rule
/// reaches into them.
pub const DEFAULT_IGNORED: [&str; 9] = [
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "__pycache__",
    "target",
    "dist",
    "build",
    ".venv",
];

// ---------------------------------------------------------------------------
// Atomic write helper
// ---------------------------------------------------------------------------

/// Write via a uniquely named temp sibling plus rename, so readers see
/// either the old bytes or the new ones.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Config(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4()
    ));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Filtered walk
// ---------------------------------------------------------------------------

struct ScannedFile {
    rel_path: String,
    abs_path: PathBuf,
}

/// Build the project's path trie: built-in ignores, then the project's
/// ignores, then its includes so they can override.
fn build_trie(config: &ProjectConfig) -> Result<PathTrie> {
    let mut ignored: Vec<String> = DEFAULT_IGNORED.iter().map(|d| d.to_string()).collect();
    ignored.extend(config.ignored.iter().cloned());
    PathTrie::from_rules(&ignored, &config.included)
}

/// Walk the source tree, keeping files whose extension is allowed and
/// whose trie classification is not IGNORE. Ignored directories are
/// pruned unless an include rule points beneath them.
fn scan_files(config: &ProjectConfig, trie: &PathTrie) -> Vec<ScannedFile> {
    let root = config.source_dir.clone();
    let results: Mutex<Vec<ScannedFile>> = Mutex::new(Vec::new());

    WalkBuilder::new(&root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .threads(rayon::current_num_threads().min(12))
        .filter_entry({
            let root = root.clone();
            let prune_trie = trie_snapshot(config);
            move |entry| {
                if !entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    return true;
                }
                let rel = match entry.path().strip_prefix(&root) {
                    Ok(r) => r.to_string_lossy().replace('\\', "/"),
                    Err(_) => return true,
                };
                if rel.is_empty() {
                    return true;
                }
                prune_trie.classify(&rel) != PathClass::Ignore
                    || prune_trie.may_contain_includes(&rel)
            }
        })
        .build_parallel()
        .run(|| {
            Box::new(|entry| {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => return ignore::WalkState::Continue,
                };
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    return ignore::WalkState::Continue;
                }
                let abs_path = entry.path().to_path_buf();
                let rel_path = match abs_path.strip_prefix(&root) {
                    Ok(r) => r.to_string_lossy().replace('\\', "/"),
                    Err(_) => return ignore::WalkState::Continue,
                };

                let ext = parser::language_of_path(&rel_path);
                if !config.allowed_extensions.iter().any(|e| e == &ext) {
                    return ignore::WalkState::Continue;
                }
                if trie.classify(&rel_path) == PathClass::Ignore {
                    return ignore::WalkState::Continue;
                }

                results.lock().unwrap().push(ScannedFile { rel_path, abs_path });
                ignore::WalkState::Continue
            })
        });

    let mut files = results.into_inner().unwrap();
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    files
}

/// The walker's `filter_entry` closure must own its trie; rebuilding from
/// the same rules yields an identical classifier.
fn trie_snapshot(config: &ProjectConfig) -> PathTrie {
    build_trie(config).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Storage mirror
// ---------------------------------------------------------------------------

/// Write the per-file mirror, the concatenated `_full_context.txt`, and
/// the indented `tree.txt`. The full context is rewritten atomically each
/// sync, files in lexicographic order.
fn write_storage_mirror(
    storage_dir: &Path,
    contents: &BTreeMap<String, String>,
) -> Result<()> {
    let converted = storage_dir.join("converted");
    contents
        .par_iter()
        .map(|(rel, text)| -> Result<()> {
            let mirror = converted.join(format!("{rel}.txt"));
            if let Some(parent) = mirror.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&mirror, text.as_bytes())?;
            Ok(())
        })
        .collect::<Result<Vec<()>>>()?;

    let mut full = String::new();
    for (rel, text) in contents {
        full.push_str(&format!("\n\n--- FILE: {rel} ---\n{text}"));
    }
    write_atomic(&storage_dir.join("_full_context.txt"), full.as_bytes())?;
    write_atomic(&storage_dir.join("tree.txt"), render_tree(contents.keys()).as_bytes())?;
    Ok(())
}

/// Indented file tree over the kept rel paths.
fn render_tree<'a>(paths: impl Iterator<Item = &'a String>) -> String {
    let mut out = String::new();
    let mut emitted_dirs: Vec<Vec<&str>> = Vec::new();
    for path in paths {
        let parts: Vec<&str> = path.split('/').collect();
        for depth in 0..parts.len() - 1 {
            let prefix = parts[..=depth].to_vec();
            if !emitted_dirs.contains(&prefix) {
                out.push_str(&"  ".repeat(depth));
                out.push_str(prefix[depth]);
                out.push_str("/\n");
                emitted_dirs.push(prefix);
            }
        }
        out.push_str(&"  ".repeat(parts.len() - 1));
        out.push_str(parts[parts.len() - 1]);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Snapshot persistence
// ---------------------------------------------------------------------------

pub fn project_data_dir(data_dir: &Path, project_id: &str) -> PathBuf {
    data_dir.join(project_id)
}

/// Reload a previously synced snapshot from disk. Missing files load as
/// an empty snapshot (a project registered but never synced).
pub fn load_snapshot(data_dir: &Path, project_id: &str) -> Result<Snapshot> {
    let dir = project_data_dir(data_dir, project_id);
    let manifest_path = dir.join("manifest.json");
    if !manifest_path.exists() {
        return Ok(Snapshot::empty());
    }
    let manifest: Manifest = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
    let mut arena: NodeArena = serde_json::from_slice(&std::fs::read(dir.join("nodes.json"))?)?;
    arena.reindex();
    let store = VectorStore::load(&dir.join("vectors"))?;
    let graph = CodeGraph::build(&mut arena, &manifest);
    Ok(Snapshot { manifest, arena, store, graph })
}

// ---------------------------------------------------------------------------
// Sync driver
// ---------------------------------------------------------------------------

/// Run one sync pass for a project and publish the resulting snapshot to
/// `data_dir`. `previous` is the currently live snapshot (empty for a
/// first sync).
pub fn sync_project(
    ctx: &Ctx,
    config: &ProjectConfig,
    client: &ModelClient,
    previous: &Snapshot,
    data_dir: &Path,
) -> Result<(Snapshot, SyncReport)> {
    let start = std::time::Instant::now();
    let mut report = SyncReport::default();

    // 1–2. Fresh trie, filtered walk.
    let trie = build_trie(config)?;
    let files = scan_files(config, &trie);
    ctx.cancel.checkpoint()?;

    // 3. Read and fingerprint every kept file. Unreadable files are
    // skipped and logged; the sync continues.
    let mut contents: BTreeMap<String, String> = BTreeMap::new();
    let mut manifest = Manifest::new();
    for file in &files {
        let meta = match std::fs::metadata(&file.abs_path) {
            Ok(m) => m,
            Err(e) => {
                report.logs.push(format!("skipped {}: {e}", file.rel_path));
                continue;
            }
        };
        if meta.len() > MAX_FILE_READ {
            report.logs.push(format!(
                "skipped {} ({} bytes exceeds read cap)",
                file.rel_path,
                meta.len()
            ));
            continue;
        }
        match std::fs::read_to_string(&file.abs_path) {
            Ok(text) => {
                manifest.insert(file.rel_path.clone(), fingerprint(&meta));
                contents.insert(file.rel_path.clone(), text);
            }
            Err(e) => {
                let err =
                    Error::Parse { path: file.rel_path.clone(), reason: e.to_string() };
                report.logs.push(err.to_string());
            }
        }
    }

    write_storage_mirror(&config.storage_dir, &contents)?;
    ctx.cancel.checkpoint()?;

    // 4. Fingerprint diff → node extraction for changed files only.
    let mut carried: HashMap<&str, Vec<CodeNode>> = HashMap::new();
    for (_, node) in previous.arena.iter() {
        carried.entry(node.file_path.as_str()).or_default().push(node.clone());
    }

    let mut arena = NodeArena::new();
    let mut pending_embedding: Vec<u32> = Vec::new();
    for (rel, fp) in &manifest {
        let unchanged = previous.manifest.get(rel) == Some(fp);
        if unchanged {
            for node in carried.remove(rel.as_str()).unwrap_or_default() {
                let needs_embedding = node.embedding.is_empty();
                let idx = arena.insert(node);
                if needs_embedding {
                    pending_embedding.push(idx);
                }
            }
            continue;
        }
        report.updated += 1;
        for node in parser::extract(rel, &contents[rel]) {
            let idx = arena.insert(node);
            pending_embedding.push(idx);
        }
    }

    // 7 (interleaved). Files gone from the scan count as deletions; their
    // nodes simply don't make it into the new arena.
    for rel in previous.manifest.keys() {
        if !manifest.contains_key(rel) {
            report.deleted += 1;
            debug!(file = rel.as_str(), "removed from index");
        }
    }

    // 5. Embedding refresh in bounded, order-preserving batches. A failed
    // batch leaves its nodes unembedded and the sync continues.
    for batch in pending_embedding.chunks(EMBED_BATCH_SIZE) {
        ctx.cancel.checkpoint()?;
        let texts: Vec<String> =
            batch.iter().map(|&idx| arena.get(idx).embedding_text()).collect();
        match client.embed_batch(ctx, &texts) {
            Ok(vectors) => {
                for (&idx, vector) in batch.iter().zip(vectors) {
                    arena.get_mut(idx).embedding = vector;
                }
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, batch = batch.len(), "embedding batch failed");
                report.logs.push(format!("embedding batch failed: {e}"));
            }
        }
    }

    // 6. Rebuild graph (resolves dependencies, assigns static weights)
    // and the vector store over everything that carries an embedding.
    let graph = CodeGraph::build(&mut arena, &manifest);
    let mut store = VectorStore::new();
    store.add(&arena, (0..arena.len() as u32).collect::<Vec<_>>());

    // 8. Publish: nodes and manifest via temp+rename, vectors via
    // directory swap. Manifest last, so a crash mid-publish is detected
    // as a stale manifest and repaired by the next sync.
    let dir = project_data_dir(data_dir, &config.project_id);
    std::fs::create_dir_all(&dir)?;
    store.save(&dir.join("vectors"))?;
    write_atomic(&dir.join("nodes.json"), &serde_json::to_vec(&arena)?)?;
    write_atomic(&dir.join("manifest.json"), &serde_json::to_vec_pretty(&manifest)?)?;

    ctx.telemetry.incr("sync.files_updated", report.updated as u64);
    ctx.telemetry.incr("sync.files_deleted", report.deleted as u64);
    info!(
        project = config.project_id.as_str(),
        files = manifest.len(),
        updated = report.updated,
        deleted = report.deleted,
        nodes = arena.len(),
        edges = graph.edge_count(),
        time_ms = start.elapsed().as_millis() as u64,
        "sync complete"
    );

    Ok((Snapshot { manifest, arena, store, graph }, report))
}
