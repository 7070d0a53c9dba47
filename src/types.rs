use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum file size (in bytes) that will be read into memory during sync.
pub const MAX_FILE_READ: u64 = 512 * 1024;

/// Per-node content cap (characters) when formatting text for embedding.
pub const EMBED_SNIPPET_CHARS: usize = 800;

/// Nodes per provider request when refreshing embeddings.
pub const EMBED_BATCH_SIZE: usize = 50;

/// Default character budget for the packed hierarchical context.
pub const DEFAULT_CONTEXT_CHARS: usize = 120_000;

/// Default candidate ceiling for a retrieval pass.
pub const DEFAULT_MAX_NODES: usize = 80;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Kind of a retrievable code node. The packing rank puts the file-level
/// summary first, then classes, then functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Class,
    Function,
    Other,
}

impl NodeKind {
    /// Ordering used inside a file group when packing context.
    pub fn pack_rank(self) -> u8 {
        match self {
            NodeKind::File => 0,
            NodeKind::Class => 1,
            NodeKind::Function => 2,
            NodeKind::Other => 3,
        }
    }
}

/// The unit of retrieval: one file, class, or function with its text span,
/// extracted references, embedding, and static weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeNode {
    /// Stable id, `<file_path>::<qualified_name>`.
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Repo-relative, forward-slash normalized.
    pub file_path: String,
    /// Literal source slice for this node. Never empty.
    pub content: String,
    #[serde(default)]
    pub docstring: String,
    /// 1-based line span within the file.
    pub start_line: usize,
    pub end_line: usize,
    /// Ids of nodes this one textually references.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Either empty (pending) or exactly the project's embedding dim.
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Named static weights (`centrality`, `recency`), filled by the graph
    /// build and read-only to retrieval.
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl CodeNode {
    /// Derive the stable node id from its path and qualified name.
    pub fn make_id(file_path: &str, qualified_name: &str) -> String {
        format!("{file_path}::{qualified_name}")
    }

    /// Text handed to the embedding provider: header line plus content
    /// capped on a char boundary.
    pub fn embedding_text(&self) -> String {
        let body = crate::provider::truncate_chars(&self.content, EMBED_SNIPPET_CHARS);
        if self.docstring.is_empty() {
            format!("{} {}\n{}", self.file_path, self.name, body)
        } else {
            format!("{} {}\n{}\n{}", self.file_path, self.name, self.docstring, body)
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprints and manifest
// ---------------------------------------------------------------------------

/// Opaque change-detection fingerprint: size and mtime concatenated.
/// Compared by equality only; not a content hash.
pub fn fingerprint(meta: &std::fs::Metadata) -> String {
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}:{}", meta.len(), mtime_ms)
}

/// Millisecond mtime component of a fingerprint, for recency weighting.
pub fn fingerprint_mtime(fp: &str) -> u128 {
    fp.split_once(':').and_then(|(_, m)| m.parse().ok()).unwrap_or(0)
}

/// Per-project mapping from repo-relative path to fingerprint. Persisted
/// as `manifest.json` and rewritten atomically at the end of each sync.
pub type Manifest = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Node arena
// ---------------------------------------------------------------------------

/// Owning storage for a snapshot's nodes. The vector store and graph hold
/// arena indices instead of sharing node ownership.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NodeArena {
    nodes: Vec<CodeNode>,
    #[serde(skip)]
    by_id: HashMap<String, u32>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, returning its index. Nodes with empty content are
    /// rejected by the parser before they get here; a duplicate id
    /// replaces the previous node in place.
    pub fn insert(&mut self, node: CodeNode) -> u32 {
        if let Some(&idx) = self.by_id.get(&node.id) {
            self.nodes[idx as usize] = node;
            return idx;
        }
        let idx = self.nodes.len() as u32;
        self.by_id.insert(node.id.clone(), idx);
        self.nodes.push(node);
        idx
    }

    pub fn get(&self, idx: u32) -> &CodeNode {
        &self.nodes[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut CodeNode {
        &mut self.nodes[idx as usize]
    }

    pub fn index_of(&self, id: &str) -> Option<u32> {
        self.by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &CodeNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (i as u32, n))
    }

    /// Rebuild the id index after deserialization.
    pub fn reindex(&mut self) {
        self.by_id = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i as u32))
            .collect();
    }
}

// ---------------------------------------------------------------------------
// Project configuration and snapshot
// ---------------------------------------------------------------------------

/// Registration record for one project: where its sources live, where the
/// mirrored storage goes, and which files are in scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_id: String,
    pub source_dir: PathBuf,
    pub storage_dir: PathBuf,
    /// Extensions without the leading dot. Empty = nothing is kept.
    pub allowed_extensions: Vec<String>,
    /// Ordered ignore rules (inserted before includes).
    #[serde(default)]
    pub ignored: Vec<String>,
    /// Ordered include rules; override ignores on deeper paths.
    #[serde(default)]
    pub included: Vec<String>,
}

/// The immutable triple a successful sync publishes. Retrievers hold an
/// `Arc<Snapshot>` and never observe a half-updated project.
pub struct Snapshot {
    pub manifest: Manifest,
    pub arena: NodeArena,
    pub store: crate::store::VectorStore,
    pub graph: crate::graph::CodeGraph,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            manifest: Manifest::new(),
            arena: NodeArena::new(),
            store: crate::store::VectorStore::new(),
            graph: crate::graph::CodeGraph::default(),
        }
    }
}

/// Outcome summary of one sync pass.
#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub updated: usize,
    pub deleted: usize,
    pub logs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_path_scoped() {
        assert_eq!(CodeNode::make_id("src/a.py", "Foo.bar"), "src/a.py::Foo.bar");
    }

    #[test]
    fn arena_replaces_on_duplicate_id() {
        let mut arena = NodeArena::new();
        let node = CodeNode {
            id: "a.py::a.py".into(),
            name: "a.py".into(),
            kind: NodeKind::File,
            file_path: "a.py".into(),
            content: "x = 1".into(),
            docstring: String::new(),
            start_line: 1,
            end_line: 1,
            dependencies: BTreeSet::new(),
            embedding: vec![],
            weights: BTreeMap::new(),
        };
        let idx = arena.insert(node.clone());
        let mut replacement = node;
        replacement.content = "x = 2".into();
        let idx2 = arena.insert(replacement);
        assert_eq!(idx, idx2);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(idx).content, "x = 2");
    }

    #[test]
    fn fingerprint_mtime_parses_component() {
        assert_eq!(fingerprint_mtime("140:1700000000000"), 1_700_000_000_000);
        assert_eq!(fingerprint_mtime("garbage"), 0);
    }

    #[test]
    fn embedding_text_caps_long_content() {
        let node = CodeNode {
            id: "big.py::big.py".into(),
            name: "big.py".into(),
            kind: NodeKind::File,
            file_path: "big.py".into(),
            content: "x".repeat(5000),
            docstring: String::new(),
            start_line: 1,
            end_line: 1,
            dependencies: BTreeSet::new(),
            embedding: vec![],
            weights: BTreeMap::new(),
        };
        let text = node.embedding_text();
        // Header line plus at most the snippet cap.
        assert!(text.len() <= "big.py big.py\n".len() + EMBED_SNIPPET_CHARS);
        assert!(text.starts_with("big.py big.py\n"));
    }
}
