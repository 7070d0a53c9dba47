//! Code graph — dependency edges between nodes plus static weights.
//!
//! File-level edges come from import/include directives resolved by
//! filename stem; symbol-level edges come from identifier occurrences
//! matched against the project's symbol names. Edges live in adjacency
//! side tables indexed by arena position, never as back-pointers inside
//! nodes. After the build, each node carries two static weights:
//! a degree-based centrality proxy and a recency score derived from the
//! fingerprint's mtime component, both normalized per project.

use crate::types::{fingerprint_mtime, Manifest, NodeArena, NodeKind};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub const WEIGHT_CENTRALITY: &str = "centrality";
pub const WEIGHT_RECENCY: &str = "recency";

/// Directed dependency multigraph over a snapshot's arena. Rebuilt
/// wholesale on every sync; retrieval reads a frozen instance.
#[derive(Default)]
pub struct CodeGraph {
    out_edges: Vec<Vec<u32>>,
    in_edges: Vec<Vec<u32>>,
}

impl CodeGraph {
    /// Build the graph for an arena, resolving textual references into
    /// `node.dependencies` and writing static weights back into the
    /// nodes.
    pub fn build(arena: &mut NodeArena, manifest: &Manifest) -> Self {
        resolve_dependencies(arena);

        let n = arena.len();
        let mut out_edges: Vec<Vec<u32>> = vec![Vec::new(); n];
        let mut in_edges: Vec<Vec<u32>> = vec![Vec::new(); n];

        for (idx, node) in arena.iter() {
            for dep_id in &node.dependencies {
                if let Some(target) = arena.index_of(dep_id) {
                    if target != idx {
                        out_edges[idx as usize].push(target);
                        in_edges[target as usize].push(idx);
                    }
                }
            }
        }
        for edges in out_edges.iter_mut().chain(in_edges.iter_mut()) {
            edges.sort_unstable();
            edges.dedup();
        }

        let graph = Self { out_edges, in_edges };
        graph.assign_weights(arena, manifest);
        graph
    }

    /// Undirected neighborhood of a node (dependency edges are followed
    /// both ways during expansion; the symmetric view is materialized
    /// here rather than stored).
    pub fn neighbors(&self, idx: u32) -> Vec<u32> {
        let mut out: Vec<u32> = self.out_edges[idx as usize]
            .iter()
            .chain(&self.in_edges[idx as usize])
            .copied()
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn degree(&self, idx: u32) -> usize {
        self.out_edges[idx as usize].len() + self.in_edges[idx as usize].len()
    }

    pub fn edge_count(&self) -> usize {
        self.out_edges.iter().map(Vec::len).sum()
    }

    /// Degree-based centrality and mtime-based recency, min-max
    /// normalized across the project.
    fn assign_weights(&self, arena: &mut NodeArena, manifest: &Manifest) {
        let max_degree = (0..arena.len() as u32).map(|i| self.degree(i)).max().unwrap_or(0);

        let mtimes: BTreeMap<&String, u128> =
            manifest.iter().map(|(path, fp)| (path, fingerprint_mtime(fp))).collect();
        let min_mtime = mtimes.values().copied().min().unwrap_or(0);
        let max_mtime = mtimes.values().copied().max().unwrap_or(0);
        let mtime_span = max_mtime.saturating_sub(min_mtime);

        for idx in 0..arena.len() as u32 {
            let degree = self.degree(idx);
            let centrality = if max_degree == 0 {
                0.0
            } else {
                degree as f64 / max_degree as f64
            };
            let file_path = arena.get(idx).file_path.clone();
            let recency = match mtimes.get(&file_path) {
                Some(&mtime) if mtime_span > 0 => {
                    (mtime - min_mtime) as f64 / mtime_span as f64
                }
                Some(_) => 1.0,
                None => 0.0,
            };
            let weights = &mut arena.get_mut(idx).weights;
            weights.insert(WEIGHT_CENTRALITY.to_string(), centrality);
            weights.insert(WEIGHT_RECENCY.to_string(), recency);
        }
    }
}

// ---------------------------------------------------------------------------
// Dependency resolution
// ---------------------------------------------------------------------------

/// Fill `node.dependencies` for every node in the arena: file nodes from
/// import directives, symbol nodes from identifier occurrences.
fn resolve_dependencies(arena: &mut NodeArena) {
    // Filename stem → file node ids, for import resolution.
    let mut stem_to_file: HashMap<String, Vec<String>> = HashMap::new();
    // Symbol token → node ids, for reference matching. Method names index
    // under their unqualified last segment.
    let mut symbol_to_ids: HashMap<String, Vec<String>> = HashMap::new();

    for (_, node) in arena.iter() {
        match node.kind {
            NodeKind::File => {
                let file_name = node.file_path.rsplit('/').next().unwrap_or(&node.file_path);
                let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
                stem_to_file.entry(stem.to_string()).or_default().push(node.id.clone());
            }
            _ => {
                let token = node.name.rsplit('.').next().unwrap_or(&node.name);
                if token.len() >= 3 {
                    symbol_to_ids.entry(token.to_string()).or_default().push(node.id.clone());
                }
            }
        }
    }

    let import_patterns = ImportPatterns::new();

    let mut resolved: Vec<(u32, BTreeSet<String>)> = Vec::new();
    for (idx, node) in arena.iter() {
        let deps = match node.kind {
            NodeKind::File => {
                import_patterns.resolve(&node.content, &node.file_path, &stem_to_file)
            }
            _ => symbol_references(node, &symbol_to_ids),
        };
        resolved.push((idx, deps));
    }

    for (idx, deps) in resolved {
        arena.get_mut(idx).dependencies = deps;
    }
}

/// Import/include directive patterns per language family.
struct ImportPatterns {
    c_include: Regex,
    py_import: Regex,
    js_import: Regex,
    rust_use: Regex,
}

impl ImportPatterns {
    fn new() -> Self {
        Self {
            c_include: Regex::new(r#"#include\s+"([^"]+)""#).unwrap(),
            py_import: Regex::new(r"(?m)^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))")
                .unwrap(),
            js_import: Regex::new(
                r#"(?:from\s+['"]([^'"]+)['"]|require\s*\(\s*['"]([^'"]+)['"]\s*\))"#,
            )
            .unwrap(),
            rust_use: Regex::new(r"(?m)(?:use\s+(?:crate|super)::(\w+)|^\s*mod\s+(\w+)\s*;)")
                .unwrap(),
        }
    }

    /// Resolve every directive in `content` to known file node ids by
    /// filename stem; the last path/dot component is the lookup key.
    fn resolve(
        &self,
        content: &str,
        own_path: &str,
        stem_to_file: &HashMap<String, Vec<String>>,
    ) -> BTreeSet<String> {
        let mut targets: Vec<&str> = Vec::new();
        for cap in self.c_include.captures_iter(content) {
            if let Some(m) = cap.get(1) {
                targets.push(m.as_str());
            }
        }
        for re in [&self.py_import, &self.js_import, &self.rust_use] {
            for cap in re.captures_iter(content) {
                if let Some(m) = cap.get(1).or_else(|| cap.get(2)) {
                    targets.push(m.as_str());
                }
            }
        }

        let mut deps = BTreeSet::new();
        for target in targets {
            let stem = target
                .rsplit(['.', '/'])
                .next()
                .unwrap_or(target);
            if let Some(ids) = stem_to_file.get(stem) {
                for id in ids {
                    if !id.starts_with(&format!("{own_path}::")) {
                        deps.insert(id.clone());
                    }
                }
            }
        }
        deps
    }
}

/// Symbol-to-symbol references: identifiers appearing in the node body
/// that name another node in the project.
fn symbol_references(
    node: &crate::types::CodeNode,
    symbol_to_ids: &HashMap<String, Vec<String>>,
) -> BTreeSet<String> {
    let mut seen_tokens: HashSet<&str> = HashSet::new();
    let mut deps = BTreeSet::new();

    for token in node
        .content
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3)
    {
        if !seen_tokens.insert(token) {
            continue;
        }
        if let Some(ids) = symbol_to_ids.get(token) {
            for id in ids {
                if id != &node.id {
                    deps.insert(id.clone());
                }
            }
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::types::Manifest;

    fn arena_from(files: &[(&str, &str)]) -> NodeArena {
        let mut arena = NodeArena::new();
        for (path, content) in files {
            for node in parser::extract(path, content) {
                arena.insert(node);
            }
        }
        arena
    }

    #[test]
    fn import_edges_link_file_nodes() {
        let mut arena = arena_from(&[
            ("app.py", "import store\n\ndef main():\n    s = Store()\n"),
            ("store.py", "class Store:\n    def get(self):\n        pass\n"),
        ]);
        let manifest = Manifest::new();
        let graph = CodeGraph::build(&mut arena, &manifest);

        let app = arena.index_of("app.py::app.py").unwrap();
        let store_file = arena.index_of("store.py::store.py").unwrap();
        assert!(graph.neighbors(app).contains(&store_file));
    }

    #[test]
    fn symbol_references_become_edges() {
        let mut arena = arena_from(&[
            ("app.py", "import store\n\ndef main():\n    s = Store()\n    s.get()\n"),
            ("store.py", "class Store:\n    def fetch(self):\n        pass\n"),
        ]);
        let manifest = Manifest::new();
        let graph = CodeGraph::build(&mut arena, &manifest);

        let main_fn = arena.index_of("app.py::main").unwrap();
        let store_class = arena.index_of("store.py::Store").unwrap();
        assert!(graph.neighbors(main_fn).contains(&store_class));
        // The dependency was also materialized on the node itself.
        assert!(arena.get(main_fn).dependencies.contains("store.py::Store"));
    }

    #[test]
    fn weights_are_normalized() {
        let mut arena = arena_from(&[
            ("a.py", "import b\nimport c\n"),
            ("b.py", "x = 1\ny = 2\n"),
            ("c.py", "z = 3\nw = 4\n"),
        ]);
        let mut manifest = Manifest::new();
        manifest.insert("a.py".into(), "10:1000".into());
        manifest.insert("b.py".into(), "10:2000".into());
        manifest.insert("c.py".into(), "10:3000".into());
        CodeGraph::build(&mut arena, &manifest);

        let a = arena.get(arena.index_of("a.py::a.py").unwrap());
        assert_eq!(a.weights[WEIGHT_CENTRALITY], 1.0);
        assert_eq!(a.weights[WEIGHT_RECENCY], 0.0);
        let c = arena.get(arena.index_of("c.py::c.py").unwrap());
        assert_eq!(c.weights[WEIGHT_RECENCY], 1.0);
    }

    #[test]
    fn self_references_are_dropped() {
        let mut arena = arena_from(&[(
            "loop.py",
            "def recurse(n):\n    return recurse(n - 1)\n",
        )]);
        let graph = CodeGraph::build(&mut arena, &Manifest::new());
        let f = arena.index_of("loop.py::recurse").unwrap();
        assert!(!graph.neighbors(f).contains(&f));
    }
}
