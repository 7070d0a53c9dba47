//! Hybrid retrieval: ANN seeding, graph expansion, multi-signal
//! re-ranking, and budget-bounded hierarchical context packing.
//!
//! All four stages are pure compute over a frozen snapshot; for a given
//! snapshot and query embedding the result is deterministic.

use crate::context::Ctx;
use crate::error::Result;
use crate::graph::{WEIGHT_CENTRALITY, WEIGHT_RECENCY};
use crate::types::{Snapshot, DEFAULT_CONTEXT_CHARS, DEFAULT_MAX_NODES};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Per-hop decay applied to graph expansion scores.
const EXPANSION_DECAY: f64 = 0.6;

/// Expansion radius, in hops from the nearest seed.
const MAX_HOPS: usize = 3;

/// Signal weights: vector similarity, graph score, centrality, recency.
/// They sum to 1.
const W_VECTOR: f64 = 0.55;
const W_GRAPH: f64 = 0.25;
const W_CENTRALITY: f64 = 0.10;
const W_RECENCY: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub max_nodes: usize,
    pub use_graph: bool,
    pub char_budget: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
            use_graph: true,
            char_budget: DEFAULT_CONTEXT_CHARS,
        }
    }
}

/// One ranked candidate with its score breakdown.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub idx: u32,
    pub vector_sim: f64,
    pub graph_score: f64,
    pub centrality: f64,
    pub recency: f64,
    pub final_score: f64,
    /// Hop count from the nearest seed; 0 for seeds themselves.
    pub distance: usize,
}

/// Packed context plus the ordered node selection behind it.
#[derive(Debug, Default)]
pub struct Retrieval {
    pub context: String,
    pub selected: Vec<ScoredNode>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct Candidate {
    idx: u32,
    vector_sim: f64,
    graph_score: f64,
    /// Provisional score during expansion: seeds carry their vector
    /// similarity, expanded nodes their graph score. Stage 3 replaces it.
    provisional: f64,
    distance: usize,
}

/// Run the full retrieval pipeline against a frozen snapshot. An empty
/// ANN result yields an empty retrieval, not an error.
pub fn retrieve(
    ctx: &Ctx,
    snapshot: &Snapshot,
    query_embedding: &[f32],
    opts: &RetrievalOptions,
) -> Result<Retrieval> {
    ctx.cancel.checkpoint()?;

    // Stage 1 — ANN seeding.
    let seed_k = opts.max_nodes.div_ceil(4);
    let seeds = snapshot.store.search(query_embedding, seed_k);
    if seeds.is_empty() {
        return Ok(Retrieval::default());
    }

    let mut candidates: Vec<Candidate> = Vec::with_capacity(opts.max_nodes);
    let mut present: HashMap<u32, usize> = HashMap::new();
    for (idx, distance) in seeds {
        let vector_sim = (1.0 - f64::from(distance) / 2.0).clamp(0.0, 1.0);
        present.insert(idx, candidates.len());
        candidates.push(Candidate {
            idx,
            vector_sim,
            graph_score: 0.0,
            provisional: vector_sim,
            distance: 0,
        });
    }

    // Stage 2 — exponential graph expansion, level-synchronized BFS.
    if opts.use_graph {
        ctx.cancel.checkpoint()?;
        expand(snapshot, &mut candidates, &mut present, opts.max_nodes);
    }

    // Stage 3 — multi-dimensional scoring.
    ctx.cancel.checkpoint()?;
    let query_norm = normalize(query_embedding);
    let mut scored: Vec<ScoredNode> = candidates
        .into_iter()
        .map(|c| {
            let node = snapshot.arena.get(c.idx);
            let vector_sim = if c.distance == 0 {
                c.vector_sim
            } else {
                similarity(&query_norm, &node.embedding)
            };
            let centrality = node.weights.get(WEIGHT_CENTRALITY).copied().unwrap_or(0.0);
            let recency = node.weights.get(WEIGHT_RECENCY).copied().unwrap_or(0.0);
            let final_score = W_VECTOR * vector_sim
                + W_GRAPH * c.graph_score
                + W_CENTRALITY * centrality
                + W_RECENCY * recency;
            ScoredNode {
                idx: c.idx,
                vector_sim,
                graph_score: c.graph_score,
                centrality,
                recency,
                final_score,
                distance: c.distance,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.distance.cmp(&b.distance))
            .then_with(|| {
                snapshot.arena.get(a.idx).name.cmp(&snapshot.arena.get(b.idx).name)
            })
    });

    // Stage 4 — hierarchical packing.
    ctx.cancel.checkpoint()?;
    Ok(pack(snapshot, scored, opts.char_budget))
}

/// BFS outward from the seeds. Each newly discovered node scores
/// `decay^hop · mean(parent provisional scores)`, parents being the
/// previous-level candidates that reach it. Bounded by `max_nodes`.
fn expand(
    snapshot: &Snapshot,
    candidates: &mut Vec<Candidate>,
    present: &mut HashMap<u32, usize>,
    max_nodes: usize,
) {
    let mut level: Vec<u32> = candidates.iter().map(|c| c.idx).collect();

    for hop in 1..=MAX_HOPS {
        if candidates.len() >= max_nodes || level.is_empty() {
            return;
        }

        // Discovery order: parent rank, then neighbor order.
        let mut discovered: Vec<u32> = Vec::new();
        let mut parent_scores: HashMap<u32, Vec<f64>> = HashMap::new();
        for &parent in &level {
            let parent_score = candidates[present[&parent]].provisional;
            for neighbor in snapshot.graph.neighbors(parent) {
                if present.contains_key(&neighbor) {
                    continue;
                }
                let scores = parent_scores.entry(neighbor).or_default();
                if scores.is_empty() {
                    discovered.push(neighbor);
                }
                scores.push(parent_score);
            }
        }

        let mut next_level = Vec::new();
        for idx in discovered {
            if candidates.len() >= max_nodes {
                return;
            }
            let parents = &parent_scores[&idx];
            let mean = parents.iter().sum::<f64>() / parents.len() as f64;
            let graph_score = EXPANSION_DECAY.powi(hop as i32) * mean;
            present.insert(idx, candidates.len());
            candidates.push(Candidate {
                idx,
                vector_sim: 0.0,
                graph_score,
                provisional: graph_score,
                distance: hop,
            });
            next_level.push(idx);
        }
        level = next_level;
    }
}

/// Group the ranked selection by file, order each group by node kind then
/// span, and concatenate under the character budget. The budget counts
/// node content bytes; separators ride free. Nodes are never split —
/// packing stops at the first node that does not fit.
///
/// Public so the orchestrator can pack an explicit, caller-chosen node
/// selection through the same format.
pub fn pack(snapshot: &Snapshot, ranked: Vec<ScoredNode>, char_budget: usize) -> Retrieval {
    let mut used = 0usize;
    let mut selected: Vec<ScoredNode> = Vec::new();
    for node in ranked {
        let len = snapshot.arena.get(node.idx).content.len();
        if used + len > char_budget {
            break;
        }
        used += len;
        selected.push(node);
    }

    // File groups in first-appearance (best-rank) order.
    let mut group_order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&ScoredNode>> = HashMap::new();
    for node in &selected {
        let path = snapshot.arena.get(node.idx).file_path.as_str();
        if !groups.contains_key(path) {
            group_order.push(path);
        }
        groups.entry(path).or_default().push(node);
    }

    let mut context = String::with_capacity(used + group_order.len() * 32);
    for path in group_order {
        let mut members = groups.remove(path).unwrap_or_default();
        members.sort_by_key(|n| {
            let node = snapshot.arena.get(n.idx);
            (node.kind.pack_rank(), node.start_line)
        });
        if !context.is_empty() {
            context.push_str("\n\n");
        }
        context.push_str(&format!("--- FILE: {path} ---\n"));
        let mut first = true;
        for member in members {
            if !first {
                context.push_str("\n\n");
            }
            first = false;
            context.push_str(&snapshot.arena.get(member.idx).content);
        }
    }

    Retrieval { context, selected }
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

fn normalize(v: &[f32]) -> Vec<f64> {
    let norm: f64 = v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return v.iter().map(|x| f64::from(*x)).collect();
    }
    v.iter().map(|x| f64::from(*x) / norm).collect()
}

/// `1 − distance/2` under the store's inner-product metric, in `[0, 1]`.
fn similarity(query_norm: &[f64], embedding: &[f32]) -> f64 {
    if embedding.is_empty() || embedding.len() != query_norm.len() {
        return 0.0;
    }
    let emb_norm = normalize(embedding);
    let dot: f64 = query_norm.iter().zip(&emb_norm).map(|(a, b)| a * b).sum();
    ((1.0 + dot) / 2.0).clamp(0.0, 1.0)
}
