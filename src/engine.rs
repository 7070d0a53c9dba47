//! Orchestrator — wires requests through cache, retrieval, generation,
//! and the journaled edit path.
//!
//! One [`Engine`] serves every registered project. Each project's
//! snapshot sits behind an `Arc` that is swapped wholesale when a sync
//! completes, so concurrent retrievals see either the old state or the
//! new one, never a blend. The engine itself is `&self`-threaded: each
//! request runs on its caller's thread.

use crate::cache::TtlCache;
use crate::config::ProjectRegistry;
use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::journal::{Journal, Outcome};
use crate::pool::KeyPool;
use crate::provider::{Generation, ModelClient, Provider};
use crate::retrieve::{self, RetrievalOptions, ScoredNode};
use crate::sync;
use crate::types::{NodeKind, ProjectConfig, Snapshot, SyncReport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

struct Project {
    config: ProjectConfig,
    snapshot: Arc<Snapshot>,
}

/// Engine-wide behavior knobs, fixed at open time.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Embed a drafted hypothetical answer instead of the raw prompt.
    pub hyde: bool,
    /// Retrieval tuning shared by `candidates` and `answer`.
    pub retrieval: RetrievalOptions,
}

/// Node summary returned by the candidate listing.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateSummary {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub score: f64,
    pub vector_sim: f64,
    pub graph_score: f64,
    pub centrality: f64,
    pub recency: f64,
    pub hops: usize,
}

pub struct Engine {
    data_dir: PathBuf,
    options: EngineOptions,
    projects: RwLock<BTreeMap<String, Project>>,
    registry: Mutex<ProjectRegistry>,
    client: ModelClient,
    answer_cache: TtlCache<Generation>,
    journal: Journal,
}

impl Engine {
    /// Open the engine over a data directory, reloading every registered
    /// project's last published snapshot. A project whose on-disk state
    /// fails to load starts empty and heals on its next sync.
    pub fn open(
        ctx: &Ctx,
        data_dir: impl Into<PathBuf>,
        provider: Arc<dyn Provider>,
        pool: Arc<KeyPool>,
        options: EngineOptions,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let registry = ProjectRegistry::open(&data_dir)?;

        let mut projects = BTreeMap::new();
        for id in registry.ids() {
            let config = registry.get(&id).expect("registry lists its own ids");
            let snapshot = match sync::load_snapshot(&data_dir, &id) {
                Ok(s) => s,
                Err(e) => {
                    warn!(project = id.as_str(), error = %e, "snapshot reload failed, starting empty");
                    Snapshot::empty()
                }
            };
            info!(project = id.as_str(), nodes = snapshot.arena.len(), "project loaded");
            projects.insert(id, Project { config, snapshot: Arc::new(snapshot) });
        }

        Ok(Self {
            data_dir,
            options,
            projects: RwLock::new(projects),
            registry: Mutex::new(registry),
            client: ModelClient::new(provider, pool, ctx),
            answer_cache: TtlCache::answer_tier(ctx.clock.clone()),
            journal: Journal::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Project lifecycle
    // -----------------------------------------------------------------------

    /// Register (or re-register) a project and persist it to the
    /// registry. The project starts from its last published snapshot if
    /// one exists.
    pub fn register(&self, config: ProjectConfig) -> Result<()> {
        self.registry.lock().unwrap().upsert(&config)?;
        let snapshot = sync::load_snapshot(&self.data_dir, &config.project_id)
            .unwrap_or_else(|_| Snapshot::empty());
        let mut projects = self.projects.write().unwrap();
        projects.insert(
            config.project_id.clone(),
            Project { config, snapshot: Arc::new(snapshot) },
        );
        Ok(())
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.projects.read().unwrap().keys().cloned().collect()
    }

    /// Run a sync pass and atomically publish the new snapshot. Cached
    /// answers are dropped wholesale — they may cite retired nodes.
    pub fn sync(&self, ctx: &Ctx, project_id: &str) -> Result<SyncReport> {
        let (config, previous) = self.project_state(project_id)?;
        let (snapshot, report) =
            sync::sync_project(ctx, &config, &self.client, &previous, &self.data_dir)?;
        {
            let mut projects = self.projects.write().unwrap();
            let project = projects
                .get_mut(project_id)
                .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
            project.snapshot = Arc::new(snapshot);
        }
        self.answer_cache.clear();
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Retrieval surface
    // -----------------------------------------------------------------------

    /// Ranked candidate nodes for a prompt, without generation.
    pub fn candidates(
        &self,
        ctx: &Ctx,
        project_id: &str,
        prompt: &str,
    ) -> Result<Vec<CandidateSummary>> {
        let (_, snapshot) = self.project_state(project_id)?;
        let embedding = self.query_embedding(ctx, prompt)?;
        let retrieval =
            retrieve::retrieve(ctx, &snapshot, &embedding, &self.options.retrieval)?;
        Ok(retrieval
            .selected
            .iter()
            .map(|scored| {
                let node = snapshot.arena.get(scored.idx);
                CandidateSummary {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    kind: node.kind,
                    file_path: node.file_path.clone(),
                    start_line: node.start_line,
                    end_line: node.end_line,
                    score: scored.final_score,
                    vector_sim: scored.vector_sim,
                    graph_score: scored.graph_score,
                    centrality: scored.centrality,
                    recency: scored.recency,
                    hops: scored.distance,
                }
            })
            .collect())
    }

    /// Answer a prompt grounded in retrieved (or caller-selected) nodes.
    /// Results are cached per `(project, prompt, selection)` for the
    /// answer tier's TTL.
    pub fn answer(
        &self,
        ctx: &Ctx,
        project_id: &str,
        prompt: &str,
        selected_ids: Option<&[String]>,
    ) -> Result<Generation> {
        let cache_key = answer_cache_key(project_id, prompt, selected_ids);
        if let Some(hit) = self.answer_cache.get(&cache_key) {
            ctx.telemetry.incr("answer.cache_hit", 1);
            return Ok(hit);
        }
        ctx.telemetry.incr("answer.cache_miss", 1);

        let (_, snapshot) = self.project_state(project_id)?;
        let context = match selected_ids {
            Some(ids) if !ids.is_empty() => self.pack_selection(&snapshot, ids)?,
            _ => {
                let embedding = self.query_embedding(ctx, prompt)?;
                retrieve::retrieve(ctx, &snapshot, &embedding, &self.options.retrieval)?.context
            }
        };

        let full_prompt = if context.is_empty() {
            prompt.to_string()
        } else {
            format!("{context}\n\nQuestion: {prompt}")
        };
        let generation = self.client.generate(ctx, &full_prompt)?;
        self.answer_cache.set(cache_key, generation.clone());
        Ok(generation)
    }

    /// Apply a model-generated edit through the journal protocol. A
    /// validator rejection is a clean abort, reported as `rolled_back`
    /// with its reason; every other failure propagates.
    pub fn apply_edit(&self, ctx: &Ctx, file_path: &Path, new_content: &str) -> Result<Outcome> {
        match self.journal.apply(ctx, file_path, new_content) {
            Err(Error::SyntaxInvalid(reason)) => Ok(Outcome::rolled_back(reason)),
            other => other,
        }
    }

    /// Roll back any surgeries interrupted by a crash under `dir`.
    pub fn recover(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.journal.recover_dir(dir)
    }

    /// Frozen snapshot of a project, for inspection and tests.
    pub fn snapshot(&self, project_id: &str) -> Result<Arc<Snapshot>> {
        Ok(self.project_state(project_id)?.1)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn project_state(&self, project_id: &str) -> Result<(ProjectConfig, Arc<Snapshot>)> {
        let projects = self.projects.read().unwrap();
        let project = projects
            .get(project_id)
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
        Ok((project.config.clone(), Arc::clone(&project.snapshot)))
    }

    /// Embedding for the retrieval query. In HyDE mode the prompt is
    /// first expanded into a hypothetical answer and that draft is
    /// embedded instead of the raw question.
    fn query_embedding(&self, ctx: &Ctx, prompt: &str) -> Result<Vec<f32>> {
        if !self.options.hyde {
            return self.client.embed(ctx, prompt);
        }
        let draft_prompt = format!(
            "Write a short, plausible code-level answer to the following question, \
             as if quoting from the project's source:\n{prompt}"
        );
        match self.client.generate(ctx, &draft_prompt) {
            Ok(draft) if !draft.text.trim().is_empty() => {
                ctx.telemetry.incr("retrieve.hyde_drafts", 1);
                self.client.embed(ctx, &draft.text)
            }
            Ok(_) => self.client.embed(ctx, prompt),
            Err(e) => {
                warn!(error = %e, "hyde draft failed, embedding the raw prompt");
                self.client.embed(ctx, prompt)
            }
        }
    }

    /// Pack an explicit node selection, preserving the caller's order as
    /// the ranking. Unknown ids are reported, not silently dropped.
    fn pack_selection(&self, snapshot: &Snapshot, ids: &[String]) -> Result<String> {
        let mut ranked = Vec::with_capacity(ids.len());
        for id in ids {
            let idx = snapshot
                .arena
                .index_of(id)
                .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
            ranked.push(ScoredNode {
                idx,
                vector_sim: 0.0,
                graph_score: 0.0,
                centrality: 0.0,
                recency: 0.0,
                final_score: 0.0,
                distance: 0,
            });
        }
        Ok(retrieve::pack(snapshot, ranked, self.options.retrieval.char_budget).context)
    }
}

fn answer_cache_key(project_id: &str, prompt: &str, selected_ids: Option<&[String]>) -> String {
    let mut key = format!("{project_id}\u{1f}{prompt}");
    if let Some(ids) = selected_ids {
        for id in ids {
            key.push('\u{1f}');
            key.push_str(id);
        }
    }
    key
}
