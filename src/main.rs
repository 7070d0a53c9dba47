//! repomind binary — thin CLI shell over the [`repomind`] library crate.

use anyhow::{bail, Context as _};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use repomind::config::KeysConfig;
use repomind::context::{CounterTelemetry, Ctx};
use repomind::engine::{Engine, EngineOptions};
use repomind::journal::Outcome;
use repomind::pool::KeyPool;
use repomind::provider::HttpProvider;
use repomind::retrieve::RetrievalOptions;
use repomind::types::{ProjectConfig, DEFAULT_CONTEXT_CHARS, DEFAULT_MAX_NODES};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Project-scoped code retrieval and synthesis engine.
#[derive(Parser)]
#[command(name = "repomind", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory for manifests, snapshots, and the project registry
    #[arg(long, env = "REPOMIND_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path to keys.json (default: <data-dir>/keys.json)
    #[arg(long)]
    keys: Option<PathBuf>,

    /// Base URL of the embedding/generation provider
    #[arg(long, env = "REPOMIND_PROVIDER_URL", default_value = "http://127.0.0.1:8750")]
    provider_url: String,

    /// Embed a hypothetical drafted answer instead of the raw prompt
    #[arg(long)]
    hyde: bool,

    /// Candidate ceiling per retrieval pass
    #[arg(long, default_value_t = DEFAULT_MAX_NODES)]
    max_nodes: usize,

    /// Character budget for the packed context
    #[arg(long, default_value_t = DEFAULT_CONTEXT_CHARS)]
    context_chars: usize,

    /// Disable graph expansion (pure vector retrieval)
    #[arg(long)]
    no_graph: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a project (or update its registration)
    Register {
        /// Project identifier
        id: String,
        /// Source tree root
        path: PathBuf,
        /// Storage directory for mirrored text (default: <data-dir>/<id>/storage)
        #[arg(long)]
        storage: Option<PathBuf>,
        /// File extensions to index (repeatable)
        #[arg(long = "ext", required = true)]
        extensions: Vec<String>,
        /// Path rule to ignore (repeatable)
        #[arg(long = "ignore")]
        ignored: Vec<String>,
        /// Path rule to include, overriding ignores (repeatable)
        #[arg(long = "include")]
        included: Vec<String>,
    },
    /// List registered projects
    Projects,
    /// Show a project's snapshot summary
    Status {
        id: String,
    },
    /// Sync a registered project
    Sync {
        id: String,
    },
    /// List ranked candidate nodes for a prompt
    Candidates {
        id: String,
        prompt: String,
    },
    /// Answer a prompt grounded in retrieved code
    Ask {
        id: String,
        prompt: String,
        /// Ground the answer in these node ids instead of retrieving (repeatable)
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
    /// Apply an edit to a file through the journaled write protocol
    Apply {
        /// Target file
        file: PathBuf,
        /// File holding the new content (stdin when omitted)
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Roll back surgeries interrupted by a crash
    Recover {
        /// Directory to scan for stale journals
        dir: PathBuf,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".repomind"))
        .unwrap_or_else(|| PathBuf::from(".repomind"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("repomind=info".parse().expect("static directive parses")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "repomind", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let keys_path = cli.keys.clone().unwrap_or_else(|| data_dir.join("keys.json"));
    let keys = KeysConfig::load(&keys_path)
        .with_context(|| format!("loading credentials from {}", keys_path.display()))?;
    let pool = Arc::new(KeyPool::new(&keys));
    let provider = Arc::new(HttpProvider::new(cli.provider_url.clone()));

    let telemetry = Arc::new(CounterTelemetry::new());
    let ctx = Ctx::with_telemetry(telemetry.clone());
    let options = EngineOptions {
        hyde: cli.hyde,
        retrieval: RetrievalOptions {
            max_nodes: cli.max_nodes,
            use_graph: !cli.no_graph,
            char_budget: cli.context_chars,
        },
    };
    let engine = Engine::open(&ctx, &data_dir, provider, pool, options)?;

    match cli.command {
        Commands::Register { id, path, storage, extensions, ignored, included } => {
            let source_dir = path
                .canonicalize()
                .with_context(|| format!("source path {} not found", path.display()))?;
            let storage_dir = storage.unwrap_or_else(|| data_dir.join(&id).join("storage"));
            engine.register(ProjectConfig {
                project_id: id.clone(),
                source_dir,
                storage_dir,
                allowed_extensions: extensions,
                ignored,
                included,
            })?;
            info!(project = id.as_str(), "registered");
            println!("registered {id}");
        }
        Commands::Projects => {
            for id in engine.project_ids() {
                println!("{id}");
            }
        }
        Commands::Status { id } => {
            let snapshot = engine.snapshot(&id)?;
            println!(
                "files={} nodes={} embedded={} edges={}",
                snapshot.manifest.len(),
                snapshot.arena.len(),
                snapshot.store.len(),
                snapshot.graph.edge_count()
            );
        }
        Commands::Sync { id } => {
            let report = engine.sync(&ctx, &id)?;
            println!("updated={} deleted={}", report.updated, report.deleted);
            for line in &report.logs {
                println!("  {line}");
            }
        }
        Commands::Candidates { id, prompt } => {
            let candidates = engine.candidates(&ctx, &id, &prompt)?;
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        }
        Commands::Ask { id, prompt, nodes } => {
            let selection = if nodes.is_empty() { None } else { Some(nodes.as_slice()) };
            let answer = engine.answer(&ctx, &id, &prompt, selection)?;
            println!("{}", answer.text);
            info!(
                prompt_tokens = answer.prompt_tokens,
                completion_tokens = answer.completion_tokens,
                total_tokens = answer.total_tokens,
                "usage"
            );
        }
        Commands::Apply { file, from } => {
            let new_content = match from {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            match engine.apply_edit(&ctx, &file, &new_content)? {
                Outcome::Committed => println!("committed {}", file.display()),
                Outcome::RolledBack { reason } => {
                    bail!("rolled back ({reason}): {}", file.display())
                }
            }
        }
        Commands::Recover { dir } => {
            let restored = engine.recover(&dir)?;
            if restored.is_empty() {
                println!("no stale journals found");
            } else {
                for path in restored {
                    println!("restored {}", path.display());
                }
            }
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    }

    for (counter, value) in telemetry.snapshot() {
        tracing::debug!(counter, value, "telemetry");
    }

    Ok(())
}
