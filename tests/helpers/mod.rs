//! Test harness for end-to-end engine tests.
//!
//! Builds an [`Engine`] over a scratch project in a temp dir, backed by a
//! deterministic in-process provider — no network, no model weights.

// Each integration test binary compiles its own copy of this module and
// uses a different subset of it.
#![allow(dead_code)]

use repomind::config::KeysConfig;
use repomind::context::Ctx;
use repomind::engine::{Engine, EngineOptions};
use repomind::error::Result;
use repomind::pool::KeyPool;
use repomind::provider::{Generation, Provider};
use repomind::types::ProjectConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Embeds by hashing bytes into a fixed 8-dim vector; generation echoes
/// the prompt. Fully deterministic, counts its calls, and can be told to
/// fail the next N embedding requests with a transient error.
#[derive(Default)]
pub struct HashingProvider {
    pub embed_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub fail_embeds: AtomicUsize,
}

impl HashingProvider {
    pub fn embed_one(text: &str) -> Vec<f32> {
        let mut v = [0.0f32; 8];
        for (i, b) in text.bytes().enumerate() {
            v[(b as usize + i) % 8] += f32::from(b % 31) / 31.0;
        }
        v.to_vec()
    }

    fn take_failure(&self) -> bool {
        self.fail_embeds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Provider for HashingProvider {
    fn embed_batch(
        &self,
        _credential: &str,
        _model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(repomind::Error::ProviderTransient("induced 429".into()));
        }
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }

    fn generate(&self, _credential: &str, _model: &str, prompt: &str) -> Result<Generation> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Generation {
            text: format!("grounded answer ({} prompt chars)", prompt.len()),
            prompt_tokens: prompt.len() as u64 / 4,
            completion_tokens: 8,
            total_tokens: prompt.len() as u64 / 4 + 8,
            ok: true,
        })
    }
}

pub struct TestHarness {
    pub engine: Engine,
    pub ctx: Ctx,
    pub provider: Arc<HashingProvider>,
    temp: TempDir,
}

impl TestHarness {
    /// Engine over an empty scratch tree with a project `test` registered
    /// for `.py` files.
    pub fn new() -> Self {
        Self::build(&[], &[], false)
    }

    pub fn with_rules(ignored: &[&str], included: &[&str]) -> Self {
        Self::build(ignored, included, false)
    }

    pub fn with_hyde() -> Self {
        Self::build(&[], &[], true)
    }

    fn build(ignored: &[&str], included: &[&str], hyde: bool) -> Self {
        let temp = TempDir::new().expect("temp dir");
        std::fs::create_dir_all(temp.path().join("source")).unwrap();

        let provider = Arc::new(HashingProvider::default());
        let keys_json = r#"{"keys":["test-key"],"models":["test-model"]}"#;
        let keys = KeysConfig::parse(keys_json, Path::new("keys.json")).unwrap();
        let pool = Arc::new(KeyPool::new(&keys));

        let ctx = Ctx::new();
        let engine = Engine::open(
            &ctx,
            temp.path().join("data"),
            provider.clone() as Arc<dyn Provider>,
            pool,
            EngineOptions { hyde, ..EngineOptions::default() },
        )
        .expect("engine opens");

        let harness = TestHarness { engine, ctx, provider, temp };
        harness
            .engine
            .register(ProjectConfig {
                project_id: "test".into(),
                source_dir: harness.source_dir(),
                storage_dir: harness.storage_dir(),
                allowed_extensions: vec!["py".into()],
                ignored: ignored.iter().map(|s| s.to_string()).collect(),
                included: included.iter().map(|s| s.to_string()).collect(),
            })
            .expect("register");
        harness
    }

    pub fn source_dir(&self) -> PathBuf {
        self.temp.path().join("source")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.temp.path().join("storage")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.temp.path().join("data")
    }

    /// Write a file under the source tree, creating parent dirs.
    pub fn write_source(&self, rel: &str, content: &str) {
        let path = self.source_dir().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn remove_source(&self, rel: &str) {
        std::fs::remove_file(self.source_dir().join(rel)).unwrap();
    }

    pub fn sync(&self) -> repomind::types::SyncReport {
        self.engine.sync(&self.ctx, "test").expect("sync")
    }

    pub fn manifest_bytes(&self) -> Vec<u8> {
        std::fs::read(self.data_dir().join("test/manifest.json")).expect("manifest exists")
    }

    pub fn full_context(&self) -> String {
        std::fs::read_to_string(self.storage_dir().join("_full_context.txt")).expect("full context")
    }

    /// Fingerprints use millisecond mtimes; make sure consecutive writes
    /// land on different timestamps.
    pub fn tick(&self) {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
}
