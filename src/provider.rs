//! Uniform client over the external embedding/generation provider.
//!
//! [`Provider`] is the narrow wire interface (one credential, one model,
//! one request). [`ModelClient`] layers the operational policy on top:
//! ticketing a `(credential, model)` pair from the pool, rotating on
//! transient failures, one model fallback when every active key is
//! exhausted, and the exact-text embedding cache.

use crate::cache::TtlCache;
use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::pool::KeyPool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Result of one generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub ok: bool,
}

/// One provider request against a fixed credential and model. Transient
/// failures (429, 5xx, timeout) and terminal ones (other 4xx, malformed
/// bodies) are distinguished through the error kind.
pub trait Provider: Send + Sync {
    /// Size- and order-preserving batch embedding.
    fn embed_batch(&self, credential: &str, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn generate(&self, credential: &str, model: &str, prompt: &str) -> Result<Generation>;
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Default per-request deadline. Expiry counts as a rate-limit signal so
/// the pool rotates away from the slow key.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
    #[serde(default)]
    usage: UsageBody,
}

#[derive(Deserialize, Default)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Blocking JSON client for the provider's two endpoints.
pub struct HttpProvider {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .build();
        Self { agent, base_url: base_url.into() }
    }

    fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        credential: &str,
        body: impl Serialize,
    ) -> Result<T> {
        let url = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {credential}"))
            .send_json(body)
            .map_err(classify_http_error)?;
        response
            .into_json::<T>()
            .map_err(|e| Error::ProviderTerminal(format!("malformed response: {e}")))
    }
}

/// 429 and 5xx are transient (retry after rotation); any other 4xx is
/// terminal for the request. Transport errors (refused, DNS, timeout)
/// count as transient.
fn classify_http_error(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(429, _) => Error::ProviderTransient("rate limited (429)".into()),
        ureq::Error::Status(code, _) if code >= 500 => {
            Error::ProviderTransient(format!("server error ({code})"))
        }
        ureq::Error::Status(code, _) => Error::ProviderTerminal(format!("request rejected ({code})")),
        ureq::Error::Transport(t) => Error::ProviderTransient(format!("transport: {t}")),
    }
}

impl Provider for HttpProvider {
    fn embed_batch(&self, credential: &str, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response: EmbedResponse =
            self.post("v1/embeddings", credential, EmbedRequest { model, input: texts })?;
        if response.embeddings.len() != texts.len() {
            return Err(Error::ProviderTerminal(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }

    fn generate(&self, credential: &str, model: &str, prompt: &str) -> Result<Generation> {
        let response: GenerateResponse =
            self.post("v1/generate", credential, GenerateRequest { model, prompt })?;
        Ok(Generation {
            text: response.text,
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            total_tokens: response.usage.total_tokens,
            ok: true,
        })
    }
}

// ---------------------------------------------------------------------------
// Model client — rotation policy + embedding cache
// ---------------------------------------------------------------------------

pub struct ModelClient {
    provider: Arc<dyn Provider>,
    pool: Arc<KeyPool>,
    embed_cache: TtlCache<Vec<f32>>,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn Provider>, pool: Arc<KeyPool>, ctx: &Ctx) -> Self {
        Self {
            provider,
            pool,
            embed_cache: TtlCache::embedding_tier(ctx.clock.clone()),
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Embed one text, consulting the exact-text cache first.
    pub fn embed(&self, ctx: &Ctx, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut out = self.embed_batch(ctx, &texts)?;
        Ok(out.pop().unwrap_or_default())
    }

    /// Embed a batch, size- and order-preserving. Cached texts never reach
    /// the provider; the misses go out as a single request and the results
    /// are stitched back into input order.
    pub fn embed_batch(&self, ctx: &Ctx, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices: Vec<usize> = Vec::new();
        let mut miss_texts: Vec<String> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(hit) = self.embed_cache.get(text) {
                ctx.telemetry.incr("embed.cache_hit", 1);
                out[i] = Some(hit);
            } else {
                ctx.telemetry.incr("embed.cache_miss", 1);
                miss_indices.push(i);
                miss_texts.push(text.clone());
            }
        }

        if !miss_texts.is_empty() {
            ctx.cancel.checkpoint()?;
            let embedded = self.call_with_rotation(ctx, |credential, model| {
                self.provider.embed_batch(credential, model, &miss_texts)
            })?;
            for (slot, vector) in miss_indices.iter().zip(embedded) {
                self.embed_cache.set(texts[*slot].clone(), vector.clone());
                out[*slot] = Some(vector);
            }
        }

        Ok(out.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    /// One generation call under the rotation policy. Answer caching is
    /// the orchestrator's concern, not this layer's.
    pub fn generate(&self, ctx: &Ctx, prompt: &str) -> Result<Generation> {
        ctx.cancel.checkpoint()?;
        ctx.telemetry.incr("provider.generate", 1);
        self.call_with_rotation(ctx, |credential, model| {
            self.provider.generate(credential, model, prompt)
        })
    }

    /// Ticketing loop: try the current `(credential, model)`; on a
    /// transient failure report it, rotate the key, and try the next.
    /// When every active key has been burned, rotate the model once and
    /// make a final attempt before surfacing the failure.
    ///
    /// Rotation itself never skips decommissioned slots, so the cursor
    /// can be parked on one from an earlier call; each attempt steps
    /// past those first, spending attempts on active keys only.
    fn call_with_rotation<T>(
        &self,
        ctx: &Ctx,
        op: impl Fn(&str, &str) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.pool.active_key_count().max(1);
        for _ in 0..attempts {
            ctx.cancel.checkpoint()?;
            let mut hops = self.pool.key_count();
            while !self.pool.current_key_active() && hops > 0 {
                self.pool.rotate_key();
                hops -= 1;
            }
            let (credential, model) = self.pool.current();
            match op(&credential, &model) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    debug!(model = model.as_str(), error = %e, "transient provider failure, rotating key");
                    ctx.telemetry.incr("provider.rotations", 1);
                    self.pool.report_rate_limit();
                    self.pool.rotate_key();
                }
                Err(e) => return Err(e),
            }
        }

        warn!("all active keys exhausted, rotating model");
        ctx.telemetry.incr("provider.model_rotations", 1);
        self.pool.rotate_model();
        let (credential, model) = self.pool.current();
        op(&credential, &model).map_err(|e| match e {
            Error::ProviderTransient(reason) => {
                Error::ProviderTransient(format!("provider unavailable: {reason}"))
            }
            other => other,
        })
    }
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Truncate to at most `max_chars` characters, never mid code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeysConfig;
    use std::path::Path;
    use std::sync::Mutex;

    /// Deterministic provider double: embeds by text length, fails on
    /// command. Records every credential it was called with.
    struct ScriptedProvider {
        fail_next: Mutex<usize>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(fail_next: usize) -> Self {
            Self { fail_next: Mutex::new(fail_next), calls: Mutex::new(Vec::new()) }
        }

        fn should_fail(&self, credential: &str) -> bool {
            self.calls.lock().unwrap().push(credential.to_string());
            let mut remaining = self.fail_next.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        }
    }

    impl Provider for ScriptedProvider {
        fn embed_batch(
            &self,
            credential: &str,
            _model: &str,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>> {
            if self.should_fail(credential) {
                return Err(Error::ProviderTransient("scripted 429".into()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect())
        }

        fn generate(&self, credential: &str, _model: &str, prompt: &str) -> Result<Generation> {
            if self.should_fail(credential) {
                return Err(Error::ProviderTransient("scripted 429".into()));
            }
            Ok(Generation {
                text: format!("answer to: {prompt}"),
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                ok: true,
            })
        }
    }

    fn client(fail_next: usize, keys: &[&str]) -> (ModelClient, Arc<ScriptedProvider>, Ctx) {
        let provider = Arc::new(ScriptedProvider::new(fail_next));
        let json = serde_json::json!({ "keys": keys, "models": ["m1", "m2"] }).to_string();
        let pool =
            Arc::new(KeyPool::new(&KeysConfig::parse(&json, Path::new("keys.json")).unwrap()));
        let ctx = Ctx::new();
        (ModelClient::new(provider.clone(), pool, &ctx), provider, ctx)
    }

    #[test]
    fn embed_batch_preserves_order_and_size() {
        let (client, _, ctx) = client(0, &["k1"]);
        let texts: Vec<String> = vec!["a".into(), "bbb".into(), "cc".into()];
        let out = client.embed_batch(&ctx, &texts).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0][0], 1.0);
        assert_eq!(out[1][0], 3.0);
        assert_eq!(out[2][0], 2.0);
    }

    #[test]
    fn cached_embeddings_skip_the_provider() {
        let (client, provider, ctx) = client(0, &["k1"]);
        client.embed(&ctx, "hello").unwrap();
        client.embed(&ctx, "hello").unwrap();
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn partial_cache_hit_sends_only_misses() {
        let (client, provider, ctx) = client(0, &["k1"]);
        client.embed(&ctx, "warm").unwrap();
        let texts: Vec<String> = vec!["warm".into(), "cold".into()];
        let out = client.embed_batch(&ctx, &texts).unwrap();
        assert_eq!(out[0][0], 4.0);
        assert_eq!(out[1][0], 4.0);
        // One call for the warm-up, one for the single miss.
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn transient_failure_rotates_to_next_key() {
        let (client, provider, ctx) = client(1, &["k1", "k2"]);
        let gen = client.generate(&ctx, "q").unwrap();
        assert!(gen.ok);
        let calls = provider.calls.lock().unwrap();
        assert_eq!(*calls, vec!["k1".to_string(), "k2".to_string()]);
        // The burned key picked up a failure report.
        assert_eq!(client.pool().active_key_count(), 2);
    }

    #[test]
    fn exhausted_keys_trigger_one_model_rotation() {
        let (client, provider, ctx) = client(2, &["k1", "k2"]);
        let gen = client.generate(&ctx, "q").unwrap();
        assert!(gen.ok);
        // Two failures burn both keys, then the model fallback lands on k1.
        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], "k1");
        assert_eq!(client.pool().current().1, "m2");
    }

    #[test]
    fn rotation_steps_past_decommissioned_slots() {
        let (client, provider, ctx) = client(1, &["k1", "k2", "k3"]);
        // Park the cursor on k2 and decommission it, as an earlier
        // rate-limited call would have left it.
        client.pool().rotate_key();
        client.pool().report_rate_limit();
        client.pool().report_rate_limit();
        client.pool().report_rate_limit();
        assert!(!client.pool().current_key_active());
        assert_eq!(client.pool().active_key_count(), 2);

        let gen = client.generate(&ctx, "q").unwrap();
        assert!(gen.ok);
        // k2 is never handed a request; both remaining active keys get
        // their try under the same model, so no model rotation happens.
        let calls = provider.calls.lock().unwrap();
        assert_eq!(*calls, vec!["k3".to_string(), "k1".to_string()]);
        assert_eq!(client.pool().current().1, "m1");
    }

    #[test]
    fn persistent_failure_surfaces_as_transient() {
        let (client, _, ctx) = client(10, &["k1", "k2"]);
        let err = client.generate(&ctx, "q").unwrap_err();
        assert!(matches!(err, Error::ProviderTransient(_)));
    }

    #[test]
    fn truncate_respects_code_points() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }
}
