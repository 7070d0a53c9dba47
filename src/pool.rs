//! Credential and model rotation pool.
//!
//! Holds an ordered list of provider credentials and an ordered list of
//! model identifiers, with atomic cursors over both. Rotation is O(1) and
//! deterministic: it never skips decommissioned keys on its own — the
//! client's retry loop owns that policy and simply rotates again.

use crate::config::KeysConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::{info, warn};

/// Rate-limit reports tolerated before a key is decommissioned.
const MAX_KEY_FAILURES: u32 = 2;

#[derive(Debug, Clone)]
struct KeySlot {
    credential: String,
    active: bool,
    fail_count: u32,
}

struct PoolState {
    keys: Vec<KeySlot>,
    models: Vec<String>,
    serper: Option<String>,
}

/// Thread-safe rotation pool. Reads take the shared lock; configuration
/// reload and failure reporting take the exclusive lock; cursors advance
/// atomically.
pub struct KeyPool {
    state: RwLock<PoolState>,
    key_cursor: AtomicUsize,
    model_cursor: AtomicUsize,
}

impl KeyPool {
    pub fn new(config: &KeysConfig) -> Self {
        let pool = Self {
            state: RwLock::new(PoolState { keys: Vec::new(), models: Vec::new(), serper: None }),
            key_cursor: AtomicUsize::new(0),
            model_cursor: AtomicUsize::new(0),
        };
        pool.reload(config);
        pool
    }

    /// Replace the pool contents from a freshly parsed config. Cursors and
    /// failure counters reset; in-flight readers finish against the old
    /// state or the new one, never a blend.
    pub fn reload(&self, config: &KeysConfig) {
        let keys: Vec<KeySlot> = config
            .keys
            .iter()
            .map(|credential| KeySlot {
                credential: credential.clone(),
                active: true,
                fail_count: 0,
            })
            .collect();
        let models = config.model_list();
        info!(keys = keys.len(), models = models.len(), "key pool loaded");
        let mut state = self.state.write().unwrap();
        state.keys = keys;
        state.models = models;
        state.serper = config.serper.clone();
        self.key_cursor.store(0, Ordering::SeqCst);
        self.model_cursor.store(0, Ordering::SeqCst);
    }

    /// Current `(credential, model)` ticket. Cursor values are reduced
    /// modulo the pool sizes at read time.
    pub fn current(&self) -> (String, String) {
        let state = self.state.read().unwrap();
        let key = &state.keys[self.key_cursor.load(Ordering::SeqCst) % state.keys.len()];
        let model = &state.models[self.model_cursor.load(Ordering::SeqCst) % state.models.len()];
        (key.credential.clone(), model.clone())
    }

    /// Advance to the next key. Does not consult active flags.
    pub fn rotate_key(&self) {
        self.key_cursor.fetch_add(1, Ordering::SeqCst);
    }

    /// Advance to the next model and restart from the first key, so the
    /// new model begins with the freshest quota.
    pub fn rotate_model(&self) {
        self.model_cursor.fetch_add(1, Ordering::SeqCst);
        self.key_cursor.store(0, Ordering::SeqCst);
    }

    /// Record a rate-limit (or deadline) report against the current key.
    /// The key is decommissioned once its failures exceed the threshold.
    pub fn report_rate_limit(&self) {
        let mut state = self.state.write().unwrap();
        let len = state.keys.len();
        let idx = self.key_cursor.load(Ordering::SeqCst) % len;
        let slot = &mut state.keys[idx];
        slot.fail_count += 1;
        if slot.fail_count > MAX_KEY_FAILURES && slot.active {
            slot.active = false;
            warn!(key_index = idx, failures = slot.fail_count, "credential decommissioned");
        }
    }

    /// Number of keys still marked active.
    pub fn active_key_count(&self) -> usize {
        self.state.read().unwrap().keys.iter().filter(|k| k.active).count()
    }

    pub fn key_count(&self) -> usize {
        self.state.read().unwrap().keys.len()
    }

    pub fn model_count(&self) -> usize {
        self.state.read().unwrap().models.len()
    }

    /// Whether the current ticket's key is still active.
    pub fn current_key_active(&self) -> bool {
        let state = self.state.read().unwrap();
        state.keys[self.key_cursor.load(Ordering::SeqCst) % state.keys.len()].active
    }

    /// Auxiliary search credential from the config, if any.
    pub fn serper(&self) -> Option<String> {
        self.state.read().unwrap().serper.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn pool(keys: &[&str], models: &[&str]) -> KeyPool {
        let json = serde_json::json!({ "keys": keys, "models": models }).to_string();
        KeyPool::new(&KeysConfig::parse(&json, Path::new("keys.json")).unwrap())
    }

    #[test]
    fn rotation_advances_modulo_pool_size() {
        let p = pool(&["k1", "k2", "k3"], &["m1"]);
        assert_eq!(p.current().0, "k1");
        p.rotate_key();
        assert_eq!(p.current().0, "k2");
        p.rotate_key();
        p.rotate_key();
        assert_eq!(p.current().0, "k1");
    }

    #[test]
    fn model_rotation_resets_key_cursor() {
        let p = pool(&["k1", "k2"], &["m1", "m2"]);
        p.rotate_key();
        assert_eq!(p.current(), ("k2".to_string(), "m1".to_string()));
        p.rotate_model();
        assert_eq!(p.current(), ("k1".to_string(), "m2".to_string()));
    }

    #[test]
    fn three_rate_limits_decommission_a_key() {
        let p = pool(&["k1", "k2", "k3"], &["m1"]);
        p.report_rate_limit();
        p.report_rate_limit();
        assert_eq!(p.active_key_count(), 3);
        p.report_rate_limit();
        assert_eq!(p.active_key_count(), 2);
        assert!(!p.current_key_active());
        // Rotation is unaffected by the inactive flag.
        p.rotate_key();
        assert_eq!(p.current().0, "k2");
    }

    #[test]
    fn serper_credential_passes_through() {
        let json = serde_json::json!({ "keys": ["k1"], "serper": "aux-cred" }).to_string();
        let p = KeyPool::new(&KeysConfig::parse(&json, Path::new("keys.json")).unwrap());
        assert_eq!(p.serper().as_deref(), Some("aux-cred"));
    }

    #[test]
    fn reload_resets_cursors_and_failures() {
        let p = pool(&["k1", "k2"], &["m1", "m2"]);
        p.rotate_key();
        p.rotate_model();
        p.report_rate_limit();
        let json = serde_json::json!({ "keys": ["n1", "n2"], "models": ["m9"] }).to_string();
        p.reload(&KeysConfig::parse(&json, Path::new("keys.json")).unwrap());
        assert_eq!(p.current(), ("n1".to_string(), "m9".to_string()));
        assert_eq!(p.active_key_count(), 2);
    }
}
