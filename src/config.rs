//! Configuration parsing: provider credentials (`keys.json`) and the
//! persisted project registry (`projects.toml`).
//!
//! Both files are parsed into fixed recognized-options structs; unknown
//! keys are logged and ignored rather than rejected, so configs written
//! by newer tooling keep loading.

use crate::error::{Error, Result};
use crate::types::ProjectConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// keys.json
// ---------------------------------------------------------------------------

/// Built-in model fallbacks used when the config names none.
pub const DEFAULT_MODELS: [&str; 2] = ["gemini-2.0-flash", "gemini-2.0-flash-lite"];

/// Recognized options of `keys.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Credential strings, in rotation order. Required, non-empty.
    pub keys: Vec<String>,
    /// Ordered model identifiers. Optional; see [`KeysConfig::model_list`].
    #[serde(default)]
    pub models: Option<Vec<String>>,
    /// Legacy single-model fields, used when `models` is absent.
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub secondary: Option<String>,
    /// Auxiliary search credential, opaque to the core.
    #[serde(default)]
    pub serper: Option<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

impl KeysConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let config: KeysConfig = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("malformed {}: {e}", origin.display())))?;
        if config.keys.is_empty() {
            return Err(Error::Config(format!("{}: `keys` must be non-empty", origin.display())));
        }
        for key in config.unknown.keys() {
            warn!(file = %origin.display(), key = key.as_str(), "ignoring unrecognized config key");
        }
        Ok(config)
    }

    /// Effective model rotation order: `models` if present and non-empty,
    /// else `primary`+`secondary`, else the built-in defaults.
    pub fn model_list(&self) -> Vec<String> {
        if let Some(models) = &self.models {
            if !models.is_empty() {
                return models.clone();
            }
        }
        let legacy: Vec<String> =
            [self.primary.clone(), self.secondary.clone()].into_iter().flatten().collect();
        if !legacy.is_empty() {
            return legacy;
        }
        DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()
    }
}

// ---------------------------------------------------------------------------
// projects.toml
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    projects: BTreeMap<String, RegistryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    source_dir: PathBuf,
    storage_dir: PathBuf,
    #[serde(default)]
    allowed_extensions: Vec<String>,
    #[serde(default)]
    ignored: Vec<String>,
    #[serde(default)]
    included: Vec<String>,
}

/// Registered projects, persisted under the data directory so syncs and
/// queries in later runs find their configuration again.
pub struct ProjectRegistry {
    path: PathBuf,
    file: RegistryFile,
}

impl ProjectRegistry {
    /// Load the registry, or start empty if the file does not exist yet.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("projects.toml");
        let file = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            toml::from_str(&text)
                .map_err(|e| Error::Config(format!("malformed {}: {e}", path.display())))?
        } else {
            RegistryFile::default()
        };
        Ok(Self { path, file })
    }

    pub fn get(&self, project_id: &str) -> Option<ProjectConfig> {
        self.file.projects.get(project_id).map(|entry| ProjectConfig {
            project_id: project_id.to_string(),
            source_dir: entry.source_dir.clone(),
            storage_dir: entry.storage_dir.clone(),
            allowed_extensions: entry.allowed_extensions.clone(),
            ignored: entry.ignored.clone(),
            included: entry.included.clone(),
        })
    }

    pub fn ids(&self) -> Vec<String> {
        self.file.projects.keys().cloned().collect()
    }

    /// Insert or replace a project and persist the registry atomically.
    pub fn upsert(&mut self, config: &ProjectConfig) -> Result<()> {
        self.file.projects.insert(
            config.project_id.clone(),
            RegistryEntry {
                source_dir: config.source_dir.clone(),
                storage_dir: config.storage_dir.clone(),
                allowed_extensions: config.allowed_extensions.clone(),
                ignored: config.ignored.clone(),
                included: config.included.clone(),
            },
        );
        let text = toml::to_string_pretty(&self.file)
            .map_err(|e| Error::Config(format!("serialize registry: {e}")))?;
        crate::sync::write_atomic(&self.path, text.as_bytes())?;
        Ok(())
    }
}
