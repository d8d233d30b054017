use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration loaded from `~/.config/inq/config.toml`.
///
/// Every field is optional and a missing file yields the defaults: a
/// missing API key must reach the research loop as a recoverable
/// condition, not abort startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gemini: GeminiEntry,

    #[serde(default)]
    pub search: SearchEntry,

    #[serde(default)]
    pub agent: AgentEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeminiEntry {
    /// API key; falls back to the GOOGLE_API_KEY environment variable.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Primary model.
    #[serde(default)]
    pub model: Option<String>,

    /// Models tried in order when the primary fails with a retryable error.
    #[serde(default)]
    pub fallback_models: Vec<String>,

    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchEntry {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentEntry {
    /// Upper bound on generation steps per run.
    #[serde(default)]
    pub max_steps: Option<usize>,

    /// Fixed delay before each generation call, in milliseconds.
    #[serde(default)]
    pub pace_ms: Option<u64>,

    /// Replaces the built-in research system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("inq").join("config.toml"))
    }

    /// Resolve the generation credential: config file first, then the
    /// process environment. `None` is a recoverable condition handled by
    /// the loop.
    pub fn resolve_api_key(&self, env_key: Option<String>) -> Option<String> {
        self.gemini
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or(env_key.filter(|k| !k.is_empty()))
    }

    /// Model priority list for the loop: primary model followed by the
    /// configured fallbacks. Empty means the provider default.
    pub fn model_priority(&self, override_model: Option<String>) -> Vec<String> {
        let mut models = Vec::new();
        if let Some(model) = override_model.or_else(|| self.gemini.model.clone()) {
            models.push(model);
        }
        models.extend(self.gemini.fallback_models.iter().cloned());
        models
    }
}
