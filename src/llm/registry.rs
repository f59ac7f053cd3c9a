//! LLM configuration profiles and the stores that resolve them.

use crate::error::{Result, Text2SqlError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Local => "local",
        }
    }

    /// Environment variable consulted when a profile carries no API key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Local => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Text2SqlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "local" | "mock" => Ok(ProviderKind::Local),
            other => Err(Text2SqlError::Config(format!("unknown LLM provider '{}'", other))),
        }
    }
}

fn default_temperature() -> f32 {
    0.0
}

fn default_max_tokens() -> u32 {
    1024
}

/// Provider type, model name and credentials for one LLM configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProfile {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl fmt::Debug for LlmProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmProfile")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl LlmProfile {
    pub fn new(id: impl Into<String>, provider: ProviderKind, model: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider,
            model: model.into(),
            description: None,
            api_key: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }

    /// Offline profile backed by the deterministic mock provider.
    pub fn local() -> Self {
        let mut profile = Self::new("local", ProviderKind::Local, "mock");
        profile.name = "Local mock".to_string();
        profile.description = Some("Deterministic offline provider".to_string());
        profile
    }

    /// Configured key, else the provider's environment variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.provider.api_key_env().and_then(|var| std::env::var(var).ok()))
            .filter(|k| !k.trim().is_empty())
    }
}

/// Source of LLM configuration profiles.
pub trait LlmConfigStore: Send + Sync {
    fn list(&self) -> Vec<LlmProfile>;

    /// Looks up by id, then by provider name, then falls back to the first
    /// profile.
    fn get(&self, id: &str) -> Result<LlmProfile> {
        resolve_profile(&self.list(), id)
    }
}

pub fn resolve_profile(profiles: &[LlmProfile], id: &str) -> Result<LlmProfile> {
    profiles
        .iter()
        .find(|p| p.id == id)
        .or_else(|| profiles.iter().find(|p| p.provider.as_str() == id))
        .or_else(|| profiles.first())
        .cloned()
        .ok_or_else(|| Text2SqlError::LlmConfigNotFound(id.to_string()))
}

/// Profiles read from a JSON array on disk.
#[derive(Debug, Clone)]
pub struct FileLlmConfigStore {
    path: PathBuf,
    profiles: Vec<LlmProfile>,
}

impl FileLlmConfigStore {
    /// Loads `path`; a missing file yields the single local profile.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let profiles = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let profiles: Vec<LlmProfile> = serde_json::from_str(&content).map_err(|e| {
                Text2SqlError::Config(format!("invalid LLM config file {}: {}", path.display(), e))
            })?;
            info!("Loaded {} LLM profile(s) from {}", profiles.len(), path.display());
            profiles
        } else {
            warn!("LLM config file {} not found, using the local profile", path.display());
            vec![LlmProfile::local()]
        };
        Ok(Self { path, profiles })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LlmConfigStore for FileLlmConfigStore {
    fn list(&self) -> Vec<LlmProfile> {
        self.profiles.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLlmConfigStore {
    profiles: Vec<LlmProfile>,
}

impl InMemoryLlmConfigStore {
    pub fn new(profiles: Vec<LlmProfile>) -> Self {
        Self { profiles }
    }
}

impl LlmConfigStore for InMemoryLlmConfigStore {
    fn list(&self) -> Vec<LlmProfile> {
        self.profiles.clone()
    }
}
