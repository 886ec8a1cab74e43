use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::exchange::DEFAULT_EXCHANGE_LOG;
use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_CONFIG_FILE: &str = "bookgen.json";
pub const DEFAULT_BACKEND_NAME: &str = "ollama";

pub const DEFAULT_OLLAMA_HOST: &str = "localhost";
pub const DEFAULT_OLLAMA_PORT: &str = "11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

fn default_timeout() -> u64 {
    120
}

fn default_chapters() -> u32 {
    5
}

fn default_words_per_chapter() -> u32 {
    1000
}

fn default_language() -> String {
    "English".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_tolerance() -> f64 {
    0.9
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_delay_secs() -> u64 {
    20
}

fn default_outline_attempts() -> usize {
    3
}

fn default_exchange_log() -> String {
    DEFAULT_EXCHANGE_LOG.to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Ollama,
    #[serde(alias = "open_ai")]
    OpenAi,
}

impl BackendKind {
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAi => "openai",
        }
    }
}

/// One chat backend profile. Empty strings fall back to the kind's defaults.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Passed verbatim as the `options` object of an Ollama chat request.
    #[serde(default)]
    pub options: Option<Value>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_url: String::new(),
            api_key: String::new(),
            model_name: String::new(),
            temperature: None,
            max_tokens: None,
            timeout: default_timeout(),
            options: None,
        }
    }
}

impl BackendConfig {
    /// Ollama profile from `OLLAMA_BASE_URL`, or `OLLAMA_HOST` and `OLLAMA_PORT`, plus `OLLAMA_MODEL`.
    pub fn ollama_from_env() -> Self {
        Self::ollama_from_lookup(|key| env::var(key).ok())
    }

    pub fn ollama_from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let base_url = var("OLLAMA_BASE_URL").unwrap_or_else(|| {
            let host = var("OLLAMA_HOST").unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string());
            let port = var("OLLAMA_PORT").unwrap_or_else(|| DEFAULT_OLLAMA_PORT.to_string());
            format!("http://{host}:{port}")
        });

        Self {
            kind: BackendKind::Ollama,
            base_url,
            model_name: var("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
            ..Self::default()
        }
    }

    pub fn effective_base_url(&self) -> &str {
        if !self.base_url.trim().is_empty() {
            return self.base_url.trim();
        }
        match self.kind {
            BackendKind::Ollama => DEFAULT_OLLAMA_BASE_URL,
            BackendKind::OpenAi => DEFAULT_OPENAI_BASE_URL,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BookConfig {
    #[serde(default = "default_chapters")]
    pub chapters: u32,
    #[serde(default = "default_words_per_chapter")]
    pub words_per_chapter: u32,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            chapters: default_chapters(),
            words_per_chapter: default_words_per_chapter(),
            category: String::new(),
            topic: String::new(),
            language: default_language(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub max_continuations: Option<usize>,
    #[serde(default = "default_outline_attempts")]
    pub outline_attempts: usize,
    #[serde(default = "default_exchange_log")]
    pub exchange_log: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            max_continuations: None,
            outline_attempts: default_outline_attempts(),
            exchange_log: default_exchange_log(),
        }
    }
}

impl GenerationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            std::time::Duration::from_secs(self.retry_delay_secs),
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_backend: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub book: BookConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub recent: RecentUsage,
}

impl Config {
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }

    pub fn upsert_backend<S: Into<String>>(&mut self, name: S, profile: BackendConfig) {
        self.backends.insert(name.into(), profile);
    }

    /// Picks the named profile, else the last used one, else the first configured one.
    /// Without any profile the Ollama environment defaults are used.
    pub fn resolve_backend(&self, name: Option<&str>) -> Option<(String, BackendConfig)> {
        if let Some(name) = name {
            return self
                .backends
                .get(name)
                .map(|profile| (name.to_string(), profile.clone()));
        }

        let recent = self
            .recent
            .last_backend
            .as_deref()
            .and_then(|name| self.backends.get_key_value(name));
        match recent.or_else(|| self.backends.iter().next()) {
            Some((name, profile)) => Some((name.clone(), profile.clone())),
            None => Some((
                DEFAULT_BACKEND_NAME.to_string(),
                BackendConfig::ollama_from_env(),
            )),
        }
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };
        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config = if self.path.exists() {
            Config::from_path(&self.path)?
        } else {
            Config::default()
        };
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }

    pub fn touch_backend<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_backend = Some(name.into());
    }

    pub fn last_backend(&self) -> Option<&str> {
        self.config
            .recent
            .last_backend
            .as_deref()
            .filter(|name| self.config.backends.contains_key(*name))
    }
}
