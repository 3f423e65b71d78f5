// Configuration Storage Service
// Reads and writes config.json (detection defaults, LLM limits, provider URLs, API keys)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub version: String,
    /// `name[:model]` judge for requests that name no providers.
    pub default_provider: Option<String>,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionConfig {
    #[serde(default = "default_sensitivity")]
    pub sensitivity: String,
    #[serde(default = "default_true")]
    pub use_perplexity: bool,
    #[serde(default = "default_true")]
    pub use_stylometry: bool,
    /// `None` defers to the sensitivity profile.
    #[serde(default)]
    pub chunk_size_tokens: Option<usize>,
    #[serde(default)]
    pub overlap_tokens: Option<usize>,
    #[serde(default = "default_batch_parallel")]
    pub batch_parallel: usize,
    #[serde(default)]
    pub strict_judgment: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            use_perplexity: true,
            use_stylometry: true,
            chunk_size_tokens: None,
            overlap_tokens: None,
            batch_parallel: default_batch_parallel(),
            strict_judgment: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_model")]
    pub planner_model: String,
    #[serde(default = "default_model")]
    pub judgment_model: String,
    #[serde(default = "default_planner_max_tokens")]
    pub planner_max_tokens: u32,
    #[serde(default = "default_judgment_max_tokens")]
    pub judgment_max_tokens: u32,
    /// Accept constant judgments and re-spread flat ones by sentence-length rank.
    #[serde(default)]
    pub respread_flat_judgment: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            planner_model: default_model(),
            judgment_model: default_model(),
            planner_max_tokens: default_planner_max_tokens(),
            judgment_max_tokens: default_judgment_max_tokens(),
            respread_flat_judgment: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Judge model when this provider is the default judge.
    pub model: Option<String>,
    pub base_url: Option<String>,
}

fn default_sensitivity() -> String { "medium".to_string() }
fn default_true() -> bool { true }
fn default_batch_parallel() -> usize { 4 }
fn default_timeout_secs() -> u64 { 80 }
fn default_model() -> String { "glm-4.6".to_string() }
fn default_planner_max_tokens() -> u32 { 1600 }
fn default_judgment_max_tokens() -> u32 { 4096 }

#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cheekAI"))
    }

    /// Store at the default location, if the platform has one.
    pub fn open_default() -> Option<Self> {
        Self::default_config_dir().map(Self::new)
    }

    /// Load configuration; a missing file yields defaults.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        if !self.config_file.exists() {
            return Ok(AppConfig::default());
        }
        let content = fs::read_to_string(&self.config_file)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir)?;
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    pub fn get_api_key(&self, provider: &str) -> Result<Option<String>, ConfigError> {
        let config = self.load()?;
        Ok(config
            .api_keys
            .get(provider)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty()))
    }

    pub fn set_api_key(&self, provider: &str, key: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.api_keys.insert(provider.to_string(), key.to_string());
        self.save(&config)
    }

    pub fn delete_api_key(&self, provider: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.api_keys.remove(provider);
        self.save(&config)
    }

    pub fn get_provider_url(&self, provider: &str) -> Result<Option<String>, ConfigError> {
        let config = self.load()?;
        Ok(config.providers.get(provider).and_then(|p| p.base_url.clone()))
    }

    pub fn set_provider_url(&self, provider: &str, url: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        let provider_config = config.providers.entry(provider.to_string()).or_default();
        provider_config.base_url = Some(url.to_string());
        self.save(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (ConfigStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("cheekai-config-{}", uuid::Uuid::new_v4()));
        (ConfigStore::new(dir.clone()), dir)
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.detection.sensitivity, "medium");
        assert!(config.detection.use_perplexity);
        assert_eq!(config.detection.batch_parallel, 4);
        assert_eq!(config.llm.timeout_secs, 80);
        assert_eq!(config.llm.planner_model, "glm-4.6");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let parsed: AppConfig =
            serde_json::from_str(r#"{"detection":{"sensitivity":"high"},"llm":{"timeoutSecs":5}}"#).unwrap();
        assert_eq!(parsed.detection.sensitivity, "high");
        assert!(parsed.detection.use_stylometry);
        assert_eq!(parsed.llm.timeout_secs, 5);
        assert_eq!(parsed.llm.judgment_max_tokens, 4096);
        assert!(!parsed.llm.respread_flat_judgment);
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let (store, _dir) = temp_store();
        let config = store.load().unwrap();
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn test_api_key_and_url_round_trip() {
        let (store, dir) = temp_store();
        store.set_api_key("glm", " secret ").unwrap();
        assert_eq!(store.get_api_key("glm").unwrap().as_deref(), Some("secret"));
        store.set_provider_url("glm", "http://localhost:9/v1").unwrap();
        assert_eq!(
            store.get_provider_url("glm").unwrap().as_deref(),
            Some("http://localhost:9/v1")
        );
        store.delete_api_key("glm").unwrap();
        assert!(store.get_api_key("glm").unwrap().is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (store, dir) = temp_store();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), "{not json").unwrap();
        assert!(matches!(store.load(), Err(ConfigError::Json(_))));
        let _ = fs::remove_dir_all(dir);
    }
}
