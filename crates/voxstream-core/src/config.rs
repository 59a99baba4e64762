use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Model name that means "let the service pick"; never sent on the wire.
pub const DEFAULT_MODEL: &str = "default";

pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub engine: EngineSelection,

    #[serde(default)]
    pub google: GoogleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSelection {
    #[serde(default = "default_engine_name")]
    pub name: String,
}

impl Default for EngineSelection {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
        }
    }
}

/// Engine-wide defaults for Google sessions. Immutable once loaded.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GoogleConfig {
    #[serde(default = "default_language_code")]
    pub language_code: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub enable_automatic_punctuation: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_key_path: Option<String>,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_finish_timeout_ms")]
    pub finish_timeout_ms: u64,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            language_code: default_language_code(),
            model: default_model(),
            enable_automatic_punctuation: false,
            service_account_key_path: None,
            endpoint: default_endpoint(),
            open_timeout_ms: default_open_timeout_ms(),
            finish_timeout_ms: default_finish_timeout_ms(),
        }
    }
}

impl GoogleConfig {
    /// Key path, with an empty string treated as "not configured".
    pub fn key_path(&self) -> Option<PathBuf> {
        self.service_account_key_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_engine_name() -> String {
    "google".to_string()
}

fn default_language_code() -> String {
    "en-US".to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_endpoint() -> String {
    "https://speech.googleapis.com".to_string()
}

fn default_open_timeout_ms() -> u64 {
    10_000
}

fn default_finish_timeout_ms() -> u64 {
    5_000
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"))
}

/// Interpolate `${VAR}` patterns with environment variable values.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = input.to_string();

    for cap in env_var_pattern().captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
        }
    }

    Ok(result)
}

impl AppConfig {
    /// Load configuration from a TOML file, with environment variable interpolation.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(s)?;
        let config: AppConfig = toml::from_str(&interpolated)?;
        if config.google.model.is_empty() {
            tracing::debug!("empty model configured, service default will be used");
        }
        Ok(config)
    }
}
