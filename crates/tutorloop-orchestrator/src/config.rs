//! Configuration for the Tutorloop orchestrator.
//!
//! Settings are read from `tutorloop.json` (camelCase keys). A missing file
//! yields the defaults; a present but malformed file is an error.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorError};
use crate::llm::MAX_BUDGET;

/// The default config file name.
pub const CONFIG_FILE_NAME: &str = "tutorloop.json";

fn default_proxy_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_engine() -> String {
    "default".to_string()
}

/// Default per-request time budget in seconds.
const fn default_request_budget_secs() -> u64 {
    180
}

/// Default maximum age of a cached hint: seven days.
const fn default_hint_cache_max_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

/// Default idle time before a chat's session leaves memory: one hour.
const fn default_session_idle_secs() -> u64 {
    60 * 60
}

fn default_catalog_dir() -> String {
    "catalog".to_string()
}

fn default_routing_subject() -> String {
    "math".to_string()
}

const fn default_port() -> u16 {
    3000
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Base URL of the LLM proxy.
    #[serde(default = "default_proxy_base_url")]
    pub proxy_base_url: String,

    /// Engine name sent with every proxy call and used in cache keys.
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Time budget for one inbound event, in seconds.
    #[serde(default = "default_request_budget_secs")]
    pub request_budget_secs: u64,

    /// Cached hints older than this are ignored, in seconds.
    #[serde(default = "default_hint_cache_max_age_secs")]
    pub hint_cache_max_age_secs: u64,

    /// Sessions idle longer than this are dropped from memory, in seconds.
    /// They are restored from the repository on the chat's next event.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,

    /// Directory holding the template catalog.
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: String,

    /// Subject domain routed against the template catalog.
    #[serde(default = "default_routing_subject")]
    pub routing_subject: String,

    /// HTTP port of the event API.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_base_url: default_proxy_base_url(),
            engine: default_engine(),
            request_budget_secs: default_request_budget_secs(),
            hint_cache_max_age_secs: default_hint_cache_max_age_secs(),
            session_idle_secs: default_session_idle_secs(),
            catalog_dir: default_catalog_dir(),
            routing_subject: default_routing_subject(),
            port: default_port(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `tutorloop.json` exists but is invalid.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            TutorError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads `tutorloop.json` from a specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigParseError` if the file cannot be read or
    /// is not valid JSON, and `TutorError::ConfigValidationError` if a value
    /// is out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(TutorError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| TutorError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigValidationError` naming the first bad key.
    pub fn validate(&self) -> Result<()> {
        if self.request_budget_secs == 0 {
            return Err(TutorError::config_validation(
                "requestBudgetSecs must be greater than 0",
                "Set requestBudgetSecs to at least 1 in your tutorloop.json",
            ));
        }

        if self.request_budget_secs > MAX_BUDGET.as_secs() {
            return Err(TutorError::config_validation(
                format!(
                    "requestBudgetSecs must be at most {}",
                    MAX_BUDGET.as_secs()
                ),
                "Lower requestBudgetSecs in your tutorloop.json; a few minutes is typical",
            ));
        }

        if self.hint_cache_max_age_secs == 0 {
            return Err(TutorError::config_validation(
                "hintCacheMaxAgeSecs must be greater than 0",
                "Set hintCacheMaxAgeSecs to at least 1 in your tutorloop.json",
            ));
        }

        if self.session_idle_secs == 0 {
            return Err(TutorError::config_validation(
                "sessionIdleSecs must be greater than 0",
                "Set sessionIdleSecs to at least 1 in your tutorloop.json",
            ));
        }

        if self.engine.trim().is_empty() {
            return Err(TutorError::config_validation(
                "engine must not be empty",
                "Provide the proxy engine name in your tutorloop.json",
            ));
        }

        if self.proxy_base_url.trim().is_empty() {
            return Err(TutorError::config_validation(
                "proxyBaseUrl must not be empty",
                "Provide the LLM proxy URL in your tutorloop.json, e.g. http://127.0.0.1:8080",
            ));
        }

        if self.catalog_dir.trim().is_empty() {
            return Err(TutorError::config_validation(
                "catalogDir must not be empty",
                "Provide the template catalog directory in your tutorloop.json",
            ));
        }

        Ok(())
    }

    /// The per-event time budget.
    #[must_use]
    pub const fn request_budget(&self) -> Duration {
        Duration::from_secs(self.request_budget_secs)
    }

    /// The maximum age of a usable cached hint.
    #[must_use]
    pub const fn hint_max_age(&self) -> Duration {
        Duration::from_secs(self.hint_cache_max_age_secs)
    }

    /// How long an untouched session stays in memory.
    #[must_use]
    pub const fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("tutorloop-config-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.proxy_base_url, "http://127.0.0.1:8080");
        assert_eq!(config.engine, "default");
        assert_eq!(config.request_budget(), Duration::from_secs(180));
        assert_eq!(config.hint_max_age(), Duration::from_secs(604_800));
        assert_eq!(config.session_idle(), Duration::from_secs(3600));
        assert_eq!(config.catalog_dir, "catalog");
        assert_eq!(config.routing_subject, "math");
        assert_eq!(config.port, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = temp_dir("missing");
        let config = Config::load_from_dir(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = temp_dir("partial");
        std::fs::write(
            dir.join(CONFIG_FILE_NAME),
            r#"{"engine":"gpt-vision","requestBudgetSecs":30}"#,
        )
        .unwrap();
        let config = Config::load_from_dir(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(config.engine, "gpt-vision");
        assert_eq!(config.request_budget_secs, 30);
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let dir = temp_dir("invalid");
        std::fs::write(dir.join(CONFIG_FILE_NAME), "{ not json").unwrap();
        let err = Config::load_from_dir(&dir).unwrap_err();
        std::fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(err, TutorError::ConfigParseError { .. }));
    }

    #[test]
    fn test_validation_rejects_zero_budget() {
        let config = Config {
            request_budget_secs: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("requestBudgetSecs"));
    }

    #[test]
    fn test_validation_rejects_oversized_budget() {
        let config = Config {
            request_budget_secs: u64::MAX,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at most"));
    }

    #[test]
    fn test_validation_rejects_zero_session_idle() {
        let config = Config {
            session_idle_secs: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sessionIdleSecs"));
    }

    #[test]
    fn test_validation_rejects_empty_engine() {
        let config = Config {
            engine: "  ".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            TutorError::ConfigValidationError { .. }
        ));
    }
}
