use ledgerlabel_core::CategorySet;
use ledgerlabel_matching::{CategoryRule, CategoryRuleEngine, Exemplar, ExemplarSet, RuleError};
use ledgerlabel_remote::{ClientConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Rules(#[from] RuleError),
}

/// Everything the engine is handed at startup, read from one TOML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub categories: CategorySet,
    pub rules: Vec<CategoryRule>,
    pub exemplars: Vec<Exemplar>,
    pub matching: MatchingConfig,
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum fuzzy similarity (0–1) to accept an exemplar match.
    pub fuzzy_threshold: f32,
    /// Minimum remote confidence (0–1) to promote a result to an exemplar.
    pub promotion_threshold: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            promotion_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortMode {
    /// Let in-flight remote calls finish and keep their results.
    #[default]
    Drain,
    /// Abort in-flight remote calls.
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    #[serde(flatten)]
    pub client: ClientConfig,
    /// Maximum remote requests in flight at once.
    pub concurrency: usize,
    /// Transactions processed per window before promoted exemplars apply.
    pub batch_size: usize,
    pub on_abort: AbortMode,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            concurrency: 4,
            batch_size: 50,
            on_abort: AbortMode::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Jsonl,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    /// Where the cache lives; the binary picks a data-dir default when unset.
    pub path: Option<PathBuf>,
}

/// Knobs the orchestrator reads on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub fuzzy_threshold: f32,
    pub promotion_threshold: f32,
    pub concurrency: usize,
    pub batch_size: usize,
    pub on_abort: AbortMode,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        EngineConfig::default().settings()
    }
}

impl EngineConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within 0..=1, got {v}")))
            }
        };
        unit("matching.fuzzy_threshold", self.matching.fuzzy_threshold)?;
        unit("matching.promotion_threshold", self.matching.promotion_threshold)?;

        if self.categories.is_empty() {
            return Err(ConfigError::Invalid("categories must not be empty".into()));
        }
        if self.remote.concurrency == 0 {
            return Err(ConfigError::Invalid("remote.concurrency must be at least 1".into()));
        }
        if self.remote.batch_size == 0 {
            return Err(ConfigError::Invalid("remote.batch_size must be at least 1".into()));
        }
        let retry = &self.remote.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("remote.retry.max_attempts must be at least 1".into()));
        }
        if retry.backoff_cap_ms < retry.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "remote.retry.backoff_cap_ms must not be below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    /// Compiles the rule list; malformed rules fail here, before any run.
    pub fn rule_engine(&self) -> Result<CategoryRuleEngine, RuleError> {
        CategoryRuleEngine::new(self.rules.clone())
    }

    pub fn exemplar_set(&self) -> ExemplarSet {
        self.exemplars.iter().cloned().collect()
    }

    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            fuzzy_threshold: self.matching.fuzzy_threshold,
            promotion_threshold: self.matching.promotion_threshold,
            concurrency: self.remote.concurrency,
            batch_size: self.remote.batch_size,
            on_abort: self.remote.on_abort,
            retry: self.remote.retry.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.matching.fuzzy_threshold, 0.85);
        assert_eq!(config.remote.concurrency, 4);
        assert_eq!(config.remote.client.model, "gpt-4o-mini");
        assert_eq!(config.cache.backend, CacheBackendKind::Jsonl);
        assert!(config.categories.contains("Dining"));
    }

    #[test]
    fn full_document_parses() {
        let config = EngineConfig::from_toml(
            r#"
            categories = ["Dining", "Fuel", "Services"]

            [[rules]]
            pattern = "starbucks"
            category = "Dining"

            [[rules]]
            pattern = "^shell|chevron"
            match_type = "regex"
            category = "Fuel"
            vendor = "GAS STATION"

            [[exemplars]]
            description = "BLUE BOTTLE COFFEE"
            category = "Dining"

            [matching]
            fuzzy_threshold = 0.8
            promotion_threshold = 0.95

            [remote]
            endpoint = "http://localhost:8080/v1"
            model = "local-model"
            concurrency = 2
            batch_size = 10
            on_abort = "cancel"

            [remote.retry]
            max_attempts = 5
            backoff_base_ms = 10
            backoff_cap_ms = 100

            [cache]
            backend = "sqlite"
            path = "data/cache.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.categories.names().len(), 3);
        assert_eq!(config.rule_engine().unwrap().len(), 2);
        assert_eq!(config.exemplar_set().get("blue bottle coffee").unwrap().category, "Dining");
        assert_eq!(config.remote.client.endpoint, "http://localhost:8080/v1");
        assert_eq!(config.remote.client.api_key_env, "OPENAI_API_KEY");
        let settings = config.settings();
        assert_eq!(settings.concurrency, 2);
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.on_abort, AbortMode::Cancel);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.promotion_threshold, 0.95);
        assert_eq!(config.cache.backend, CacheBackendKind::Sqlite);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = EngineConfig::from_toml("[matching]\nfuzzy_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_concurrency_and_bad_backoff() {
        assert!(EngineConfig::from_toml("[remote]\nconcurrency = 0\n").is_err());
        assert!(EngineConfig::from_toml(
            "[remote.retry]\nbackoff_base_ms = 100\nbackoff_cap_ms = 10\n"
        )
        .is_err());
    }

    #[test]
    fn malformed_rule_fails_at_build() {
        let config = EngineConfig::from_toml(
            "[[rules]]\npattern = \"(\"\nmatch_type = \"regex\"\ncategory = \"Dining\"\n",
        )
        .unwrap();
        assert!(config.rule_engine().is_err());
    }
}
