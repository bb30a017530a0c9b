//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/relay.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [retrieval]
//! vector_threshold = 0.35
//!
//! [personas.support]
//! final_k = 5
//! rerank_enabled = false
//! ```
//!
//! Persona sections are partial: any field left out falls back to
//! `[retrieval]`. Out-of-range retrieval numbers are accepted here and
//! clamped when a persona is resolved.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use context_relay_core::config::RetrievalConfig;
use context_relay_core::store::PersonaConfigProvider;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub personas: BTreeMap<String, toml::Table>,
    #[serde(default)]
    pub stages: StageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Persona used by `new_conversation` when none is given.
    #[serde(default = "default_persona")]
    pub default_persona: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_persona: default_persona(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}
fn default_persona() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL; defaults to the provider's public endpoint.
    #[serde(default)]
    pub url: Option<String>,
    /// Retries on 429/5xx within a single stage deadline.
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            max_retries: default_llm_retries(),
            temperature: 0.0,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_llm_retries() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    30
}

/// Per-stage deadlines in milliseconds.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct StageConfig {
    pub recognition_ms: u64,
    pub rewriting_ms: u64,
    pub hyde_ms: u64,
    pub rerank_ms: u64,
    /// One lexical or vector search call, including its retry.
    pub search_ms: u64,
    pub graph_ms: u64,
    /// Overall query budget; the graph-term pass is skipped past it.
    pub budget_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            recognition_ms: 2000,
            rewriting_ms: 1000,
            hyde_ms: 1500,
            rerank_ms: 1500,
            search_ms: 3000,
            graph_ms: 1500,
            budget_ms: 6000,
        }
    }
}

impl StageConfig {
    pub fn recognition(&self) -> Duration {
        Duration::from_millis(self.recognition_ms)
    }
    pub fn rewriting(&self) -> Duration {
        Duration::from_millis(self.rewriting_ms)
    }
    pub fn hyde(&self) -> Duration {
        Duration::from_millis(self.hyde_ms)
    }
    pub fn rerank(&self) -> Duration {
        Duration::from_millis(self.rerank_ms)
    }
    pub fn search(&self) -> Duration {
        Duration::from_millis(self.search_ms)
    }
    pub fn graph(&self) -> Duration {
        Duration::from_millis(self.graph_ms)
    }
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60,
            max_entries: 512,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// `log`, `sqlite` or `disabled`.
    pub sink: String,
    /// Channel capacity of the background sqlite writer.
    pub buffer: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            sink: "log".to_string(),
            buffer: 1024,
        }
    }
}

impl Config {
    /// Minimal config pointing at `db_path`, everything else defaulted.
    pub fn with_db(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            personas: BTreeMap::new(),
            stages: StageConfig::default(),
            cache: CacheConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }

    /// Layer every `[personas.<id>]` table over `[retrieval]`.
    pub fn resolve_personas(&self) -> Result<HashMap<String, RetrievalConfig>> {
        let base = toml::Value::try_from(&self.retrieval)
            .context("Failed to serialize retrieval defaults")?;
        let mut resolved = HashMap::new();
        for (id, overrides) in &self.personas {
            let mut merged = base.clone();
            if let toml::Value::Table(table) = &mut merged {
                for (key, value) in overrides {
                    table.insert(key.clone(), value.clone());
                }
            }
            let cfg: RetrievalConfig = merged
                .try_into()
                .with_context(|| format!("Invalid [personas.{}] section", id))?;
            resolved.insert(id.clone(), cfg);
        }
        Ok(resolved)
    }
}

fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    for (label, provider) in [
        ("embedding", config.embedding.provider.as_str()),
        ("llm", config.llm.provider.as_str()),
    ] {
        match provider {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown {} provider: '{}'. Must be disabled, openai, or ollama.",
                label,
                other
            ),
        }
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if config.llm.is_enabled() && config.llm.model.is_none() {
        bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }

    match config.analytics.sink.as_str() {
        "log" | "sqlite" | "disabled" => {}
        other => bail!(
            "Unknown analytics sink: '{}'. Must be log, sqlite, or disabled.",
            other
        ),
    }

    if config.stages.budget_ms == 0 {
        bail!("stages.budget_ms must be > 0");
    }

    // Surface bad persona sections at load time rather than per query.
    config.resolve_personas()?;

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Persona configs resolved from `[retrieval]` and `[personas.*]`.
///
/// Unknown personas get the `[retrieval]` defaults.
pub struct ConfigPersonas {
    defaults: RetrievalConfig,
    personas: HashMap<String, RetrievalConfig>,
}

impl ConfigPersonas {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            defaults: config.retrieval.clone(),
            personas: config.resolve_personas()?,
        })
    }
}

#[async_trait]
impl PersonaConfigProvider for ConfigPersonas {
    async fn retrieval_config(&self, persona_id: &str) -> Result<RetrievalConfig> {
        match self.personas.get(persona_id) {
            Some(cfg) => Ok(cfg.clone()),
            None => {
                debug!(persona = persona_id, "no persona section, using [retrieval] defaults");
                Ok(self.defaults.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [db]
        path = "./data/relay.sqlite"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7341");
        assert_eq!(config.retrieval, RetrievalConfig::default());
        assert_eq!(config.stages.recognition_ms, 2000);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.analytics.sink, "log");
        assert!(!config.llm.is_enabled());
    }

    #[test]
    fn persona_sections_override_retrieval() {
        let config = parse_config(
            r#"
            [db]
            path = "x.sqlite"

            [retrieval]
            final_k = 10

            [personas.support]
            final_k = 4
            rerank_enabled = false
            "#,
        )
        .unwrap();
        let personas = config.resolve_personas().unwrap();
        let support = &personas["support"];
        assert_eq!(support.final_k, 4);
        assert!(!support.rerank_enabled);
        assert_eq!(support.decay_factor, 0.7);
        assert_eq!(config.retrieval.final_k, 10);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = parse_config(
            r#"
            [db]
            path = "x.sqlite"
            [llm]
            provider = "mystery"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown llm provider"));
    }

    #[test]
    fn enabled_embedding_requires_dims() {
        let err = parse_config(
            r#"
            [db]
            path = "x.sqlite"
            [embedding]
            provider = "openai"
            model = "text-embedding-3-small"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn out_of_range_values_load_fine() {
        let config = parse_config(
            r#"
            [db]
            path = "x.sqlite"
            [retrieval]
            vector_threshold = 3.0
            "#,
        )
        .unwrap();
        assert_eq!(config.retrieval.vector_threshold, 3.0);
        assert_eq!(config.retrieval.sanitized().vector_threshold, 1.0);
    }

    #[test]
    fn example_config_parses() {
        let config = parse_config(include_str!("../config/relay.example.toml")).unwrap();
        assert_eq!(config.embedding.dims, Some(768));
        assert_eq!(config.stages.budget_ms, 6000);
        let personas = config.resolve_personas().unwrap();
        assert_eq!(personas["research"].final_k, 12);
        assert_eq!(personas["research"].decay_factor, 0.7);
    }

    #[tokio::test]
    async fn unknown_persona_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        let personas = ConfigPersonas::from_config(&config).unwrap();
        let cfg = personas.retrieval_config("nobody").await.unwrap();
        assert_eq!(cfg, RetrievalConfig::default());
    }
}
