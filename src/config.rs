use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Browser automation provider configuration
    pub automation: AutomationConfig,

    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Task executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Knowledge retrieval configuration
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub base_url: String,
    /// Base for the deterministic live-view embed fallback URL.
    #[serde(default = "default_embed_base")]
    pub embed_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are reaped by `close_expired`.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Bound on the direct-act stage.
    #[serde(default = "default_act_timeout")]
    pub act_timeout_secs: u64,
    /// Step cap for the autonomous agent fallback.
    #[serde(default = "default_agent_max_steps")]
    pub agent_max_steps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_embedding_model() -> String {
    "voyage-3-lite".to_string()
}

fn default_embed_base() -> String {
    "https://live.uxprobe.dev".to_string()
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_act_timeout() -> u64 {
    10
}

fn default_agent_max_steps() -> u32 {
    20
}

fn default_similarity_threshold() -> f32 {
    0.7
}

fn default_top_k() -> usize {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            act_timeout_secs: default_act_timeout(),
            agent_max_steps: default_agent_max_steps(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            top_k: default_top_k(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        info!(model = %config.llm.model, "configuration loaded");
        Ok(config)
    }
}
