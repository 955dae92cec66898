use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::coordinator::SlotSpec;
use crate::models::{ScoringCategory, slot_label};
use crate::orchestrator::{JudgePolicy, JudgeSettings};
use crate::pricing::ModelPrice;
use crate::prompts::DEFAULT_SYSTEM_PROMPT;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Route everything through the credential-injecting proxy
    #[default]
    Proxy,
    /// Call an OpenAI-compatible provider directly
    Direct,
}

/// Where generations and judge calls are sent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: BackendMode,
    /// Proxy base URL (proxy mode)
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    /// Provider endpoint; forwarded as `baseURL` in proxy mode
    #[serde(default)]
    pub api_endpoint: Option<String>,
    /// Environment variable name containing the API key
    #[serde(default)]
    pub env_var_api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            proxy_url: default_proxy_url(),
            api_endpoint: None,
            env_var_api_key: None,
        }
    }
}

fn default_proxy_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_enabled() -> bool {
    true
}

/// One model column of every comparison
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlotConfig {
    pub model: String,
    /// Display name, defaults to "Model A", "Model B", ...
    #[serde(default)]
    pub label: Option<String>,
    /// Replaces the shared system prompt for this slot
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Defaults to the first slot's model
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Template with `{context}` and `{output_1}`, `{output_2}`, ... placeholders
    #[serde(default)]
    pub evaluation_prompt: Option<String>,
    #[serde(default)]
    pub policy: JudgePolicy,
    #[serde(default = "ScoringCategory::defaults")]
    pub categories: Vec<ScoringCategory>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            model: None,
            system_prompt: None,
            evaluation_prompt: None,
            policy: JudgePolicy::default(),
            categories: ScoringCategory::defaults(),
        }
    }
}

/// One comparison: a dataset description or a single column
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub name: String,
    pub prompt: String,
    /// Shown to the judge alongside the candidate outputs
    #[serde(default)]
    pub context: String,
}

/// Root configuration of a comparison run
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    pub slots: Vec<SlotConfig>,
    #[serde(default)]
    pub judge: JudgeConfig,
    pub targets: Vec<TargetConfig>,
    /// Extra or replacement prices for cost estimates
    #[serde(default)]
    pub pricing: Vec<ModelPrice>,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.slots.is_empty(), "at least one [[slots]] entry is required");
        ensure!(!self.targets.is_empty(), "at least one [[targets]] entry is required");

        for (index, slot) in self.slots.iter().enumerate() {
            ensure!(
                !slot.model.trim().is_empty(),
                "slot {} has an empty model name",
                slot_label(index)
            );
        }

        let mut keys = HashSet::new();
        for category in &self.judge.categories {
            ensure!(
                category.is_valid(),
                "scoring category '{}' has min {} above max {}",
                category.key,
                category.min_score,
                category.max_score
            );
            ensure!(
                keys.insert(category.key.as_str()),
                "duplicate scoring category '{}'",
                category.key
            );
        }

        if self.backend.mode == BackendMode::Direct {
            if self.backend.api_endpoint.is_none() {
                bail!("direct mode requires backend.api_endpoint");
            }
            if self.backend.env_var_api_key.is_none() {
                bail!("direct mode requires backend.env_var_api_key");
            }
        }
        Ok(())
    }

    pub fn slot_specs(&self) -> Vec<SlotSpec> {
        self.slots
            .iter()
            .map(|slot| SlotSpec {
                model: slot.model.clone(),
                system_prompt: slot.system_prompt.clone(),
            })
            .collect()
    }

    pub fn slot_labels(&self) -> Vec<String> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.label
                    .clone()
                    .unwrap_or_else(|| format!("Model {}", slot_label(index)))
            })
            .collect()
    }

    pub fn judge_settings(&self) -> JudgeSettings {
        JudgeSettings {
            enabled: self.judge.enabled,
            model: self.judge.model.clone().unwrap_or_default(),
            system_prompt: self.judge.system_prompt.clone(),
            evaluation_prompt: self.judge.evaluation_prompt.clone(),
            categories: self.judge.categories.clone(),
            policy: self.judge.policy,
        }
    }
}
