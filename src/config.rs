//! Configuration management for Critic
//!
//! Handles model endpoint selection, conversation limits and persistence of
//! user preferences.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::llm::GenerationParams;

/// Default instruction sent as the first message of every prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a Senior Software Engineer acting as a Code Reviewer.
Your goal is to improve code quality, security, and performance.

When reviewing code:
1. Identify critical bugs or security risks first.
2. If you suggest a code fix, use a \"git diff\" style format in a code block.
   - Use \"-\" for lines to remove.
   - Use \"+\" for lines to add.
   - Keep unchanged context lines around the changes.
3. Be concise.
4. Use Markdown for all code snippets.";

/// Model endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`)
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    /// Maximum output tokens per reply
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.cloudflare.com/client/v4/accounts/ACCOUNT_ID/ai/v1".to_string(),
            model: "@cf/meta/llama-3.3-70b-instruct-fp8-fast".to_string(),
            api_key_env: "CRITIC_API_KEY".to_string(),
            max_tokens: 2500,
            temperature: 0.7,
        }
    }
}

impl ModelConfig {
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Conversation limits and prompt text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum history entries kept per session (oldest dropped first)
    pub history_cap: usize,
    /// Messages longer than this (in chars) that look like code replace the subject
    pub subject_threshold: usize,
    /// Override for the reviewer instruction
    pub system_prompt: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_cap: 6,
            subject_threshold: 200,
            system_prompt: None,
        }
    }
}

impl SessionConfig {
    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8787 }
    }
}

/// Critic configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Version of config schema (for future migrations)
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            model: ModelConfig::default(),
            session: SessionConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Get the config file path (~/.critic/config.toml)
    pub fn path() -> Result<PathBuf> {
        Ok(critic_dir()?.join("config.toml"))
    }

    /// Load config from disk, or return None if it doesn't exist
    pub fn load() -> Result<Option<Self>> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .context("Failed to read config file")?;
        Self::parse(&content).map(Some)
    }

    /// Load config from disk, falling back to defaults on first run
    pub fn load_or_default() -> Result<Self> {
        Ok(Self::load()?.unwrap_or_default())
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;

        // Ensure directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(&path, content)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// Get the data directory path (~/.critic/data)
pub fn data_dir() -> Result<PathBuf> {
    Ok(critic_dir()?.join("data"))
}

/// Get the base critic directory path (~/.critic)
pub fn critic_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".critic"))
}
