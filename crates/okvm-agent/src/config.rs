use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Endpoint settings for an OpenAI chat-completions compatible model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Base URL without the `/v1/...` suffix.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Falls back to the `OKVM_API_KEY` environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            api_base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl ModelConfig {
    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or("https://api.openai.com")
    }

    /// The configured key, or `OKVM_API_KEY` from the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OKVM_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

/// Limits and prompt for the turn executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Tool calls dispatched per turn before further requests are refused.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,
    /// Hard deadline for the whole turn; hitting it interrupts the turn.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

fn default_system_prompt() -> String {
    "You are an autonomous assistant working inside a private, sandboxed workspace. \
     Use the available tools to inspect and change files there, and explain what you did."
        .to_string()
}

fn default_max_tool_calls() -> usize {
    16
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_model_timeout_secs() -> u64 {
    120
}

fn default_turn_timeout_secs() -> u64 {
    600
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_tool_calls: default_max_tool_calls(),
            tool_timeout_secs: default_tool_timeout_secs(),
            model_timeout_secs: default_model_timeout_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

impl ExecutorConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_defaults() {
        let cfg: ExecutorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_tool_calls, 16);
        assert_eq!(cfg.tool_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.model_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.turn_timeout(), Duration::from_secs(600));
        assert!(!cfg.system_prompt.is_empty());
    }

    #[test]
    fn test_base_url_trims_slash() {
        let cfg = ModelConfig {
            api_base_url: Some("http://localhost:11434/".into()),
            ..ModelConfig::default()
        };
        assert_eq!(cfg.base_url(), "http://localhost:11434");
        assert_eq!(ModelConfig::default().base_url(), "https://api.openai.com");
    }

    #[test]
    fn test_explicit_key_wins() {
        let cfg = ModelConfig {
            api_key: Some("sk-test".into()),
            ..ModelConfig::default()
        };
        assert_eq!(cfg.resolved_api_key().as_deref(), Some("sk-test"));
    }
}
