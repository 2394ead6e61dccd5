//! Configuration management for agentmux.
//!
//! Configuration can be set via environment variables:
//! - `CLAUDE_CLI_PATH` - Optional. Path to the Claude Code CLI. Defaults to `claude`.
//! - `ANTHROPIC_API_KEY` - Optional. API key passed to the Claude CLI.
//! - `CLAUDE_CODE_OAUTH_TOKEN` - Set automatically when the key above is an OAuth token (`sk-ant-oat...`).
//! - `GEMINI_CLI_PATH` - Optional. Path to the Gemini CLI. Defaults to `gemini`.
//! - `GEMINI_API_KEY` - Optional. API key passed to the Gemini CLI.
//! - `CODEX_WORKER_PATH` - Optional. Path to the Codex companion worker. Defaults to `codex-worker`.
//! - `OPENAI_API_KEY` - Optional. API key passed to the Codex worker.
//! - `RUST_LOG` - Optional. Tracing filter, read by the binary only.

use thiserror::Error;

use crate::backend::claude::ClaudeConfig;
use crate::backend::codex::CodexConfig;
use crate::backend::gemini::GeminiConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Top-level configuration: one section per backend adapter.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub claude: ClaudeConfig,
    pub gemini: GeminiConfig,
    pub codex: CodexConfig,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        for var in ["CLAUDE_CLI_PATH", "GEMINI_CLI_PATH", "CODEX_WORKER_PATH"] {
            if let Ok(value) = std::env::var(var) {
                if value.trim().is_empty() {
                    return Err(ConfigError::InvalidValue(
                        var.to_string(),
                        "path must not be empty".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            claude: ClaudeConfig::default(),
            gemini: GeminiConfig::default(),
            codex: CodexConfig::default(),
        })
    }
}
