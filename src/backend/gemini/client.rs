//! Gemini CLI invocation.
//!
//! Unlike the other backends, Gemini takes the prompt as an argument and
//! has no stdin control channel; approval is decided at spawn time.

use std::process::Stdio;

use tokio::process::Command;
use tracing::warn;

use crate::backend::shared::apply_backend_options;
use crate::backend::{PermissionMode, QueryRequest};

/// Configuration for the Gemini adapter.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub cli_path: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("GEMINI_CLI_PATH").unwrap_or_else(|_| "gemini".to_string()),
            api_key: std::env::var("GEMINI_API_KEY").ok(),
            default_model: None,
        }
    }
}

/// Build the CLI invocation for one query. Flag names are part of the
/// adapter's stable surface.
pub(crate) fn build_command(config: &GeminiConfig, request: &QueryRequest) -> Command {
    let mut cmd = Command::new(&config.cli_path);
    cmd.current_dir(&request.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .arg("--output-format")
        .arg("stream-json")
        .arg("--prompt")
        .arg(&request.prompt);

    match request.permission_mode {
        PermissionMode::Auto => {
            cmd.arg("--yolo");
        }
        // No interactive callback protocol; Confirm and Deny both defer to
        // the CLI's non-interactive default.
        PermissionMode::Confirm | PermissionMode::Deny => {}
    }

    if !request.allowed_tools.is_empty() {
        cmd.arg("--allowed-tools")
            .arg(request.allowed_tools.join(","));
    }

    if let Some(ref key) = config.api_key {
        cmd.env("GEMINI_API_KEY", key);
    }

    let model = request.model.as_deref().or(config.default_model.as_deref());
    if let Some(m) = model {
        cmd.arg("--model").arg(m);
    }

    if request.resume.is_some() {
        warn!("Gemini CLI cannot resume a prior conversation; ignoring resume token");
    }

    apply_backend_options(&mut cmd, &request.backend_options);
    cmd
}
