//! Codex companion-worker invocation and event protocol.
//!
//! This backend does not drive a CLI directly: it spawns a long-lived
//! worker process that wraps the Codex agent SDK. The worker takes one
//! JSON request line on stdin, streams `thread.*` / `turn.*` / `item.*`
//! events on stdout, and accepts permission responses on the same stdin
//! channel.

use std::collections::HashMap;
use std::process::Stdio;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::backend::{PermissionMode, QueryRequest};

/// Configuration for the Codex adapter.
#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub worker_path: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            worker_path: std::env::var("CODEX_WORKER_PATH")
                .unwrap_or_else(|_| "codex-worker".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            default_model: None,
        }
    }
}

/// Build the worker invocation. The worker takes no flags; everything it
/// needs arrives as the first stdin line.
pub(crate) fn build_command(config: &CodexConfig, request: &QueryRequest) -> Command {
    let mut cmd = Command::new(&config.worker_path);
    cmd.current_dir(&request.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(ref key) = config.api_key {
        cmd.env("OPENAI_API_KEY", key);
    }
    cmd
}

/// The worker's query request: one JSON object on one line. Field names
/// are part of the worker protocol and must stay stable.
pub(crate) fn query_request_line(config: &CodexConfig, request: &QueryRequest) -> String {
    let mut map = Map::new();
    map.insert("type".to_string(), Value::String("query".to_string()));
    map.insert(
        "prompt".to_string(),
        Value::String(request.prompt.clone()),
    );
    map.insert("cwd".to_string(), Value::String(request.cwd.clone()));
    if let Some(token) = request.resume.as_deref() {
        map.insert("threadId".to_string(), Value::String(token.to_string()));
    }
    if let Some(model) = request
        .model
        .as_deref()
        .or(config.default_model.as_deref())
    {
        map.insert("model".to_string(), Value::String(model.to_string()));
    }
    map.insert(
        "autoApprove".to_string(),
        Value::Bool(request.permission_mode == PermissionMode::Auto),
    );
    if !request.allowed_tools.is_empty() {
        map.insert(
            "allowedTools".to_string(),
            Value::Array(
                request
                    .allowed_tools
                    .iter()
                    .map(|name| Value::String(name.clone()))
                    .collect(),
            ),
        );
    }
    // The worker takes no flags, so the backend-specific option bag rides
    // along in the request object. Protocol keys win on collision.
    for (key, value) in &request.backend_options {
        if !map.contains_key(key) {
            map.insert(key.clone(), value.clone());
        }
    }
    Value::Object(map).to_string()
}

// ── Worker event types ────────────────────────────────────────────

/// Events emitted by the Codex worker, one JSON object per line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        thread_id: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
    },

    #[serde(rename = "turn.started")]
    TurnStarted,

    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        summary: Option<String>,
    },

    #[serde(rename = "turn.failed")]
    TurnFailed { error: ErrorInfo },

    #[serde(rename = "item.created")]
    ItemCreated { item: Item },

    #[serde(rename = "item.updated")]
    ItemUpdated { item: Item },

    #[serde(rename = "item.completed")]
    ItemCompleted { item: Item },

    #[serde(rename = "permission_request")]
    PermissionRequest {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "error")]
    Error { message: String },

    // Catch-all for unknown event types
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(flatten)]
    pub data: HashMap<String, Value>,
}
