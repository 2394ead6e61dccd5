//! Claude Code CLI invocation and NDJSON protocol types.

use std::process::Stdio;

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::backend::shared::apply_backend_options;
use crate::backend::{PermissionMode, QueryRequest};

/// Configuration for the Claude Code adapter.
#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub cli_path: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("CLAUDE_CLI_PATH").unwrap_or_else(|_| "claude".to_string()),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            default_model: None,
        }
    }
}

/// Build the CLI invocation for one query. Flag names are part of the
/// adapter's stable surface.
pub(crate) fn build_command(config: &ClaudeConfig, request: &QueryRequest) -> Command {
    let mut cmd = Command::new(&config.cli_path);
    cmd.current_dir(&request.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .arg("--print")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose");

    match request.permission_mode {
        PermissionMode::Auto => {
            cmd.arg("--dangerously-skip-permissions");
        }
        PermissionMode::Confirm => {
            // Permission requests arrive on stdout; answers go back on stdin.
            cmd.arg("--permission-prompt-tool").arg("stdio");
        }
        // No flag: the CLI's own non-interactive default refuses
        // unapproved tools.
        PermissionMode::Deny => {}
    }

    if !request.allowed_tools.is_empty() {
        cmd.arg("--allowedTools").arg(request.allowed_tools.join(","));
    }

    // OAuth tokens ("sk-ant-oat...") use CLAUDE_CODE_OAUTH_TOKEN; regular
    // API keys use ANTHROPIC_API_KEY.
    if let Some(ref key) = config.api_key {
        if key.starts_with("sk-ant-oat") {
            cmd.env("CLAUDE_CODE_OAUTH_TOKEN", key);
        } else {
            cmd.env("ANTHROPIC_API_KEY", key);
        }
    }

    // The CLI expects bare model IDs, not provider-prefixed ones.
    let model = request.model.as_deref().or(config.default_model.as_deref());
    if let Some(m) = model {
        let bare = m.strip_prefix("anthropic/").unwrap_or(m);
        cmd.arg("--model").arg(bare);
    }

    match request.resume {
        Some(ref token) => {
            cmd.arg("--resume").arg(token);
        }
        None => {
            cmd.arg("--session-id").arg(&request.session_id);
        }
    }

    apply_backend_options(&mut cmd, &request.backend_options);
    cmd
}

// ── NDJSON event types ────────────────────────────────────────────

/// Events emitted by the Claude CLI in stream-json mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "assistant")]
    Assistant(TurnEvent),
    #[serde(rename = "user")]
    User(TurnEvent),
    #[serde(rename = "tool_progress")]
    ToolProgress(ToolProgressEvent),
    #[serde(rename = "permission_request")]
    PermissionRequest(PermissionRequestEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: String,
    pub session_id: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnEvent {
    pub message: TurnMessage,
    pub session_id: String,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnMessage {
    #[serde(default)]
    pub content: Vec<RawBlock>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub usage: Option<crate::backend::events::Usage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RawBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

/// Tool result content is a string for text results and an array for
/// structured ones (e.g. image blocks).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Structured(Vec<Value>),
}

impl From<ToolResultContent> for Value {
    fn from(content: ToolResultContent) -> Self {
        match content {
            ToolResultContent::Text(s) => Value::String(s),
            ToolResultContent::Structured(items) => Value::Array(items),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolProgressEvent {
    pub tool_use_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub elapsed_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionRequestEvent {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub subtype: String,
    pub session_id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    /// The CLI puts session errors in an array field.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultEvent {
    /// Best available error detail: `result`, then the `errors` array.
    pub fn error_message(&self) -> String {
        self.result
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| {
                self.errors
                    .first()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.as_str())
            })
            .unwrap_or("Unknown error")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_init_event() {
        let json = r#"{"type":"system","subtype":"init","cwd":"/tmp","session_id":"abc123","tools":["Bash","Read"],"model":"claude-sonnet-4-5"}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        match event {
            ClaudeEvent::System(sys) => {
                assert_eq!(sys.subtype, "init");
                assert_eq!(sys.session_id, "abc123");
                assert_eq!(sys.tools.len(), 2);
            }
            _ => panic!("Expected System event"),
        }
    }

    #[test]
    fn parse_assistant_with_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_123","name":"Bash","input":{"command":"ls"}}]},"session_id":"abc123"}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        match event {
            ClaudeEvent::Assistant(evt) => {
                assert_eq!(evt.message.content.len(), 1);
                match &evt.message.content[0] {
                    RawBlock::ToolUse { id, name, .. } => {
                        assert_eq!(id, "toolu_123");
                        assert_eq!(name, "Bash");
                    }
                    _ => panic!("Expected ToolUse content"),
                }
            }
            _ => panic!("Expected Assistant event"),
        }
    }

    #[test]
    fn parse_tool_progress_event() {
        let json = r#"{"type":"tool_progress","tool_use_id":"toolu_1","tool_name":"Bash","elapsed_seconds":2.5}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        match event {
            ClaudeEvent::ToolProgress(progress) => {
                assert_eq!(progress.tool_use_id, "toolu_1");
                assert_eq!(progress.elapsed_seconds, Some(2.5));
            }
            _ => panic!("Expected ToolProgress event"),
        }
    }

    #[test]
    fn parse_permission_request_event() {
        let json = r#"{"type":"permission_request","request_id":"perm-1","tool_name":"Bash","input":{"command":"rm -rf node_modules"},"message":"Allow Bash?"}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        match event {
            ClaudeEvent::PermissionRequest(req) => {
                assert_eq!(req.request_id, "perm-1");
                assert_eq!(req.tool_name, "Bash");
            }
            _ => panic!("Expected PermissionRequest event"),
        }
    }

    #[test]
    fn parse_result_event() {
        let json = r#"{"type":"result","subtype":"success","result":"Done","session_id":"abc123","is_error":false,"total_cost_usd":0.05,"num_turns":3}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        match event {
            ClaudeEvent::Result(res) => {
                assert_eq!(res.subtype, "success");
                assert!(!res.is_error);
                assert_eq!(res.total_cost_usd, Some(0.05));
                assert_eq!(res.num_turns, Some(3));
            }
            _ => panic!("Expected Result event"),
        }
    }

    #[test]
    fn result_error_message_prefers_result_field() {
        let res = ResultEvent {
            subtype: "error".to_string(),
            session_id: "s1".to_string(),
            result: Some("rate limited".to_string()),
            is_error: true,
            total_cost_usd: None,
            duration_ms: None,
            num_turns: None,
            errors: vec!["other".to_string()],
        };
        assert_eq!(res.error_message(), "rate limited");
    }

    #[test]
    fn result_error_message_falls_back_to_errors_array() {
        let res = ResultEvent {
            subtype: "error".to_string(),
            session_id: "s1".to_string(),
            result: None,
            is_error: true,
            total_cost_usd: None,
            duration_ms: None,
            num_turns: None,
            errors: vec!["session limit reached".to_string()],
        };
        assert_eq!(res.error_message(), "session limit reached");
    }

    #[test]
    fn build_command_maps_permission_modes() {
        let config = ClaudeConfig {
            cli_path: "claude".to_string(),
            api_key: None,
            default_model: None,
        };

        let mut request = QueryRequest::new("hi", "/tmp");
        request.permission_mode = PermissionMode::Auto;
        let cmd = build_command(&config, &request);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));

        request.permission_mode = PermissionMode::Deny;
        let cmd = build_command(&config, &request);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--permission-prompt-tool".to_string()));
    }

    #[test]
    fn build_command_resume_replaces_session_id() {
        let config = ClaudeConfig {
            cli_path: "claude".to_string(),
            api_key: None,
            default_model: None,
        };
        let mut request = QueryRequest::new("hi", "/tmp");
        request.resume = Some("prior-session".to_string());
        request.model = Some("anthropic/claude-sonnet-4-5".to_string());

        let cmd = build_command(&config, &request);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let resume_idx = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_idx + 1], "prior-session");
        assert!(!args.contains(&"--session-id".to_string()));
        // Provider prefix is stripped for the CLI.
        let model_idx = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model_idx + 1], "claude-sonnet-4-5");
    }
}
