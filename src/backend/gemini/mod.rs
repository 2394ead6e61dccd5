//! Gemini backend: spawns the Gemini CLI and normalizes its loosely-shaped
//! stream output.
//!
//! The CLI's vocabulary is flat (`thinking` / `tool_call` / `message` /
//! `done`) with several synonyms for the same concept (`tool` vs
//! `function`, `result` vs `output`) and optional tool ids, and it
//! interleaves plain progress lines with protocol JSON. The normalizer
//! probes recognized tags only and synthesizes ids where the protocol
//! omits them.

pub mod client;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::backend::events::{tool, AgentEvent, ContentBlock, QueryOutcome};
use crate::backend::shared::{self, spawn_stderr_drain, ActiveQuery, LineBuffer, ProcessHandle};
use crate::backend::{
    Backend, BackendIdentity, BackendInfo, EventStream, PermissionResponse, QueryRequest,
};

pub use client::GeminiConfig;

const DESCRIPTION: &str = "Google's Gemini CLI";

pub struct GeminiBackend {
    identity: BackendIdentity,
    config: Arc<RwLock<GeminiConfig>>,
    active: Arc<Mutex<Option<ActiveQuery>>>,
}

impl GeminiBackend {
    pub fn new() -> Self {
        Self::with_config(GeminiConfig::default())
    }

    pub fn with_config(config: GeminiConfig) -> Self {
        Self {
            identity: BackendIdentity {
                id: "gemini".to_string(),
                name: "Gemini CLI".to_string(),
                models: vec![
                    "gemini-2.5-pro".to_string(),
                    "gemini-2.5-flash".to_string(),
                ],
                default_model: "gemini-2.5-pro".to_string(),
                supports_interactive_permissions: false,
                supports_resume: false,
            },
            config: Arc::new(RwLock::new(config)),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Update the backend configuration.
    pub async fn update_config(&self, config: GeminiConfig) {
        let mut cfg = self.config.write().await;
        *cfg = config;
    }

    /// Get the current configuration.
    pub async fn get_config(&self) -> GeminiConfig {
        self.config.read().await.clone()
    }
}

impl Default for GeminiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for GeminiBackend {
    fn identity(&self) -> &BackendIdentity {
        &self.identity
    }

    async fn detect(&self) -> BackendInfo {
        let cli_path = self.config.read().await.cli_path.clone();
        shared::detect_executable(&self.identity, DESCRIPTION, &cli_path).await
    }

    async fn query(&self, request: QueryRequest) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.read().await.clone();

        info!(
            "Spawning Gemini CLI: cwd={}, model={:?}",
            request.cwd, request.model
        );

        let mut cmd = client::build_command(&config, &request);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn Gemini CLI: {}", e);
                let _ = tx.send(AgentEvent::Failure {
                    session_id: request.session_id.clone(),
                    message: format!(
                        "Failed to spawn Gemini CLI: {}. Is it installed at '{}'?",
                        e, config.cli_path
                    ),
                    code: None,
                });
                return EventStream::new(rx);
            }
        };

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = tx.send(AgentEvent::Failure {
                    session_id: request.session_id.clone(),
                    message: "Failed to capture Gemini stdout".to_string(),
                    code: None,
                });
                return EventStream::new(rx);
            }
        };
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr, "gemini");
        }

        let child_handle = Arc::new(Mutex::new(Some(child)));
        let cancelled = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(pump(
            stdout,
            Arc::clone(&child_handle),
            Arc::clone(&cancelled),
            tx,
            request.session_id.clone(),
        ));

        // No control channel; the handle exists for cancellation only.
        let handle = ProcessHandle::new(
            child_handle,
            Arc::new(Mutex::new(None)),
            cancelled,
            task,
        );
        *self.active.lock().await = Some(ActiveQuery {
            handle,
            pending_permissions: Arc::new(Mutex::new(HashSet::new())),
        });

        EventStream::new(rx)
    }

    async fn respond_to_permission(&self, _response: PermissionResponse) {
        // Documented no-op: Gemini has no interactive permission channel.
        // Approval is decided at spawn time via the --yolo flag.
        debug!("Gemini backend ignoring permission response");
    }

    async fn cancel(&self) {
        shared::cancel_active(&self.active).await;
    }
}

async fn pump(
    mut stdout: ChildStdout,
    child: Arc<Mutex<Option<Child>>>,
    cancelled: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<AgentEvent>,
    session_id: String,
) {
    let mut buf = LineBuffer::new();
    let mut chunk = [0u8; 8192];
    let mut normalizer = GeminiNormalizer::new(session_id.clone());
    let mut terminated = false;

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in buf.push(&chunk[..n]) {
                    deliver(&line, &mut normalizer, &tx, &mut terminated);
                }
            }
        }
    }
    if let Some(line) = buf.finish() {
        deliver(&line, &mut normalizer, &tx, &mut terminated);
    }

    let status = match child.lock().await.take() {
        Some(mut child) => child.wait().await.ok(),
        None => None,
    };

    if !terminated {
        let event = if cancelled.load(Ordering::SeqCst) {
            AgentEvent::Result {
                session_id,
                outcome: QueryOutcome::Cancelled,
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
                error: None,
            }
        } else {
            match status {
                Some(s) if s.success() => AgentEvent::Result {
                    session_id,
                    outcome: QueryOutcome::Success,
                    cost_usd: None,
                    duration_ms: None,
                    num_turns: None,
                    error: None,
                },
                Some(s) => AgentEvent::Failure {
                    session_id,
                    message: format!("Gemini CLI exited with status {}", s),
                    code: s.code(),
                },
                None => AgentEvent::Failure {
                    session_id,
                    message: "Gemini CLI terminated before reporting a result".to_string(),
                    code: None,
                },
            }
        };
        let _ = tx.send(event);
    }
}

fn deliver(
    line: &str,
    normalizer: &mut GeminiNormalizer,
    tx: &mpsc::UnboundedSender<AgentEvent>,
    terminated: &mut bool,
) {
    let Some(event) = normalizer.normalize(line) else {
        return;
    };
    if *terminated {
        debug!("Dropping Gemini event after terminal: {:?}", event);
        return;
    }
    let terminal = event.is_terminal();
    if tx.send(event).is_err() {
        debug!("Event receiver dropped; continuing to drain Gemini stdout");
    }
    if terminal {
        *terminated = true;
    }
}

/// Stateful normalizer: one stdout line in, at most one canonical event
/// out. State exists only to synthesize and correlate tool ids the
/// protocol omits.
pub(crate) struct GeminiNormalizer {
    session_id: String,
    next_tool_seq: u64,
    /// Tool invocations with no result seen yet, oldest first. Id-less
    /// results correlate FIFO.
    open_tools: VecDeque<String>,
}

impl GeminiNormalizer {
    pub(crate) fn new(session_id: String) -> Self {
        Self {
            session_id,
            next_tool_seq: 0,
            open_tools: VecDeque::new(),
        }
    }

    fn synthesize_id(&mut self) -> String {
        self.next_tool_seq += 1;
        format!("gemini-tool-{}", self.next_tool_seq)
    }

    pub(crate) fn normalize(&mut self, line: &str) -> Option<AgentEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            // Interleaved human-readable progress output.
            Err(_) => return Some(AgentEvent::assistant_text(&self.session_id, trimmed)),
        };
        let Some(obj) = value.as_object() else {
            return value
                .as_str()
                .map(|text| AgentEvent::assistant_text(&self.session_id, text));
        };

        match str_field(obj, "type").unwrap_or_default().as_str() {
            "init" => Some(AgentEvent::Init {
                session_id: str_field(obj, "session_id").unwrap_or_else(|| self.session_id.clone()),
                backend_id: "gemini".to_string(),
                model: str_field(obj, "model"),
                cwd: str_field(obj, "cwd"),
                tools: string_list(obj.get("tools")),
            }),
            "thinking" => {
                let text = text_field(obj)?;
                Some(AgentEvent::AssistantTurn {
                    session_id: self.session_id.clone(),
                    content: vec![ContentBlock::Thinking { text }],
                    parent_tool_use_id: None,
                    usage: None,
                })
            }
            "message" | "assistant" => {
                // The CLI streams the prompt back as a user-role message.
                if str_field(obj, "role").as_deref() == Some("user") {
                    return None;
                }
                let blocks = content_blocks(obj)?;
                Some(AgentEvent::AssistantTurn {
                    session_id: self.session_id.clone(),
                    content: blocks,
                    parent_tool_use_id: None,
                    usage: None,
                })
            }
            "tool_call" => {
                let name = tool_name(obj)?;
                let id = str_field(obj, "id").unwrap_or_else(|| self.synthesize_id());
                self.open_tools.push_back(id.clone());
                let input = tool_args(obj).unwrap_or_else(|| Value::Object(Map::new()));
                Some(AgentEvent::AssistantTurn {
                    session_id: self.session_id.clone(),
                    content: vec![ContentBlock::ToolUse {
                        id,
                        name: canonical_tool_name(&name),
                        input,
                    }],
                    parent_tool_use_id: None,
                    usage: None,
                })
            }
            "tool_result" => {
                let id = match str_field(obj, "id").or_else(|| str_field(obj, "tool_call_id")) {
                    Some(id) => {
                        self.open_tools.retain(|open| open != &id);
                        id
                    }
                    None => self
                        .open_tools
                        .pop_front()
                        .unwrap_or_else(|| self.synthesize_id()),
                };
                let content = result_value(obj);
                let is_error = error_flag(obj);
                Some(AgentEvent::UserTurn {
                    session_id: self.session_id.clone(),
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: id,
                        content,
                        is_error,
                    }],
                })
            }
            "done" | "result" => Some(self.normalize_done(obj)),
            "error" => Some(AgentEvent::Result {
                session_id: self.session_id.clone(),
                outcome: QueryOutcome::Error,
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
                error: Some(
                    str_field(obj, "message")
                        .or_else(|| str_field(obj, "error"))
                        .unwrap_or_else(|| "Unknown error".to_string()),
                ),
            }),
            _ => text_field(obj).map(|text| AgentEvent::assistant_text(&self.session_id, text)),
        }
    }

    fn normalize_done(&self, obj: &Map<String, Value>) -> AgentEvent {
        let stats = obj.get("stats").and_then(|v| v.as_object());
        let status = str_field(obj, "status");
        let is_error = match status.as_deref() {
            Some("success") | Some("ok") | Some("done") | Some("completed") => false,
            Some(_) => true,
            // No status field: fall back to a boolean or the presence of
            // error detail.
            None => match obj.get("success").and_then(|v| v.as_bool()) {
                Some(success) => !success,
                None => obj.get("error").is_some_and(|v| !v.is_null()),
            },
        };

        let error = is_error
            .then(|| {
                str_field(obj, "error")
                    .or_else(|| str_field(obj, "message"))
                    .or(status.clone())
            })
            .flatten();

        let num_turns = u32_field(obj.get("num_turns"))
            .or_else(|| stats.and_then(|s| u32_field(s.get("turns"))))
            .or_else(|| stats.and_then(|s| u32_field(s.get("tool_calls"))));

        AgentEvent::Result {
            session_id: self.session_id.clone(),
            outcome: if is_error {
                QueryOutcome::Error
            } else {
                QueryOutcome::Success
            },
            cost_usd: f64_field(obj.get("cost_usd"))
                .or_else(|| f64_field(obj.get("cost")))
                .or_else(|| stats.and_then(|s| f64_field(s.get("cost_usd")))),
            duration_ms: u64_field(obj.get("duration_ms"))
                .or_else(|| stats.and_then(|s| u64_field(s.get("duration_ms")))),
            num_turns,
            error,
        }
    }
}

// ── Field probing helpers ─────────────────────────────────────────

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn u32_field(value: Option<&Value>) -> Option<u32> {
    value.and_then(|v| v.as_u64()).map(|n| n as u32)
}

fn u64_field(value: Option<&Value>) -> Option<u64> {
    value.and_then(|v| v.as_u64())
}

fn f64_field(value: Option<&Value>) -> Option<f64> {
    value.and_then(|v| v.as_f64())
}

/// Free text under any of the keys the CLI uses for it.
fn text_field(obj: &Map<String, Value>) -> Option<String> {
    str_field(obj, "text")
        .or_else(|| str_field(obj, "content"))
        .or_else(|| str_field(obj, "message"))
}

/// Message content: a plain string, a `text` field, or an array of blocks
/// with `text` entries.
fn content_blocks(obj: &Map<String, Value>) -> Option<Vec<ContentBlock>> {
    if let Some(text) = text_field(obj) {
        return Some(vec![ContentBlock::Text { text }]);
    }
    let items = obj.get("content").and_then(|v| v.as_array())?;
    let blocks: Vec<ContentBlock> = items
        .iter()
        .filter_map(|item| {
            let text = item.as_str().map(|s| s.to_string()).or_else(|| {
                item.as_object()
                    .and_then(|o| str_field(o, "text").or_else(|| str_field(o, "content")))
            })?;
            Some(ContentBlock::Text { text })
        })
        .collect();
    (!blocks.is_empty()).then_some(blocks)
}

/// Tool name under its synonyms, directly or nested one level down.
fn tool_name(obj: &Map<String, Value>) -> Option<String> {
    fn from_object(value: &Value) -> Option<String> {
        let obj = value.as_object()?;
        str_field(obj, "name").or_else(|| str_field(obj, "tool_name"))
    }

    str_field(obj, "name")
        .or_else(|| str_field(obj, "tool"))
        .or_else(|| str_field(obj, "function"))
        .or_else(|| str_field(obj, "tool_name"))
        .or_else(|| obj.get("tool").and_then(from_object))
        .or_else(|| obj.get("function").and_then(from_object))
}

/// Tool arguments under their synonyms. A JSON-encoded string argument
/// payload is decoded when possible.
fn tool_args(obj: &Map<String, Value>) -> Option<Value> {
    fn parse_json_str(value: &Value) -> Option<Value> {
        let s = value.as_str()?;
        if s.trim().is_empty() {
            return None;
        }
        serde_json::from_str(s).ok()
    }

    if let Some(value) = obj.get("args") {
        return Some(value.clone());
    }
    if let Some(value) = obj.get("arguments") {
        return parse_json_str(value).or_else(|| Some(value.clone()));
    }
    obj.get("input")
        .or_else(|| obj.get("params"))
        .cloned()
        .or_else(|| {
            obj.get("function")
                .and_then(|v| v.as_object())
                .and_then(|o| o.get("arguments"))
                .and_then(|v| parse_json_str(v).or_else(|| Some(v.clone())))
        })
}

/// Tool result payload under its synonyms.
fn result_value(obj: &Map<String, Value>) -> Value {
    obj.get("result")
        .or_else(|| obj.get("output"))
        .or_else(|| obj.get("content"))
        .or_else(|| obj.get("data"))
        .cloned()
        .unwrap_or(Value::Null)
}

fn error_flag(obj: &Map<String, Value>) -> bool {
    if obj.get("error").is_some_and(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }) {
        return true;
    }
    matches!(
        str_field(obj, "status").as_deref(),
        Some("error") | Some("failed")
    )
}

/// Gemini tool names onto the canonical vocabulary; unrecognized names pass
/// through unchanged.
fn canonical_tool_name(raw: &str) -> String {
    let mapped = match raw {
        "shell" | "run_command" | "execute" | "run_shell_command" => tool::EXECUTE,
        "read_file" | "view" | "cat" | "read_many_files" => tool::READ_FILE,
        "write_file" => tool::WRITE_FILE,
        "edit" | "replace" => tool::EDIT_FILE,
        "grep" | "search_file_content" => tool::SEARCH,
        "ls" | "list_directory" | "glob" => tool::LIST_FILES,
        "web_fetch" => tool::WEB_FETCH,
        "web_search" | "google_web_search" => tool::WEB_SEARCH,
        _ => return raw.to_string(),
    };
    mapped.to_string()
}

/// Create a registry entry for the Gemini backend.
pub fn registry_entry(config: GeminiConfig) -> Arc<dyn Backend> {
    Arc::new(GeminiBackend::with_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> GeminiNormalizer {
        GeminiNormalizer::new("sess-1".to_string())
    }

    #[test]
    fn assistant_message_with_content_array() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"assistant","content":[{"type":"text","text":"hi"}]}"#)
            .unwrap();
        match event {
            AgentEvent::AssistantTurn { content, .. } => {
                assert_eq!(
                    content,
                    vec![ContentBlock::Text {
                        text: "hi".to_string()
                    }]
                );
            }
            other => panic!("Expected AssistantTurn, got {:?}", other),
        }
    }

    #[test]
    fn result_with_stats_maps_turn_count() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"result","status":"success","stats":{"tool_calls":1}}"#)
            .unwrap();
        match event {
            AgentEvent::Result {
                outcome, num_turns, ..
            } => {
                assert_eq!(outcome, QueryOutcome::Success);
                assert_eq!(num_turns, Some(1));
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn done_with_error_status_maps_to_error_outcome() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"done","status":"failed","error":"quota exceeded"}"#)
            .unwrap();
        match event {
            AgentEvent::Result { outcome, error, .. } => {
                assert_eq!(outcome, QueryOutcome::Error);
                assert_eq!(error.as_deref(), Some("quota exceeded"));
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn done_without_stats_leaves_fields_absent() {
        let mut n = normalizer();
        let event = n.normalize(r#"{"type":"done","status":"success"}"#).unwrap();
        match event {
            AgentEvent::Result {
                cost_usd,
                duration_ms,
                num_turns,
                ..
            } => {
                assert_eq!(cost_usd, None);
                assert_eq!(duration_ms, None);
                assert_eq!(num_turns, None);
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn tool_call_synonyms_resolve_to_one_canonical_name() {
        for line in [
            r#"{"type":"tool_call","id":"t1","tool":"shell","args":{"command":"ls"}}"#,
            r#"{"type":"tool_call","id":"t1","function":"run_command","arguments":"{\"command\":\"ls\"}"}"#,
            r#"{"type":"tool_call","id":"t1","name":"execute","input":{"command":"ls"}}"#,
        ] {
            let mut n = normalizer();
            let event = n.normalize(line).unwrap();
            match event {
                AgentEvent::AssistantTurn { content, .. } => match &content[0] {
                    ContentBlock::ToolUse { name, input, .. } => {
                        assert_eq!(name, "execute", "line: {}", line);
                        assert_eq!(input["command"], "ls", "line: {}", line);
                    }
                    other => panic!("Expected ToolUse, got {:?}", other),
                },
                other => panic!("Expected AssistantTurn, got {:?}", other),
            }
        }
    }

    #[test]
    fn idless_tool_call_and_result_share_a_synthesized_id() {
        let mut n = normalizer();
        let call = n
            .normalize(r#"{"type":"tool_call","tool":"shell","args":{"command":"ls"}}"#)
            .unwrap();
        let call_id = match call {
            AgentEvent::AssistantTurn { ref content, .. } => match &content[0] {
                ContentBlock::ToolUse { id, .. } => id.clone(),
                other => panic!("Expected ToolUse, got {:?}", other),
            },
            other => panic!("Expected AssistantTurn, got {:?}", other),
        };

        let result = n
            .normalize(r#"{"type":"tool_result","output":"src\nCargo.toml"}"#)
            .unwrap();
        match result {
            AgentEvent::UserTurn { content, .. } => match &content[0] {
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    assert_eq!(tool_use_id, &call_id);
                }
                other => panic!("Expected ToolResult, got {:?}", other),
            },
            other => panic!("Expected UserTurn, got {:?}", other),
        }
    }

    #[test]
    fn idless_results_correlate_fifo() {
        let mut n = normalizer();
        n.normalize(r#"{"type":"tool_call","tool":"shell","args":{}}"#)
            .unwrap();
        n.normalize(r#"{"type":"tool_call","tool":"read_file","args":{}}"#)
            .unwrap();

        let first = n
            .normalize(r#"{"type":"tool_result","output":"a"}"#)
            .unwrap();
        let second = n
            .normalize(r#"{"type":"tool_result","output":"b"}"#)
            .unwrap();
        let ids: Vec<String> = [first, second]
            .into_iter()
            .map(|event| match event {
                AgentEvent::UserTurn { content, .. } => match &content[0] {
                    ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.clone(),
                    other => panic!("Expected ToolResult, got {:?}", other),
                },
                other => panic!("Expected UserTurn, got {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec!["gemini-tool-1", "gemini-tool-2"]);
    }

    #[test]
    fn tool_result_error_flag_from_status_or_error() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"tool_result","id":"t1","output":"denied","status":"error"}"#)
            .unwrap();
        match event {
            AgentEvent::UserTurn { content, .. } => match &content[0] {
                ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
                other => panic!("Expected ToolResult, got {:?}", other),
            },
            other => panic!("Expected UserTurn, got {:?}", other),
        }
    }

    #[test]
    fn user_role_message_echo_is_filtered() {
        // Regression: the CLI streams the prompt back with role "user".
        let mut n = normalizer();
        assert!(n
            .normalize(r#"{"type":"message","role":"user","content":"original prompt"}"#)
            .is_none());
        // Assistant-role messages still pass.
        assert!(n
            .normalize(r#"{"type":"message","role":"assistant","content":"reply"}"#)
            .is_some());
    }

    #[test]
    fn thinking_maps_to_thinking_block() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"thinking","text":"planning the change"}"#)
            .unwrap();
        match event {
            AgentEvent::AssistantTurn { content, .. } => {
                assert_eq!(
                    content,
                    vec![ContentBlock::Thinking {
                        text: "planning the change".to_string()
                    }]
                );
            }
            other => panic!("Expected AssistantTurn, got {:?}", other),
        }
    }

    #[test]
    fn plain_text_line_becomes_assistant_text() {
        let mut n = normalizer();
        let event = n.normalize("Loaded 3 MCP servers").unwrap();
        assert_eq!(event, AgentEvent::assistant_text("sess-1", "Loaded 3 MCP servers"));
    }

    #[test]
    fn unknown_object_salvages_text_or_drops() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"banner","text":"gemini v1.2"}"#)
            .unwrap();
        assert_eq!(event, AgentEvent::assistant_text("sess-1", "gemini v1.2"));
        assert!(n.normalize(r#"{"type":"banner","pid":9}"#).is_none());
        assert!(n.normalize("[]").is_none());
    }

    #[test]
    fn spec_example_sequence_normalizes_in_order() {
        let mut n = normalizer();
        let lines = [
            r#"{"type":"assistant","content":[{"type":"text","text":"hi"}]}"#,
            r#"{"type":"result","status":"success","stats":{"tool_calls":1}}"#,
        ];
        let events: Vec<AgentEvent> = lines.iter().filter_map(|l| n.normalize(l)).collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AgentEvent::AssistantTurn { .. }));
        assert!(matches!(
            events[1],
            AgentEvent::Result {
                outcome: QueryOutcome::Success,
                num_turns: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn malformed_then_valid_line_keeps_streaming() {
        let mut n = normalizer();
        let first = n.normalize("not json at all").unwrap();
        assert_eq!(first, AgentEvent::assistant_text("sess-1", "not json at all"));
        let second = n
            .normalize(r#"{"type":"done","status":"success"}"#)
            .unwrap();
        assert!(second.is_terminal());
    }

    #[test]
    fn init_event_maps_backend_id() {
        let mut n = normalizer();
        let event = n
            .normalize(
                r#"{"type":"init","session_id":"g-1","model":"gemini-2.5-pro","tools":["shell"]}"#,
            )
            .unwrap();
        match event {
            AgentEvent::Init {
                session_id,
                backend_id,
                model,
                tools,
                ..
            } => {
                assert_eq!(session_id, "g-1");
                assert_eq!(backend_id, "gemini");
                assert_eq!(model.as_deref(), Some("gemini-2.5-pro"));
                assert_eq!(tools, vec!["shell".to_string()]);
            }
            other => panic!("Expected Init, got {:?}", other),
        }
    }

    #[test]
    fn chunk_boundary_invariance_through_line_buffer() {
        // The same protocol bytes, delivered whole and split mid-JSON-line,
        // normalize to the same events.
        let payload = concat!(
            r#"{"type":"assistant","content":[{"type":"text","text":"hi"}]}"#,
            "\n",
            r#"{"type":"result","status":"success","stats":{"tool_calls":1}}"#,
            "\n"
        )
        .as_bytes();

        let run = |chunks: Vec<&[u8]>| -> Vec<AgentEvent> {
            let mut buf = LineBuffer::new();
            let mut n = normalizer();
            let mut events = Vec::new();
            for chunk in chunks {
                for line in buf.push(chunk) {
                    events.extend(n.normalize(&line));
                }
            }
            if let Some(line) = buf.finish() {
                events.extend(n.normalize(&line));
            }
            events
        };

        let whole = run(vec![payload]);
        let split_at = 40; // mid-first-line
        let fragmented = run(vec![&payload[..split_at], &payload[split_at..]]);
        assert_eq!(whole, fragmented);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fake_cli_interleaves_text_and_protocol() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-gemini");
        std::fs::write(
            &path,
            concat!(
                "#!/bin/sh\n",
                "echo 'warming up'\n",
                r#"printf '{"type":"message","role":"assistant","content":"done"}\n'"#,
                "\n",
                r#"printf '{"type":"done","status":"success"}\n'"#,
                "\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = GeminiBackend::with_config(GeminiConfig {
            cli_path: path.to_string_lossy().into_owned(),
            api_key: None,
            default_model: None,
        });
        let stream = backend.query(QueryRequest::new("hello", "/tmp")).await;
        let events = stream.collect_all().await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], AgentEvent::AssistantTurn { .. }));
        assert!(matches!(events[1], AgentEvent::AssistantTurn { .. }));
        assert!(events[2].is_terminal());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }
}
