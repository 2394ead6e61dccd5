//! Codex backend: delegates to a companion worker process instead of
//! invoking a CLI directly. The contract is identical from the caller's
//! perspective; the one visible difference is the terminal event — a
//! graceful worker exit produces [`AgentEvent::Completion`].

pub mod client;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::backend::events::{tool, AgentEvent, ContentBlock, QueryOutcome};
use crate::backend::shared::{self, spawn_stderr_drain, ActiveQuery, LineBuffer, ProcessHandle};
use crate::backend::{
    Backend, BackendIdentity, BackendInfo, EventStream, PermissionResponse, QueryRequest,
};

pub use client::{CodexConfig, WorkerEvent};

const DESCRIPTION: &str = "OpenAI's Codex agent via the companion worker";

pub struct CodexBackend {
    identity: BackendIdentity,
    config: Arc<RwLock<CodexConfig>>,
    active: Arc<Mutex<Option<ActiveQuery>>>,
}

impl CodexBackend {
    pub fn new() -> Self {
        Self::with_config(CodexConfig::default())
    }

    pub fn with_config(config: CodexConfig) -> Self {
        Self {
            identity: BackendIdentity {
                id: "codex".to_string(),
                name: "Codex".to_string(),
                models: vec!["gpt-5.2-codex".to_string(), "gpt-5.1-codex-mini".to_string()],
                default_model: "gpt-5.2-codex".to_string(),
                supports_interactive_permissions: true,
                supports_resume: true,
            },
            config: Arc::new(RwLock::new(config)),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Update the backend configuration.
    pub async fn update_config(&self, config: CodexConfig) {
        let mut cfg = self.config.write().await;
        *cfg = config;
    }

    /// Get the current configuration.
    pub async fn get_config(&self) -> CodexConfig {
        self.config.read().await.clone()
    }
}

impl Default for CodexBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for CodexBackend {
    fn identity(&self) -> &BackendIdentity {
        &self.identity
    }

    async fn detect(&self) -> BackendInfo {
        let worker_path = self.config.read().await.worker_path.clone();
        shared::detect_executable(&self.identity, DESCRIPTION, &worker_path).await
    }

    async fn query(&self, request: QueryRequest) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.read().await.clone();

        info!(
            "Spawning Codex worker: cwd={}, model={:?}, thread={:?}",
            request.cwd, request.model, request.resume
        );

        let mut cmd = client::build_command(&config, &request);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn Codex worker: {}", e);
                let _ = tx.send(AgentEvent::Failure {
                    session_id: request.session_id.clone(),
                    message: format!(
                        "Failed to spawn Codex worker: {}. Is it installed at '{}'?",
                        e, config.worker_path
                    ),
                    code: None,
                });
                return EventStream::new(rx);
            }
        };

        // The query request is the first stdin line; the pipe stays open as
        // the permission-response control channel.
        let stdin_slot = Arc::new(Mutex::new(None));
        if let Some(mut stdin) = child.stdin.take() {
            let line = client::query_request_line(&config, &request);
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                error!("Failed to write query request to Codex worker: {}", e);
            }
            *stdin_slot.lock().await = Some(stdin);
        }

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = tx.send(AgentEvent::Failure {
                    session_id: request.session_id.clone(),
                    message: "Failed to capture Codex worker stdout".to_string(),
                    code: None,
                });
                return EventStream::new(rx);
            }
        };
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr, "codex");
        }

        let child_handle = Arc::new(Mutex::new(Some(child)));
        let cancelled = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(Mutex::new(HashSet::new()));

        let task = tokio::spawn(pump(
            stdout,
            Arc::clone(&child_handle),
            Arc::clone(&cancelled),
            Arc::clone(&pending),
            tx,
            request.session_id.clone(),
        ));

        let handle = ProcessHandle::new(child_handle, stdin_slot, cancelled, task);
        *self.active.lock().await = Some(ActiveQuery {
            handle,
            pending_permissions: pending,
        });

        EventStream::new(rx)
    }

    async fn respond_to_permission(&self, response: PermissionResponse) {
        shared::respond_via_control_channel(&self.active, &response).await;
    }

    async fn cancel(&self) {
        shared::cancel_active(&self.active).await;
    }
}

async fn pump(
    mut stdout: ChildStdout,
    child: Arc<Mutex<Option<Child>>>,
    cancelled: Arc<AtomicBool>,
    pending: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<AgentEvent>,
    session_id: String,
) {
    let mut buf = LineBuffer::new();
    let mut chunk = [0u8; 8192];
    let mut normalizer = CodexNormalizer::new(session_id);
    let mut terminated = false;

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in buf.push(&chunk[..n]) {
                    deliver(&line, &mut normalizer, &pending, &tx, &mut terminated).await;
                }
            }
        }
    }
    if let Some(line) = buf.finish() {
        deliver(&line, &mut normalizer, &pending, &tx, &mut terminated).await;
    }

    let status = match child.lock().await.take() {
        Some(mut child) => child.wait().await.ok(),
        None => None,
    };

    if !terminated {
        let event = if cancelled.load(Ordering::SeqCst) {
            AgentEvent::Result {
                session_id: normalizer.session_id().to_string(),
                outcome: QueryOutcome::Cancelled,
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
                error: None,
            }
        } else {
            match status {
                // Graceful worker exit marks completion.
                Some(s) if s.success() => normalizer.completion(),
                Some(s) => AgentEvent::Failure {
                    session_id: normalizer.session_id().to_string(),
                    message: format!("Codex worker exited with status {}", s),
                    code: s.code(),
                },
                None => AgentEvent::Failure {
                    session_id: normalizer.session_id().to_string(),
                    message: "Codex worker terminated before completing".to_string(),
                    code: None,
                },
            }
        };
        let _ = tx.send(event);
    }
}

async fn deliver(
    line: &str,
    normalizer: &mut CodexNormalizer,
    pending: &Mutex<HashSet<String>>,
    tx: &mpsc::UnboundedSender<AgentEvent>,
    terminated: &mut bool,
) {
    let Some(event) = normalizer.normalize(line) else {
        return;
    };
    if *terminated {
        debug!("Dropping Codex event after terminal: {:?}", event);
        return;
    }
    if let AgentEvent::PermissionRequest { ref request_id, .. } = event {
        pending.lock().await.insert(request_id.clone());
    }
    let terminal = event.is_terminal();
    if tx.send(event).is_err() {
        debug!("Event receiver dropped; continuing to drain Codex worker stdout");
    }
    if terminal {
        *terminated = true;
    }
}

/// Stateful normalizer. Tracks the worker's thread id (the session id on
/// every later event and the resume token), the last assistant message, and
/// the turn summary so a graceful exit can synthesize [`AgentEvent::Completion`].
pub(crate) struct CodexNormalizer {
    fallback_session: String,
    thread_id: Option<String>,
    last_assistant: Option<String>,
    summary: Option<String>,
}

impl CodexNormalizer {
    pub(crate) fn new(fallback_session: String) -> Self {
        Self {
            fallback_session,
            thread_id: None,
            last_assistant: None,
            summary: None,
        }
    }

    fn session_id(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.fallback_session)
    }

    /// The terminal event for a graceful worker exit.
    pub(crate) fn completion(&self) -> AgentEvent {
        AgentEvent::Completion {
            session_id: self.session_id().to_string(),
            last_assistant: self.last_assistant.clone(),
            summary: self.summary.clone(),
        }
    }

    pub(crate) fn normalize(&mut self, line: &str) -> Option<AgentEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let event = match serde_json::from_str::<WorkerEvent>(trimmed) {
            Ok(event) => event,
            // Not JSON at all: interleaved plain output, surfaced verbatim.
            Err(_) => {
                return Some(AgentEvent::assistant_text(self.session_id(), trimmed));
            }
        };

        match event {
            WorkerEvent::ThreadStarted {
                thread_id,
                model,
                cwd,
                tools,
            } => {
                self.thread_id = Some(thread_id.clone());
                Some(AgentEvent::Init {
                    session_id: thread_id,
                    backend_id: "codex".to_string(),
                    model,
                    cwd,
                    tools,
                })
            }
            WorkerEvent::TurnStarted => {
                debug!("Codex turn started");
                None
            }
            WorkerEvent::TurnCompleted { summary } => {
                if let Some(summary) = summary {
                    if !summary.trim().is_empty() {
                        self.summary = Some(summary);
                    }
                }
                None
            }
            WorkerEvent::TurnFailed { error } => Some(AgentEvent::Result {
                session_id: self.session_id().to_string(),
                outcome: QueryOutcome::Error,
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
                error: Some(error.message),
            }),
            WorkerEvent::ItemCreated { item } => self.normalize_item(item, ItemPhase::Created),
            WorkerEvent::ItemUpdated { item } => self.normalize_item(item, ItemPhase::Updated),
            WorkerEvent::ItemCompleted { item } => self.normalize_item(item, ItemPhase::Completed),
            WorkerEvent::PermissionRequest {
                request_id,
                tool_name,
                input,
                message,
            } => Some(AgentEvent::PermissionRequest {
                request_id,
                tool_name: canonical_tool_name(&tool_name),
                input,
                message: message.unwrap_or_default(),
            }),
            WorkerEvent::Error { message } => Some(AgentEvent::Result {
                session_id: self.session_id().to_string(),
                outcome: QueryOutcome::Error,
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
                error: Some(message),
            }),
            // Recognized as JSON but not as protocol: recover text if any.
            WorkerEvent::Unknown => {
                let value: Value = serde_json::from_str(trimmed).ok()?;
                let text = salvage_text(&value)?;
                Some(AgentEvent::assistant_text(self.session_id(), text))
            }
        }
    }

    fn normalize_item(&mut self, item: client::Item, phase: ItemPhase) -> Option<AgentEvent> {
        match item.item_type.as_str() {
            "agent_message" | "assistant_message" | "message" => {
                // Messages are emitted once, when complete.
                if phase != ItemPhase::Completed {
                    return None;
                }
                let text = item_text(&item.data)?;
                self.last_assistant = Some(text.clone());
                Some(AgentEvent::AssistantTurn {
                    session_id: self.session_id().to_string(),
                    content: vec![ContentBlock::Text { text }],
                    parent_tool_use_id: None,
                    usage: None,
                })
            }
            "reasoning" | "thinking" => {
                if phase != ItemPhase::Completed {
                    return None;
                }
                let text = item_text(&item.data)?;
                Some(AgentEvent::AssistantTurn {
                    session_id: self.session_id().to_string(),
                    content: vec![ContentBlock::Thinking { text }],
                    parent_tool_use_id: None,
                    usage: None,
                })
            }
            "command_execution" | "command" | "tool_call" | "function_call" => match phase {
                ItemPhase::Created => {
                    let name = tool_name_for_item(&item)?;
                    let input = item_tool_args(&item.data)
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                    Some(AgentEvent::AssistantTurn {
                        session_id: self.session_id().to_string(),
                        content: vec![ContentBlock::ToolUse {
                            id: item.id,
                            name,
                            input,
                        }],
                        parent_tool_use_id: None,
                        usage: None,
                    })
                }
                ItemPhase::Updated => {
                    let name = tool_name_for_item(&item)?;
                    Some(AgentEvent::ToolProgress {
                        tool_use_id: item.id,
                        tool_name: name,
                        elapsed_secs: item
                            .data
                            .get("elapsed_seconds")
                            .and_then(|v| v.as_f64()),
                    })
                }
                ItemPhase::Completed => {
                    let content = item
                        .data
                        .get("output")
                        .or_else(|| item.data.get("result"))
                        .or_else(|| item.data.get("aggregated_output"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    let is_error = item
                        .data
                        .get("exit_code")
                        .and_then(|v| v.as_i64())
                        .is_some_and(|code| code != 0)
                        || item.data.get("status").and_then(|v| v.as_str())
                            == Some("failed");
                    Some(AgentEvent::UserTurn {
                        session_id: self.session_id().to_string(),
                        content: vec![ContentBlock::ToolResult {
                            tool_use_id: item.id,
                            content,
                            is_error,
                        }],
                    })
                }
            },
            // The worker echoes the prompt back as a user_message item.
            "user_message" => None,
            other => {
                debug!("Unknown Codex item type: {}", other);
                item_text(&item.data)
                    .map(|text| AgentEvent::assistant_text(self.session_id(), text))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemPhase {
    Created,
    Updated,
    Completed,
}

fn item_text(data: &HashMap<String, Value>) -> Option<String> {
    for key in ["text", "content", "output_text"] {
        if let Some(s) = data.get(key).and_then(|v| v.as_str()) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Canonical tool name for a tool-ish item. Shell items carry only their
/// command string, so the item type itself names the tool.
fn tool_name_for_item(item: &client::Item) -> Option<String> {
    match item.item_type.as_str() {
        "command_execution" | "command" => Some(tool::EXECUTE.to_string()),
        _ => item_tool_name(&item.data).map(|name| canonical_tool_name(&name)),
    }
}

fn item_tool_name(data: &HashMap<String, Value>) -> Option<String> {
    for key in ["name", "tool", "tool_name"] {
        if let Some(s) = data.get(key).and_then(|v| v.as_str()) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn item_tool_args(data: &HashMap<String, Value>) -> Option<Value> {
    // A shell item carries its command string rather than an args object.
    if let Some(command) = data.get("command").and_then(|v| v.as_str()) {
        return Some(serde_json::json!({ "command": command }));
    }
    data.get("args")
        .or_else(|| data.get("arguments"))
        .or_else(|| data.get("input"))
        .cloned()
}

fn salvage_text(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    for key in ["text", "message", "content"] {
        if let Some(s) = obj.get(key).and_then(|v| v.as_str()) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Codex tool names onto the canonical vocabulary; unrecognized names pass
/// through unchanged.
fn canonical_tool_name(raw: &str) -> String {
    let mapped = match raw {
        "shell" | "exec_command" | "local_shell" => tool::EXECUTE,
        "read_file" => tool::READ_FILE,
        "write_file" => tool::WRITE_FILE,
        "apply_patch" => tool::EDIT_FILE,
        "grep" => tool::SEARCH,
        "list_files" => tool::LIST_FILES,
        "web_search" => tool::WEB_SEARCH,
        _ => return raw.to_string(),
    };
    mapped.to_string()
}

/// Create a registry entry for the Codex backend.
pub fn registry_entry(config: CodexConfig) -> Arc<dyn Backend> {
    Arc::new(CodexBackend::with_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> CodexNormalizer {
        CodexNormalizer::new("caller-session".to_string())
    }

    #[test]
    fn thread_started_maps_to_init_and_pins_session() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"thread.started","thread_id":"thread-1","model":"gpt-5.2-codex"}"#)
            .unwrap();
        match event {
            AgentEvent::Init {
                session_id,
                backend_id,
                model,
                ..
            } => {
                assert_eq!(session_id, "thread-1");
                assert_eq!(backend_id, "codex");
                assert_eq!(model.as_deref(), Some("gpt-5.2-codex"));
            }
            other => panic!("Expected Init, got {:?}", other),
        }
        // Later events ride on the thread id.
        assert_eq!(n.session_id(), "thread-1");
    }

    #[test]
    fn agent_message_emitted_only_when_completed() {
        let mut n = normalizer();
        assert!(n
            .normalize(r#"{"type":"item.created","item":{"id":"i1","type":"agent_message","text":""}}"#)
            .is_none());
        let event = n
            .normalize(
                r#"{"type":"item.completed","item":{"id":"i1","type":"agent_message","text":"all done"}}"#,
            )
            .unwrap();
        match event {
            AgentEvent::AssistantTurn { content, .. } => {
                assert_eq!(
                    content,
                    vec![ContentBlock::Text {
                        text: "all done".to_string()
                    }]
                );
            }
            other => panic!("Expected AssistantTurn, got {:?}", other),
        }
    }

    #[test]
    fn command_lifecycle_keeps_one_invocation_id() {
        let mut n = normalizer();

        let created = n
            .normalize(
                r#"{"type":"item.created","item":{"id":"cmd_1","type":"command_execution","command":"cargo check"}}"#,
            )
            .unwrap();
        match &created {
            AgentEvent::AssistantTurn { content, .. } => match &content[0] {
                ContentBlock::ToolUse { id, name, input } => {
                    assert_eq!(id, "cmd_1");
                    assert_eq!(name, "execute");
                    assert_eq!(input["command"], "cargo check");
                }
                other => panic!("Expected ToolUse, got {:?}", other),
            },
            other => panic!("Expected AssistantTurn, got {:?}", other),
        }

        let updated = n
            .normalize(
                r#"{"type":"item.updated","item":{"id":"cmd_1","type":"command_execution","command":"cargo check","elapsed_seconds":3.2}}"#,
            )
            .unwrap();
        match &updated {
            AgentEvent::ToolProgress {
                tool_use_id,
                elapsed_secs,
                ..
            } => {
                assert_eq!(tool_use_id, "cmd_1");
                assert_eq!(*elapsed_secs, Some(3.2));
            }
            other => panic!("Expected ToolProgress, got {:?}", other),
        }

        let completed = n
            .normalize(
                r#"{"type":"item.completed","item":{"id":"cmd_1","type":"command_execution","command":"cargo check","output":"ok","exit_code":0}}"#,
            )
            .unwrap();
        match &completed {
            AgentEvent::UserTurn { content, .. } => match &content[0] {
                ContentBlock::ToolResult {
                    tool_use_id,
                    is_error,
                    ..
                } => {
                    assert_eq!(tool_use_id, "cmd_1");
                    assert!(!is_error);
                }
                other => panic!("Expected ToolResult, got {:?}", other),
            },
            other => panic!("Expected UserTurn, got {:?}", other),
        }
    }

    #[test]
    fn named_tool_call_item_maps_through_synonym_table() {
        let mut n = normalizer();
        let event = n
            .normalize(
                r#"{"type":"item.created","item":{"id":"tc_1","type":"tool_call","tool":"web_search","args":{"query":"tokio mpsc"}}}"#,
            )
            .unwrap();
        match event {
            AgentEvent::AssistantTurn { content, .. } => match &content[0] {
                ContentBlock::ToolUse { name, .. } => assert_eq!(name, "web_search"),
                other => panic!("Expected ToolUse, got {:?}", other),
            },
            other => panic!("Expected AssistantTurn, got {:?}", other),
        }
    }

    #[test]
    fn nonzero_exit_code_marks_result_as_error() {
        let mut n = normalizer();
        let event = n
            .normalize(
                r#"{"type":"item.completed","item":{"id":"cmd_2","type":"command_execution","command":"false","output":"","exit_code":1}}"#,
            )
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
    fn user_message_echo_is_filtered() {
        // Regression: the worker echoes the prompt back as a user_message
        // item; it must not resurface as a turn.
        let mut n = normalizer();
        assert!(n
            .normalize(
                r#"{"type":"item.completed","item":{"id":"u1","type":"user_message","text":"the original prompt"}}"#
            )
            .is_none());
    }

    #[test]
    fn turn_failed_is_backend_reported_error() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"turn.failed","error":{"message":"401 Unauthorized"}}"#)
            .unwrap();
        match event {
            AgentEvent::Result { outcome, error, .. } => {
                assert_eq!(outcome, QueryOutcome::Error);
                assert_eq!(error.as_deref(), Some("401 Unauthorized"));
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn completion_carries_last_assistant_and_summary() {
        let mut n = normalizer();
        n.normalize(r#"{"type":"thread.started","thread_id":"thread-7"}"#)
            .unwrap();
        n.normalize(
            r#"{"type":"item.completed","item":{"id":"i1","type":"agent_message","text":"patched the bug"}}"#,
        )
        .unwrap();
        assert!(n
            .normalize(r#"{"type":"turn.completed","summary":"Fixed the flaky test"}"#)
            .is_none());

        match n.completion() {
            AgentEvent::Completion {
                session_id,
                last_assistant,
                summary,
            } => {
                assert_eq!(session_id, "thread-7");
                assert_eq!(last_assistant.as_deref(), Some("patched the bug"));
                assert_eq!(summary.as_deref(), Some("Fixed the flaky test"));
            }
            other => panic!("Expected Completion, got {:?}", other),
        }
    }

    #[test]
    fn permission_request_maps_canonical_tool_name() {
        let mut n = normalizer();
        let event = n
            .normalize(
                r#"{"type":"permission_request","request_id":"perm-1","tool_name":"shell","input":{"command":"rm -r build"},"message":"Allow shell?"}"#,
            )
            .unwrap();
        match event {
            AgentEvent::PermissionRequest {
                request_id,
                tool_name,
                ..
            } => {
                assert_eq!(request_id, "perm-1");
                assert_eq!(tool_name, "execute");
            }
            other => panic!("Expected PermissionRequest, got {:?}", other),
        }
    }

    #[test]
    fn unknown_event_salvages_text_or_drops() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"telemetry.sample","message":"worker alive"}"#)
            .unwrap();
        assert_eq!(
            event,
            AgentEvent::assistant_text("caller-session", "worker alive")
        );
        assert!(n
            .normalize(r#"{"type":"telemetry.sample","value":3}"#)
            .is_none());
    }

    // ── worker lifecycle against a fake worker ─────────────────────

    #[cfg(unix)]
    fn fake_worker(dir: &tempfile::TempDir, body: &str) -> CodexConfig {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("fake-codex-worker");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        CodexConfig {
            worker_path: path.to_string_lossy().into_owned(),
            api_key: None,
            default_model: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_worker_exit_emits_completion() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_worker(
            &dir,
            concat!(
                r#"printf '{"type":"thread.started","thread_id":"thread-1"}\n'"#,
                "\n",
                r#"printf '{"type":"item.completed","item":{"id":"i1","type":"agent_message","text":"done"}}\n'"#,
                "\n",
                r#"printf '{"type":"turn.completed","summary":"Did the thing"}\n'"#,
            ),
        );

        let backend = CodexBackend::with_config(config);
        let stream = backend.query(QueryRequest::new("do it", "/tmp")).await;
        let events = stream.collect_all().await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], AgentEvent::Init { .. }));
        assert!(matches!(events[1], AgentEvent::AssistantTurn { .. }));
        match &events[2] {
            AgentEvent::Completion {
                session_id,
                last_assistant,
                summary,
            } => {
                assert_eq!(session_id, "thread-1");
                assert_eq!(last_assistant.as_deref(), Some("done"));
                assert_eq!(summary.as_deref(), Some("Did the thing"));
            }
            other => panic!("Expected Completion, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_turn_failure_ends_stream_with_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_worker(
            &dir,
            concat!(
                r#"printf '{"type":"thread.started","thread_id":"thread-2"}\n'"#,
                "\n",
                r#"printf '{"type":"turn.failed","error":{"message":"quota"}}\n'"#,
            ),
        );

        let backend = CodexBackend::with_config(config);
        let stream = backend.query(QueryRequest::new("do it", "/tmp")).await;
        let events = stream.collect_all().await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            AgentEvent::Result {
                outcome: QueryOutcome::Error,
                ..
            }
        ));
        // The failed turn is the terminal event even though the worker
        // exits cleanly afterwards: no trailing Completion.
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }
}
