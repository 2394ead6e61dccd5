//! Claude Code backend: spawns the Claude CLI and normalizes its
//! stream-json output.

pub mod client;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::backend::events::{tool, AgentEvent, ContentBlock, QueryOutcome};
use crate::backend::shared::{
    self, spawn_stderr_drain, ActiveQuery, LineBuffer, ProcessHandle,
};
use crate::backend::{
    Backend, BackendIdentity, BackendInfo, EventStream, PermissionResponse, QueryRequest,
};

pub use client::{ClaudeConfig, ClaudeEvent};

const DESCRIPTION: &str = "Anthropic's Claude Code CLI";

pub struct ClaudeBackend {
    identity: BackendIdentity,
    config: Arc<RwLock<ClaudeConfig>>,
    active: Arc<Mutex<Option<ActiveQuery>>>,
}

impl ClaudeBackend {
    pub fn new() -> Self {
        Self::with_config(ClaudeConfig::default())
    }

    pub fn with_config(config: ClaudeConfig) -> Self {
        Self {
            identity: BackendIdentity {
                id: "claude".to_string(),
                name: "Claude Code".to_string(),
                models: vec![
                    "claude-opus-4-6".to_string(),
                    "claude-sonnet-4-5".to_string(),
                    "claude-haiku-4-5".to_string(),
                ],
                default_model: "claude-sonnet-4-5".to_string(),
                supports_interactive_permissions: true,
                supports_resume: true,
            },
            config: Arc::new(RwLock::new(config)),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Update the backend configuration.
    pub async fn update_config(&self, config: ClaudeConfig) {
        let mut cfg = self.config.write().await;
        *cfg = config;
    }

    /// Get the current configuration.
    pub async fn get_config(&self) -> ClaudeConfig {
        self.config.read().await.clone()
    }
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for ClaudeBackend {
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
            "Spawning Claude CLI: cwd={}, model={:?}, resume={:?}",
            request.cwd, request.model, request.resume
        );

        let mut cmd = client::build_command(&config, &request);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn Claude CLI: {}", e);
                let _ = tx.send(AgentEvent::Failure {
                    session_id: request.session_id.clone(),
                    message: format!(
                        "Failed to spawn Claude CLI: {}. Is it installed at '{}'?",
                        e, config.cli_path
                    ),
                    code: None,
                });
                return EventStream::new(rx);
            }
        };

        // The prompt goes to stdin; the pipe stays open afterwards as the
        // permission-response control channel.
        let stdin_slot = Arc::new(Mutex::new(None));
        if let Some(mut stdin) = child.stdin.take() {
            let write = async {
                stdin.write_all(request.prompt.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                error!("Failed to write prompt to Claude stdin: {}", e);
            }
            *stdin_slot.lock().await = Some(stdin);
        }

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = tx.send(AgentEvent::Failure {
                    session_id: request.session_id.clone(),
                    message: "Failed to capture Claude stdout".to_string(),
                    code: None,
                });
                return EventStream::new(rx);
            }
        };
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr, "claude");
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

/// Read stdout to exhaustion, normalizing line by line, then synthesize the
/// terminal event the stream still owes.
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
    let mut terminated = false;

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in buf.push(&chunk[..n]) {
                    deliver(&line, &session_id, &pending, &tx, &mut terminated).await;
                }
            }
        }
    }
    // A result embedded in a final unterminated line must not be dropped.
    if let Some(line) = buf.finish() {
        deliver(&line, &session_id, &pending, &tx, &mut terminated).await;
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
                    message: format!("Claude CLI exited with status {}", s),
                    code: s.code(),
                },
                None => AgentEvent::Failure {
                    session_id,
                    message: "Claude CLI terminated before reporting a result".to_string(),
                    code: None,
                },
            }
        };
        let _ = tx.send(event);
    }
}

async fn deliver(
    line: &str,
    session_id: &str,
    pending: &Mutex<HashSet<String>>,
    tx: &mpsc::UnboundedSender<AgentEvent>,
    terminated: &mut bool,
) {
    let Some(event) = normalize_line(line, session_id) else {
        return;
    };
    if *terminated {
        debug!("Dropping Claude event after terminal: {:?}", event);
        return;
    }
    if let AgentEvent::PermissionRequest { ref request_id, .. } = event {
        pending.lock().await.insert(request_id.clone());
    }
    let terminal = event.is_terminal();
    if tx.send(event).is_err() {
        // Keep draining stdout so the child never blocks on a full pipe.
        debug!("Event receiver dropped; continuing to drain Claude stdout");
    }
    if terminal {
        *terminated = true;
    }
}

/// Normalize one stdout line into at most one canonical event.
fn normalize_line(line: &str, fallback_session: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ClaudeEvent>(trimmed) {
        Ok(event) => normalize_event(event),
        // Parsed JSON of an unrecognized shape degrades to recoverable
        // text; a non-JSON line is interleaved progress output and is
        // surfaced verbatim.
        Err(_) => match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => salvage_text(&value)
                .map(|text| AgentEvent::assistant_text(fallback_session, text)),
            Err(_) => Some(AgentEvent::assistant_text(fallback_session, trimmed)),
        },
    }
}

fn normalize_event(event: ClaudeEvent) -> Option<AgentEvent> {
    match event {
        ClaudeEvent::System(sys) => {
            if sys.subtype == "init" {
                Some(AgentEvent::Init {
                    session_id: sys.session_id,
                    backend_id: "claude".to_string(),
                    model: sys.model,
                    cwd: sys.cwd,
                    tools: sys.tools,
                })
            } else {
                Some(AgentEvent::Status {
                    status: sys.subtype,
                })
            }
        }
        ClaudeEvent::Assistant(evt) => {
            let content = map_blocks(evt.message.content);
            if content.is_empty() {
                return None;
            }
            Some(AgentEvent::AssistantTurn {
                session_id: evt.session_id,
                content,
                parent_tool_use_id: evt.parent_tool_use_id,
                usage: evt.message.usage,
            })
        }
        ClaudeEvent::User(evt) => {
            let blocks = evt.message.content;
            // The CLI echoes the prompt back as an all-text user message;
            // re-emitting it would duplicate what the caller already shows.
            if blocks.is_empty()
                || blocks
                    .iter()
                    .all(|block| matches!(block, client::RawBlock::Text { .. }))
            {
                return None;
            }
            Some(AgentEvent::UserTurn {
                session_id: evt.session_id,
                content: map_blocks(blocks),
            })
        }
        ClaudeEvent::ToolProgress(progress) => Some(AgentEvent::ToolProgress {
            tool_use_id: progress.tool_use_id,
            tool_name: canonical_tool_name(&progress.tool_name),
            elapsed_secs: progress.elapsed_seconds,
        }),
        ClaudeEvent::PermissionRequest(req) => Some(AgentEvent::PermissionRequest {
            request_id: req.request_id,
            tool_name: canonical_tool_name(&req.tool_name),
            input: req.input,
            message: req.message.unwrap_or_default(),
        }),
        ClaudeEvent::Result(res) => {
            let is_error = res.is_error || res.subtype == "error";
            let error = is_error.then(|| res.error_message());
            Some(AgentEvent::Result {
                session_id: res.session_id,
                outcome: if is_error {
                    QueryOutcome::Error
                } else {
                    QueryOutcome::Success
                },
                cost_usd: res.total_cost_usd,
                duration_ms: res.duration_ms,
                num_turns: res.num_turns,
                error,
            })
        }
    }
}

fn map_blocks(blocks: Vec<client::RawBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .map(|block| match block {
            client::RawBlock::Text { text } => ContentBlock::Text { text },
            client::RawBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
                id,
                name: canonical_tool_name(&name),
                input,
            },
            client::RawBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => ContentBlock::ToolResult {
                tool_use_id,
                content: content.into(),
                is_error,
            },
            client::RawBlock::Thinking { thinking } => ContentBlock::Thinking { text: thinking },
        })
        .collect()
}

/// Claude tool names onto the canonical vocabulary; unrecognized names pass
/// through unchanged.
fn canonical_tool_name(raw: &str) -> String {
    let mapped = match raw {
        "Bash" => tool::EXECUTE,
        "Read" => tool::READ_FILE,
        "Write" => tool::WRITE_FILE,
        "Edit" | "MultiEdit" | "NotebookEdit" => tool::EDIT_FILE,
        "Grep" => tool::SEARCH,
        "Glob" | "LS" => tool::LIST_FILES,
        "WebFetch" => tool::WEB_FETCH,
        "WebSearch" => tool::WEB_SEARCH,
        _ => return raw.to_string(),
    };
    mapped.to_string()
}

fn salvage_text(value: &Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
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

/// Create a registry entry for the Claude Code backend.
pub fn registry_entry(config: ClaudeConfig) -> Arc<dyn Backend> {
    Arc::new(ClaudeBackend::with_config(config))
}
