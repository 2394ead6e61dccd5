//! Backend adapter contract shared by all CLI integrations.
//!
//! Each adapter drives one external coding-agent binary: it builds the
//! tool's command line from a generic [`QueryRequest`], supervises the
//! spawned process, and normalizes the tool's output protocol into
//! [`events::AgentEvent`]s. Callers interact only with this contract and
//! the [`registry::BackendRegistry`].

pub mod claude;
pub mod codex;
pub mod events;
pub mod gemini;
pub mod registry;
pub mod shared;

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use events::AgentEvent;

/// Immutable descriptor for one backend implementation. Built once at
/// adapter construction, never mutated.
#[derive(Debug, Clone)]
pub struct BackendIdentity {
    pub id: String,
    pub name: String,
    pub models: Vec<String>,
    pub default_model: String,
    /// Whether the backend accepts permission responses over its control
    /// channel while running. When false, `respond_to_permission` is a
    /// documented no-op and approval is decided at spawn time via flags.
    pub supports_interactive_permissions: bool,
    pub supports_resume: bool,
}

/// Result of probing the host for a backend's executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub installed: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// How tool invocations are approved for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Auto-approve everything the backend asks for.
    Auto,
    /// Surface permission requests to the caller and wait for answers.
    #[default]
    Confirm,
    /// No auto-approval; the backend's non-interactive default applies.
    Deny,
}

/// Caller-supplied options for one query. Immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub prompt: String,
    /// Working directory the backend process runs in.
    pub cwd: String,
    /// Caller-chosen correlation id, also used for synthesized events when
    /// the backend has not yet reported its own session id.
    pub session_id: String,
    pub model: Option<String>,
    /// Opaque backend-defined token continuing a prior conversation.
    pub resume: Option<String>,
    pub permission_mode: PermissionMode,
    /// Tool names the backend may run without asking.
    pub allowed_tools: Vec<String>,
    /// Backend-specific options passed through as extra flags.
    pub backend_options: HashMap<String, Value>,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            cwd: cwd.into(),
            session_id: Uuid::new_v4().to_string(),
            model: None,
            resume: None,
            permission_mode: PermissionMode::default(),
            allowed_tools: Vec::new(),
            backend_options: HashMap::new(),
        }
    }
}

/// Answer to a [`AgentEvent::PermissionRequest`]. Serializes to the wire
/// field names the control channel expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub request_id: String,
    pub approved: bool,
    /// Approve every later request for the same tool in this query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_all: Option<bool>,
}

/// Single-consumer stream of canonical events for one query.
///
/// Push-driven: the adapter's reader task feeds an unbounded queue, so a
/// slow consumer never stalls the child's stdout drain and never loses
/// events. Dropping the stream does NOT kill the process; only
/// [`Backend::cancel`] does.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<AgentEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<AgentEvent>) -> Self {
        Self { rx }
    }

    /// Await the next event; `None` once the query has terminated.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Drain the stream to completion.
    pub async fn collect_all(mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl futures::Stream for EventStream {
    type Item = AgentEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Contract every backend adapter satisfies.
#[async_trait]
pub trait Backend: Send + Sync {
    fn identity(&self) -> &BackendIdentity;

    fn id(&self) -> &str {
        &self.identity().id
    }

    fn name(&self) -> &str {
        &self.identity().name
    }

    /// Probe the host for the backend's executable and version. Never
    /// errors; any failure reports `installed: false`.
    async fn detect(&self) -> BackendInfo;

    /// Run one query. Spawn failures surface as the stream's first and only
    /// event, so callers have a single consumption path.
    async fn query(&self, request: QueryRequest) -> EventStream;

    /// Relay a permission decision to the active process. No-op when no
    /// process is active, when the request id is unknown or already
    /// answered, or when the backend lacks interactive permissions.
    async fn respond_to_permission(&self, response: PermissionResponse);

    /// Kill the active subprocess and clear adapter-held process state.
    /// Idempotent; safe to call from any task, repeatedly, or when nothing
    /// is running.
    async fn cancel(&self);
}
