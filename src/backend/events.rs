//! Backend-agnostic canonical events.
//!
//! Every adapter translates its CLI's native output into this closed set of
//! variants. Hosts consume the stream without knowing which backend ran, and
//! the derives keep events wire-ready for whatever transport sits above us.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical tool-name vocabulary. Adapters map their backend's raw tool
/// names onto these, falling back to the raw name when unrecognized.
pub mod tool {
    pub const EXECUTE: &str = "execute";
    pub const READ_FILE: &str = "read_file";
    pub const WRITE_FILE: &str = "write_file";
    pub const EDIT_FILE: &str = "edit_file";
    pub const SEARCH: &str = "search";
    pub const LIST_FILES: &str = "list_files";
    pub const WEB_FETCH: &str = "web_fetch";
    pub const WEB_SEARCH: &str = "web_search";
}

/// How a query ended, per the backend's own success indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Success,
    Error,
    Cancelled,
}

/// Token accounting reported by a backend. Fields stay absent (not zero)
/// when the backend does not report them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

/// The smallest unit inside a turn. Blocks within one turn preserve the
/// order the backend produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        text: String,
    },
}

/// One increment of agent activity, normalized across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First event of a successful query. `session_id` is the backend's own
    /// session identifier, which doubles as the resume token where the
    /// backend supports resuming.
    Init {
        session_id: String,
        backend_id: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
    },
    /// Advisory status line; no semantic effect.
    Status { status: String },
    AssistantTurn {
        session_id: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
    },
    UserTurn {
        session_id: String,
        content: Vec<ContentBlock>,
    },
    /// Advisory; may arrive zero or many times per tool invocation.
    ToolProgress {
        tool_use_id: String,
        tool_name: String,
        #[serde(default)]
        elapsed_secs: Option<f64>,
    },
    /// Halts the turn's forward progress until answered via
    /// `Backend::respond_to_permission`.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: Value,
        message: String,
    },
    /// Terminal: the backend reported the query finished.
    Result {
        session_id: String,
        outcome: QueryOutcome,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Terminal: graceful worker exit, emitted by worker-backed adapters.
    Completion {
        session_id: String,
        #[serde(default)]
        last_assistant: Option<String>,
        #[serde(default)]
        summary: Option<String>,
    },
    /// Terminal: a transport- or protocol-level error, distinct from a
    /// backend-reported `Result { outcome: Error }`.
    Failure {
        session_id: String,
        message: String,
        #[serde(default)]
        code: Option<i32>,
    },
}

impl AgentEvent {
    /// Terminal events end a query; adapters emit exactly one and nothing
    /// after it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Result { .. } | AgentEvent::Completion { .. } | AgentEvent::Failure { .. }
        )
    }

    /// Convenience for a one-block assistant text turn.
    pub fn assistant_text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        AgentEvent::AssistantTurn {
            session_id: session_id.into(),
            content: vec![ContentBlock::Text { text: text.into() }],
            parent_tool_use_id: None,
            usage: None,
        }
    }
}
