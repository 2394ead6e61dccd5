//! Process plumbing shared by the backend adapters.
//!
//! Each adapter reimplements its own supervision loop, but the pieces that
//! never vary live here: the kill/control handle, the stdout line buffer,
//! the stderr drain, and the PATH/version probe behind `detect()`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BackendIdentity, BackendInfo, PermissionResponse};

/// Hard ceiling on a `detect()` version probe. A binary that exists but
/// misbehaves must not hang detection.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

// ── Process handle ────────────────────────────────────────────────

/// Handle to a running backend process. `kill()` terminates it on cancel;
/// `write_line()` feeds the control channel (stdin) for backends that take
/// permission responses while running.
pub struct ProcessHandle {
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    cancelled: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn new(
        child: Arc<Mutex<Option<Child>>>,
        stdin: Arc<Mutex<Option<ChildStdin>>>,
        cancelled: Arc<AtomicBool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            child,
            stdin,
            cancelled,
            _task: task,
        }
    }

    /// Kill the underlying process. Idempotent; the reader task observes the
    /// cancellation flag and emits the cancelled terminal event.
    pub async fn kill(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill backend process: {}", e);
            } else {
                info!("Backend process killed");
            }
        }
    }

    /// Write one line to the child's control channel.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| anyhow!("control channel is closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Per-adapter state for the one in-flight query: the process handle plus
/// the permission requests that have been surfaced but not yet answered.
pub struct ActiveQuery {
    pub handle: ProcessHandle,
    pub pending_permissions: Arc<Mutex<HashSet<String>>>,
}

/// Answer a pending permission request over the active query's control
/// channel. Unknown or already-answered request ids are logged and ignored;
/// they never crash the query.
pub async fn respond_via_control_channel(
    active: &Mutex<Option<ActiveQuery>>,
    response: &PermissionResponse,
) {
    let guard = active.lock().await;
    let Some(active) = guard.as_ref() else {
        debug!("Permission response with no active query; ignoring");
        return;
    };

    {
        let mut pending = active.pending_permissions.lock().await;
        if !pending.remove(&response.request_id) {
            warn!(
                "Ignoring permission response for unknown or answered request: {}",
                response.request_id
            );
            return;
        }
    }

    let line = permission_control_line(response);
    if let Err(e) = active.handle.write_line(&line).await {
        warn!("Failed to write permission response: {}", e);
    }
}

/// Kill the active query's process and clear the adapter's process state.
/// A no-op when nothing is running.
pub async fn cancel_active(active: &Mutex<Option<ActiveQuery>>) {
    let taken = active.lock().await.take();
    match taken {
        Some(query) => query.handle.kill().await,
        None => debug!("Cancel with no active query; ignoring"),
    }
}

/// Control-channel line for a permission decision:
/// `{"type":"permission_response","requestId":...,"approved":...,"approveAll":...}`.
pub fn permission_control_line(response: &PermissionResponse) -> String {
    let mut value = serde_json::to_value(response).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = value {
        map.insert(
            "type".to_string(),
            Value::String("permission_response".to_string()),
        );
    }
    value.to_string()
}

// ── Stdout line assembly ──────────────────────────────────────────

/// Growable stdout buffer. Chunks append; complete lines split off; the
/// trailing partial stays buffered until the next chunk or `finish()`.
/// Byte-oriented so a chunk boundary inside a UTF-8 sequence is harmless.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=idx).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush the trailing unterminated line. Called once at process exit so
    /// a result embedded in a final newline-less line is not dropped.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}

/// Drain stderr line-by-line so the child never blocks on a full pipe.
/// Diagnostic only; stderr is never parsed as protocol.
pub fn spawn_stderr_drain(stderr: ChildStderr, label: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                debug!("[{} stderr] {}", label, line.trim());
            }
        }
    })
}

// ── Detection ─────────────────────────────────────────────────────

/// Locate `program` on PATH. A path with separators is checked directly.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

/// Run `<program> --version` under [`PROBE_TIMEOUT`], returning the first
/// non-empty output line. Any failure (timeout included) yields `None`.
pub async fn probe_version(program: &Path) -> Option<String> {
    let result = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("Version probe for {:?} failed to run: {}", program, e);
            return None;
        }
        Err(_) => {
            warn!("Version probe for {:?} timed out", program);
            return None;
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}

/// Shared `detect()` implementation: PATH lookup plus version probe. Never
/// errors; anything that goes wrong reports `installed: false`.
pub async fn detect_executable(
    identity: &BackendIdentity,
    description: &str,
    program: &str,
) -> BackendInfo {
    let path = find_in_path(program);
    let (installed, version, path) = match path {
        Some(path) => {
            let version = probe_version(&path).await;
            (true, version, Some(path.to_string_lossy().into_owned()))
        }
        None => (false, None, None),
    };

    BackendInfo {
        id: identity.id.clone(),
        name: identity.name.clone(),
        description: description.to_string(),
        installed,
        version,
        path,
    }
}

/// Append the request's backend-specific option bag as extra flags.
/// `true` becomes a bare flag, `false` is skipped, everything else becomes
/// `--key value`.
pub fn apply_backend_options(
    cmd: &mut Command,
    options: &std::collections::HashMap<String, Value>,
) {
    for (key, value) in options {
        match value {
            Value::Bool(true) | Value::Null => {
                cmd.arg(format!("--{}", key));
            }
            Value::Bool(false) => {}
            Value::String(s) => {
                cmd.arg(format!("--{}", key)).arg(s);
            }
            other => {
                cmd.arg(format!("--{}", key)).arg(other.to_string());
            }
        }
    }
}
