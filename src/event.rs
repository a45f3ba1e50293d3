//! Host event protocol.
//!
//! Each invocation receives one JSON object on stdin:
//!
//! ```text
//! PreToolUse  : { session_id, tool_name, tool_input }
//! PostToolUse : { session_id, tool_name, tool_input, tool_response? }
//! SessionEnd  : { session_id, transcript_path?, reason? }
//! ```
//!
//! Exit codes back to the host: 0 = pass, 2 = block. The tracker and
//! session-end hook always exit 0.

use serde::Deserialize;
use serde_json::Value;

/// Which hook fired this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PreToolUse,
    PostToolUse,
    SessionEnd,
}

/// A tool-call event from the host.
#[derive(Debug, Clone, Deserialize)]
pub struct HookEvent {
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Option<Value>,
}

/// A session-teardown event from the host.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionEndEvent {
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_session_id() -> String {
    "main".to_string()
}

/// Tools that bypass the gate pipeline entirely (pure reads, user
/// prompting, task bookkeeping). WebFetch/WebSearch are listed here but
/// still run injection defense — see the dispatcher.
pub const ALWAYS_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "WebFetch",
    "WebSearch",
    "AskUserQuestion",
    "EnterPlanMode",
    "ExitPlanMode",
    "TaskCreate",
    "TaskUpdate",
    "TaskList",
    "TaskGet",
    "TeamCreate",
    "TeamDelete",
    "SendMessage",
    "TaskStop",
];

/// Tools whose inputs still get an injection scan while bypassing the
/// rest of the pipeline.
pub const INJECTION_SCAN_TOOLS: &[&str] = &["WebFetch", "WebSearch"];

/// MCP memory tool prefixes (always allowed, and "safe" for gate 17).
pub const MEMORY_TOOL_PREFIXES: &[&str] = &["mcp__memory__", "mcp_memory_"];

/// MCP analytics tool prefix (read-only, always allowed).
pub const ANALYTICS_TOOL_PREFIX: &str = "mcp__analytics__";

/// Write-like tools for which an empty `tool_input` fails closed.
pub const WRITE_LIKE_TOOLS: &[&str] = &["Bash", "Edit", "Write", "NotebookEdit"];

pub fn is_memory_tool(tool_name: &str) -> bool {
    MEMORY_TOOL_PREFIXES
        .iter()
        .any(|p| tool_name.starts_with(p))
}

pub fn is_analytics_tool(tool_name: &str) -> bool {
    tool_name.starts_with(ANALYTICS_TOOL_PREFIX)
}

pub fn is_always_allowed(tool_name: &str) -> bool {
    ALWAYS_ALLOWED_TOOLS.contains(&tool_name)
        || is_memory_tool(tool_name)
        || is_analytics_tool(tool_name)
}

/// True if `tool_name` returns external/untrusted content (gate 17 scope).
pub fn is_external_tool(tool_name: &str) -> bool {
    if INJECTION_SCAN_TOOLS.contains(&tool_name) {
        return true;
    }
    if tool_name.starts_with("mcp__") || tool_name.starts_with("mcp_") {
        return !is_memory_tool(tool_name);
    }
    false
}

/// True for UUID-prefixed session ids, which identify subagent sessions
/// (`8 hex chars` + `-`). Subagents get a fresh memory-first window on
/// first sight without a full boot sequence.
pub fn is_subagent_session(session_id: &str) -> bool {
    let bytes = session_id.as_bytes();
    bytes.len() > 8
        && bytes[8] == b'-'
        && bytes[..8].iter().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

impl HookEvent {
    /// Parse an event from a JSON string. Callers decide fail-open vs
    /// fail-closed on error.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The primary file path the tool operates on, if any.
    pub fn file_path(&self) -> Option<&str> {
        self.tool_input
            .get("file_path")
            .or_else(|| self.tool_input.get("notebook_path"))
            .and_then(Value::as_str)
    }
}

impl SessionEndEvent {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
