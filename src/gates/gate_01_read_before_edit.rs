//! Gate 1: READ BEFORE EDIT (Tier 1).
//!
//! Editing a file the agent has never read is how context-free damage
//! happens. Edit and NotebookEdit always require a prior Read of the
//! target; Write requires one only when the target already exists (a
//! brand-new file has nothing to read).

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use crate::state::normalize_path;
use anyhow::Result;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let Some(path) = ctx.target_path() else {
        return Ok(GateResult::Pass);
    };
    let normalized = normalize_path(path);

    if ctx.tool_name == "Write" && !std::path::Path::new(&normalized).exists() {
        return Ok(GateResult::Pass);
    }

    if ctx.state.files_read.iter().any(|p| *p == normalized) {
        return Ok(GateResult::Pass);
    }

    Ok(GateResult::block(
        format!(
            "[GATE 1: READ BEFORE EDIT] BLOCKED: You must Read {normalized} before editing it. \
             Run Read on the file, then retry this edit."
        ),
        Severity::Error,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::event::EventKind;
    use crate::state::SessionState;
    use serde_json::json;

    fn run(tool: &str, input: serde_json::Value, state: &mut SessionState) -> GateResult {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        let mut ctx = GateCtx {
            tool_name: tool,
            tool_input: &input,
            state,
            event: EventKind::PreToolUse,
            paths: &paths,
            session_id: "test",
        };
        check(&mut ctx).unwrap()
    }

    #[test]
    fn edit_without_read_blocks() {
        let mut state = SessionState::default();
        let result = run("Edit", json!({"file_path": "/src/a.py", "old_string": "x"}), &mut state);
        assert!(result.is_blocking());
        assert!(result.message().unwrap().contains("READ BEFORE EDIT"));
    }

    #[test]
    fn edit_after_read_passes() {
        let mut state = SessionState::default();
        state.files_read.push("/src/a.py".to_string());
        let result = run("Edit", json!({"file_path": "/src/a.py", "old_string": "x"}), &mut state);
        assert_eq!(result, GateResult::Pass);
    }

    #[test]
    fn path_normalization_prevents_dot_segment_bypass() {
        let mut state = SessionState::default();
        state.files_read.push("/src/a.py".to_string());
        let result = run("Edit", json!({"file_path": "/src/./a.py"}), &mut state);
        assert_eq!(result, GateResult::Pass);
    }

    #[test]
    fn write_to_new_file_passes() {
        let mut state = SessionState::default();
        let result = run(
            "Write",
            json!({"file_path": "/nonexistent/brand_new.rs", "content": "x"}),
            &mut state,
        );
        assert_eq!(result, GateResult::Pass);
    }

    #[test]
    fn write_over_existing_file_requires_read() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("present.rs");
        std::fs::write(&existing, "fn main() {}").unwrap();

        let mut state = SessionState::default();
        let result = run(
            "Write",
            json!({"file_path": existing.to_str().unwrap(), "content": "x"}),
            &mut state,
        );
        assert!(result.is_blocking());
    }

    #[test]
    fn notebook_edit_uses_notebook_path() {
        let mut state = SessionState::default();
        let result = run("NotebookEdit", json!({"notebook_path": "/nb.ipynb"}), &mut state);
        assert!(result.is_blocking());
    }
}
