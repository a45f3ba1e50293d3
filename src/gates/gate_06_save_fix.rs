//! Gate 6: SAVE VERIFIED FIX (Tier 2, graduated).
//!
//! Verified fixes, an accumulating error backlog, or a plan-mode exit
//! that was never captured all mean hard-won knowledge is about to
//! evaporate with the session. The gate warns twice, then blocks; a
//! successful `remember_this` resets the counter (handled by the
//! tracker).

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use anyhow::Result;

/// Warnings tolerated before the gate escalates to a block.
pub const WARN_LIMIT: u32 = 2;
/// Unlogged errors that trigger the nag.
pub const ERROR_BACKLOG_THRESHOLD: usize = 5;
/// Window after ExitPlanMode during which a save is expected, seconds.
pub const PLAN_EXIT_WINDOW_SECS: f64 = 600.0;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let mut reasons: Vec<String> = Vec::new();

    if !ctx.state.verified_fixes.is_empty() {
        reasons.push(format!(
            "{} verified fix(es) not yet saved to memory",
            ctx.state.verified_fixes.len()
        ));
    }
    if ctx.state.unlogged_errors.len() >= ERROR_BACKLOG_THRESHOLD {
        reasons.push(format!(
            "{} unlogged errors accumulated",
            ctx.state.unlogged_errors.len()
        ));
    }
    let now = crate::state::now_epoch();
    if ctx.state.last_exit_plan_mode > 0.0
        && now - ctx.state.last_exit_plan_mode <= PLAN_EXIT_WINDOW_SECS
        && ctx.state.memory_last_queried < ctx.state.last_exit_plan_mode
    {
        reasons.push("plan-mode exit not captured to memory".to_string());
    }

    if reasons.is_empty() {
        return Ok(GateResult::Pass);
    }

    ctx.state.gate6_warn_count += 1;
    let detail = reasons.join("; ");
    let remedy = "Call mcp__memory__remember_this with the fix summary to clear this.";

    if ctx.state.gate6_warn_count > WARN_LIMIT {
        Ok(GateResult::block(
            format!("[GATE 6: SAVE VERIFIED FIX] BLOCKED after repeated warnings: {detail}. {remedy}"),
            Severity::Error,
        ))
    } else {
        Ok(GateResult::warn(format!(
            "[GATE 6: SAVE VERIFIED FIX] NOTICE ({}/{}): {detail}. {remedy}",
            ctx.state.gate6_warn_count, WARN_LIMIT
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::event::EventKind;
    use crate::state::{now_epoch, SessionState};
    use serde_json::json;

    fn run(state: &mut SessionState) -> GateResult {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        let input = json!({"file_path": "/a.py"});
        let mut ctx = GateCtx {
            tool_name: "Edit",
            tool_input: &input,
            state,
            event: EventKind::PreToolUse,
            paths: &paths,
            session_id: "test",
        };
        check(&mut ctx).unwrap()
    }

    #[test]
    fn clean_state_passes_without_counting() {
        let mut state = SessionState::default();
        assert_eq!(run(&mut state), GateResult::Pass);
        assert_eq!(state.gate6_warn_count, 0);
    }

    #[test]
    fn warns_twice_then_blocks() {
        let mut state = SessionState::default();
        state.verified_fixes.push("/src/a.py".to_string());

        assert!(matches!(run(&mut state), GateResult::Warn { .. }));
        assert!(matches!(run(&mut state), GateResult::Warn { .. }));
        let third = run(&mut state);
        assert!(third.is_blocking());
        assert_eq!(state.gate6_warn_count, 3);
    }

    #[test]
    fn error_backlog_triggers_the_nag() {
        let mut state = SessionState::default();
        state.unlogged_errors = (0..ERROR_BACKLOG_THRESHOLD)
            .map(|i| format!("err{i}"))
            .collect();
        let result = run(&mut state);
        assert!(result.message().unwrap().contains("unlogged errors"));
    }

    #[test]
    fn uncaptured_plan_exit_triggers_the_nag() {
        let mut state = SessionState::default();
        state.last_exit_plan_mode = now_epoch();
        state.memory_last_queried = state.last_exit_plan_mode - 100.0;
        let result = run(&mut state);
        assert!(result.message().unwrap().contains("plan-mode exit"));
    }

    #[test]
    fn memory_save_after_plan_exit_satisfies() {
        let mut state = SessionState::default();
        state.last_exit_plan_mode = now_epoch() - 10.0;
        state.memory_last_queried = now_epoch();
        assert_eq!(run(&mut state), GateResult::Pass);
    }
}
