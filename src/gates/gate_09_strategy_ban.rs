//! Gate 9: STRATEGY BAN (Tier 2).
//!
//! A strategy that has burned its retry budget (three recorded failures,
//! or an explicit ban from fix history) is refused until the causal
//! chain moves on to a different approach.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use anyhow::Result;

/// Failures after which a strategy is considered banned.
pub const BAN_THRESHOLD: u32 = 3;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let strategy = ctx.state.current_strategy_id.as_str();
    if strategy.is_empty() {
        return Ok(GateResult::Pass);
    }

    let Some(ban) = ctx.state.active_bans.get(strategy) else {
        return Ok(GateResult::Pass);
    };
    if ban.fail_count < BAN_THRESHOLD {
        return Ok(GateResult::Pass);
    }

    Ok(GateResult::block(
        format!(
            "[GATE 9: STRATEGY BAN] BLOCKED: strategy '{strategy}' has failed {} time(s) and \
             is banned. Record a different strategy with record_attempt before editing.",
            ban.fail_count
        ),
        Severity::Error,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::event::EventKind;
    use crate::state::{BanRecord, SessionState};
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
    fn banned_strategy_blocks() {
        let mut state = SessionState::default();
        state.current_strategy_id = "retry-harder".to_string();
        state
            .active_bans
            .insert("retry-harder".to_string(), BanRecord::at_threshold(0.0));
        let result = run(&mut state);
        assert!(result.is_blocking());
        assert!(result.message().unwrap().contains("retry-harder"));
    }

    #[test]
    fn strategy_below_budget_passes() {
        let mut state = SessionState::default();
        state.current_strategy_id = "retry-harder".to_string();
        state.active_bans.insert(
            "retry-harder".to_string(),
            BanRecord {
                fail_count: 2,
                first_failed: 0.0,
                last_failed: 0.0,
            },
        );
        assert_eq!(run(&mut state), GateResult::Pass);
    }

    #[test]
    fn no_active_strategy_passes() {
        let mut state = SessionState::default();
        state
            .active_bans
            .insert("other".to_string(), BanRecord::at_threshold(0.0));
        assert_eq!(run(&mut state), GateResult::Pass);
    }
}
