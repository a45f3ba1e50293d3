//! Gate 3: TEST BEFORE DEPLOY (Tier 1).
//!
//! Deploy-like commands require a passing test run inside the freshness
//! window. The hint names the last test command when one is known.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use crate::state::now_epoch;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

/// How recent a passing test run must be, seconds.
pub const TEST_FRESHNESS_SECS: f64 = 1800.0;

static DEPLOY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bdeploy\b",
        r"(?i)kubectl\s+apply",
        r"(?i)terraform\s+apply",
        r"(?i)helm\s+(?:install|upgrade)",
        r"(?i)docker\s+push",
        r"(?i)npm\s+publish",
        r"(?i)cargo\s+publish",
        r"(?i)fly\s+deploy",
        r"(?i)git\s+push\s+\S+\s+(?:prod|production|release)\b",
    ]
    .iter()
    .filter_map(|pat| Regex::new(pat).ok())
    .collect()
});

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let command = ctx.input_str("command");
    if command.is_empty() || !DEPLOY_PATTERNS.iter().any(|re| re.is_match(command)) {
        return Ok(GateResult::Pass);
    }

    let now = now_epoch();
    let fresh = ctx.state.last_test_run > 0.0
        && now - ctx.state.last_test_run <= TEST_FRESHNESS_SECS;
    let passing = ctx.state.last_test_exit_code == Some(0);

    if fresh && passing {
        return Ok(GateResult::Pass);
    }

    let hint = if ctx.state.last_test_command.is_empty() {
        "Run the test suite first, then retry the deploy.".to_string()
    } else if !passing {
        format!(
            "Last test run failed (`{}`). Fix the failures and re-run before deploying.",
            ctx.state.last_test_command
        )
    } else {
        format!(
            "Last test run is stale. Re-run `{}` and retry the deploy.",
            ctx.state.last_test_command
        )
    };

    Ok(GateResult::block(
        format!("[GATE 3: TEST BEFORE DEPLOY] BLOCKED: deploy without a recent passing test run. {hint}"),
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

    fn run(command: &str, state: &mut SessionState) -> GateResult {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        let input = json!({ "command": command });
        let mut ctx = GateCtx {
            tool_name: "Bash",
            tool_input: &input,
            state,
            event: EventKind::PreToolUse,
            paths: &paths,
            session_id: "test",
        };
        check(&mut ctx).unwrap()
    }

    #[test]
    fn deploy_without_tests_blocks() {
        let mut state = SessionState::default();
        let result = run("kubectl apply -f prod.yaml", &mut state);
        assert!(result.is_blocking());
        assert!(result.message().unwrap().contains("TEST BEFORE DEPLOY"));
    }

    #[test]
    fn deploy_after_fresh_passing_tests_passes() {
        let mut state = SessionState::default();
        state.last_test_run = now_epoch();
        state.last_test_exit_code = Some(0);
        assert_eq!(run("./scripts/deploy.sh staging", &mut state), GateResult::Pass);
    }

    #[test]
    fn failing_tests_still_block_deploy() {
        let mut state = SessionState::default();
        state.last_test_run = now_epoch();
        state.last_test_exit_code = Some(1);
        state.last_test_command = "cargo test".to_string();
        let result = run("cargo publish", &mut state);
        assert!(result.is_blocking());
        assert!(result.message().unwrap().contains("cargo test"));
    }

    #[test]
    fn stale_tests_block_deploy() {
        let mut state = SessionState::default();
        state.last_test_run = now_epoch() - TEST_FRESHNESS_SECS - 10.0;
        state.last_test_exit_code = Some(0);
        assert!(run("terraform apply", &mut state).is_blocking());
    }

    #[test]
    fn ordinary_commands_pass() {
        let mut state = SessionState::default();
        assert_eq!(run("git push origin feature", &mut state), GateResult::Pass);
        assert_eq!(run("cargo build", &mut state), GateResult::Pass);
    }
}
