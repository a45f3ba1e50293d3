//! Gate 15: CAUSAL CHAIN (Tier 2).
//!
//! After a test failure, editing blind repeats past mistakes. While the
//! session is actively fixing an error, edits require a
//! `query_fix_history` call made after the failure was observed.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use anyhow::Result;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    if !ctx.state.fixing_error {
        return Ok(GateResult::Pass);
    }
    let Some(failure) = &ctx.state.recent_test_failure else {
        return Ok(GateResult::Pass);
    };
    if ctx.state.fix_history_queried >= failure.timestamp {
        return Ok(GateResult::Pass);
    }

    Ok(GateResult::block(
        format!(
            "[GATE 15: CAUSAL CHAIN] BLOCKED: tests failed ({}) and fix history has not \
             been consulted since. Call mcp__memory__query_fix_history for this error \
             before editing.",
            failure.pattern
        ),
        Severity::Error,
    ))
}
