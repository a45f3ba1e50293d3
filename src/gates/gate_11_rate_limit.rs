//! Gate 11: RATE LIMIT (Tier 3, universal).
//!
//! A runaway loop shows up as a burst of tool calls. The tracker appends
//! a timestamp per completed call; this gate only counts the rolling
//! window and refuses new calls past the cap.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use crate::state::now_epoch;
use anyhow::Result;

/// Rolling window length, seconds.
pub const WINDOW_SECS: f64 = 60.0;
/// Calls allowed inside the window.
pub const WINDOW_LIMIT: usize = 30;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let cutoff = now_epoch() - WINDOW_SECS;
    let recent = ctx
        .state
        .rate_window_timestamps
        .iter()
        .filter(|t| **t >= cutoff)
        .count();

    if recent < WINDOW_LIMIT {
        return Ok(GateResult::Pass);
    }

    Ok(GateResult::block(
        format!(
            "[GATE 11: RATE LIMIT] BLOCKED: {recent} tool calls in the last \
             {WINDOW_SECS:.0}s (limit {WINDOW_LIMIT}). Rolling window exceeded — pause, \
             re-plan, and resume deliberately."
        ),
        Severity::Error,
    ))
}
