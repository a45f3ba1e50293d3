//! Gate 5: PROOF BEFORE FIXED (Tier 2).
//!
//! Repeatedly re-editing a file that still awaits verification is the
//! signature of guess-and-check fixing. Once the per-file edit streak
//! reaches three with the verification score still below the graduation
//! threshold, further edits are held until evidence accumulates.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use crate::state::normalize_path;
use anyhow::Result;

/// Edits to a pending file tolerated before demanding evidence.
pub const STREAK_THRESHOLD: u32 = 3;
/// Verification score at which a file graduates.
pub const GRADUATION_SCORE: i64 = 70;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let Some(path) = ctx.target_path() else {
        return Ok(GateResult::Pass);
    };
    let normalized = normalize_path(path);

    if !ctx.state.pending_verification.iter().any(|p| *p == normalized) {
        return Ok(GateResult::Pass);
    }

    let streak = ctx.state.edit_streak.get(&normalized).copied().unwrap_or(0);
    let score = ctx
        .state
        .verification_scores
        .get(&normalized)
        .copied()
        .unwrap_or(0);

    if streak >= STREAK_THRESHOLD && score < GRADUATION_SCORE {
        return Ok(GateResult::block(
            format!(
                "[GATE 5: PROOF BEFORE FIXED] BLOCKED: {normalized} has been edited {streak} \
                 times without verification (score {score}/{GRADUATION_SCORE}). Run the tests \
                 or execute the file to accumulate evidence before editing again."
            ),
            Severity::Error,
        ));
    }
    Ok(GateResult::Pass)
}
