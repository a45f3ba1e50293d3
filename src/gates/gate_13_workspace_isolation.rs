//! Gate 13: WORKSPACE ISOLATION (Tier 3).
//!
//! Parallel sessions coordinate through the shared claim registry: a file
//! freshly claimed by another session is off limits until the claim goes
//! stale.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use crate::state::{normalize_path, now_epoch, read_claims, CLAIM_TTL_SECS};
use anyhow::Result;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let Some(path) = ctx.target_path() else {
        return Ok(GateResult::Pass);
    };
    let normalized = normalize_path(path);

    let claims = read_claims(ctx.paths);
    let Some(claim) = claims.get(&normalized) else {
        return Ok(GateResult::Pass);
    };
    if claim.session_id == ctx.session_id {
        return Ok(GateResult::Pass);
    }
    if now_epoch() - claim.claimed_at >= CLAIM_TTL_SECS {
        return Ok(GateResult::Pass);
    }

    Ok(GateResult::block(
        format!(
            "[GATE 13: WORKSPACE ISOLATION] BLOCKED: {normalized} is claimed by session \
             '{}'. Pick a different file or wait for the claim to expire.",
            claim.session_id
        ),
        Severity::Error,
    ))
}
