//! Gate 14: CONFIDENCE CHECK (Tier 3, graduated).
//!
//! A composite risk read before edits: no test baseline this session,
//! the target still pending verification, stale memory, heavy churn on
//! the same file. Two or more fresh signals draw a warning; a repeat on
//! the same file escalates to a block. Signals already warned about this
//! session stay quiet.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use crate::state::{effective_memory_last_queried, normalize_path, now_epoch};
use anyhow::Result;

/// Signals needed to consider an edit risky.
pub const SIGNAL_THRESHOLD: usize = 2;
/// Per-file warnings tolerated before blocking.
pub const WARN_LIMIT: u32 = 1;
/// Memory staleness treated as a risk signal, seconds.
pub const STALE_MEMORY_SECS: f64 = 900.0;
/// Edit streak treated as churn.
pub const CHURN_STREAK: u32 = 5;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let Some(path) = ctx.target_path() else {
        return Ok(GateResult::Pass);
    };
    let normalized = normalize_path(path);
    let now = now_epoch();

    let mut signals: Vec<&'static str> = Vec::new();
    if !ctx.state.session_test_baseline {
        signals.push("no_test_baseline");
    }
    if ctx.state.pending_verification.iter().any(|p| *p == normalized)
        && ctx
            .state
            .verification_scores
            .get(&normalized)
            .copied()
            .unwrap_or(0)
            < 70
    {
        signals.push("unverified_pending_edit");
    }
    if now - effective_memory_last_queried(ctx.paths, ctx.state) > STALE_MEMORY_SECS {
        signals.push("memory_stale");
    }
    if ctx.state.edit_streak.get(&normalized).copied().unwrap_or(0) >= CHURN_STREAK {
        signals.push("edit_churn");
    }

    let fresh: Vec<&'static str> = signals
        .iter()
        .copied()
        .filter(|s| !ctx.state.confidence_warned_signals.iter().any(|w| w == s))
        .collect();

    if fresh.len() < SIGNAL_THRESHOLD {
        return Ok(GateResult::Pass);
    }

    for signal in &fresh {
        ctx.state.confidence_warned_signals.push(signal.to_string());
    }
    let warns = ctx
        .state
        .confidence_warnings_per_file
        .entry(normalized.clone())
        .or_insert(0);
    *warns += 1;
    let detail = fresh.join(", ");

    if *warns > WARN_LIMIT {
        Ok(GateResult::block(
            format!(
                "[GATE 14: CONFIDENCE CHECK] BLOCKED: editing {normalized} with low \
                 confidence (signals: {detail}). Establish a test baseline or verify \
                 pending edits before continuing."
            ),
            Severity::Error,
        ))
    } else {
        Ok(GateResult::warn(format!(
            "[GATE 14: CONFIDENCE CHECK] NOTICE: risky edit to {normalized} (signals: \
             {detail}). Consider running tests first."
        )))
    }
}
