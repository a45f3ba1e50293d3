//! Gate 4: MEMORY FIRST (Tier 2).
//!
//! Edits and subagent launches require a recent memory query so prior
//! fixes and known pitfalls inform the work. The effective timestamp
//! combines per-session state with the worker-written disk sideband, so
//! a query made through the MCP server counts even before the tracker
//! has promoted it.
//!
//! When the memory subsystem has never been seen at all (no sideband on
//! disk, no query this session) the gate degrades to a warning — a
//! missing external collaborator is never fatal.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use crate::state::{effective_memory_last_queried, now_epoch};
use anyhow::Result;

/// How recent the last memory query must be, seconds.
pub const MEMORY_WINDOW_SECS: f64 = 300.0;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let last_queried = effective_memory_last_queried(ctx.paths, ctx.state);
    if now_epoch() - last_queried <= MEMORY_WINDOW_SECS {
        return Ok(GateResult::Pass);
    }

    if last_queried == 0.0 && !ctx.paths.memory_timestamp_file().exists() {
        return Ok(GateResult::warn(
            "[GATE 4: MEMORY FIRST] NOTICE: memory worker has not been seen; proceeding \
             without prior-session context.",
        ));
    }

    Ok(GateResult::block(
        "[GATE 4: MEMORY FIRST] BLOCKED: no recent memory query. Call \
         mcp__memory__search_knowledge for this task's topic first — prior sessions may \
         already hold the fix."
            .to_string(),
        Severity::Error,
    ))
}
