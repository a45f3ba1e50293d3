//! Gate 7: CRITICAL FILE GUARD (Tier 2).
//!
//! Writes to credential stores, keys, and system configuration demand a
//! recent memory query — sensitive paths are exactly where prior-session
//! knowledge matters most.

use super::{GateCtx, GateResult};
use crate::audit::Severity;
use crate::state::{effective_memory_last_queried, normalize_path, now_epoch};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

/// Memory freshness required for sensitive writes, seconds.
pub const SENSITIVE_MEMORY_WINDOW_SECS: f64 = 600.0;

static SENSITIVE_PATH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(^|/)\.env(\.|$)",
        r"(?i)secret",
        r"(?i)credential",
        r"(?i)\.pem$",
        r"(?i)\.key$",
        r"(?i)id_rsa",
        r"(?i)(^|/)\.ssh/",
        r"(?i)(^|/)\.aws/",
        r"(?i)(^|/)\.kube/",
        r"(?i)^/etc/",
        r"(?i)(^|/)\.claude/settings",
    ]
    .iter()
    .filter_map(|pat| Regex::new(pat).ok())
    .collect()
});

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let Some(path) = ctx.target_path() else {
        return Ok(GateResult::Pass);
    };
    let normalized = normalize_path(path);
    if !SENSITIVE_PATH_PATTERNS.iter().any(|re| re.is_match(&normalized)) {
        return Ok(GateResult::Pass);
    }

    let last_queried = effective_memory_last_queried(ctx.paths, ctx.state);
    if now_epoch() - last_queried <= SENSITIVE_MEMORY_WINDOW_SECS {
        return Ok(GateResult::Pass);
    }

    Ok(GateResult::block(
        format!(
            "[GATE 7: CRITICAL FILE GUARD] BLOCKED: {normalized} is a sensitive path and \
             memory has not been consulted recently. Query memory for prior handling of \
             this file before modifying it."
        ),
        Severity::Error,
    ))
}
