//! Gate 18: CANARY (Tier 3, universal observer).
//!
//! Watches the shape of the tool-call stream rather than any single
//! call: per-tool counts, Welford running statistics over input sizes,
//! short/long rolling windows, and the recent tool sequence. Anomalies
//! are surfaced as warnings only — the canary never blocks.

use super::{GateCtx, GateResult};
use crate::state::now_epoch;
use anyhow::Result;

/// Short observation window, seconds.
pub const SHORT_WINDOW_SECS: f64 = 60.0;
/// Calls inside the short window treated as a burst.
pub const BURST_LIMIT: usize = 40;
/// Minimum samples before size anomalies are reported.
pub const MIN_SIZE_SAMPLES: u64 = 20;
/// Z-score past which an input size is anomalous.
pub const SIZE_SIGMA: f64 = 4.0;
/// Fraction of recent calls a single tool may occupy.
pub const DOMINANCE_RATIO: f64 = 0.8;
/// Calls before dominance is evaluated.
pub const DOMINANCE_MIN_CALLS: u64 = 20;

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let now = now_epoch();
    let state = &mut *ctx.state;

    *state
        .canary_tool_counts
        .entry(ctx.tool_name.to_string())
        .or_insert(0) += 1;
    state.canary_total_calls += 1;

    // Welford update over the serialized input size.
    let size = serde_json::to_string(ctx.tool_input)
        .map(|s| s.len() as f64)
        .unwrap_or(0.0);
    state.canary_size_count += 1;
    let delta = size - state.canary_size_mean;
    state.canary_size_mean += delta / state.canary_size_count as f64;
    state.canary_size_m2 += delta * (size - state.canary_size_mean);

    state.canary_short_timestamps.push(now);
    state
        .canary_short_timestamps
        .retain(|t| now - *t <= SHORT_WINDOW_SECS);
    state.canary_long_timestamps.push(now);
    state.canary_recent_seq.push(ctx.tool_name.to_string());
    if state.canary_recent_seq.len() > 10 {
        let excess = state.canary_recent_seq.len() - 10;
        state.canary_recent_seq.drain(..excess);
    }

    let mut anomalies: Vec<String> = Vec::new();

    if state.canary_short_timestamps.len() >= BURST_LIMIT {
        anomalies.push(format!(
            "burst: {} calls in {SHORT_WINDOW_SECS:.0}s",
            state.canary_short_timestamps.len()
        ));
    }

    if state.canary_total_calls >= DOMINANCE_MIN_CALLS {
        if let Some((tool, count)) = state
            .canary_tool_counts
            .iter()
            .max_by_key(|(_, count)| **count)
        {
            let ratio = *count as f64 / state.canary_total_calls as f64;
            if ratio >= DOMINANCE_RATIO {
                anomalies.push(format!(
                    "tool dominance: {tool} is {:.0}% of {} calls",
                    ratio * 100.0,
                    state.canary_total_calls
                ));
            }
        }
    }

    if state.canary_size_count >= MIN_SIZE_SAMPLES {
        let variance = state.canary_size_m2 / state.canary_size_count as f64;
        let stddev = variance.sqrt();
        if stddev > 0.0 && (size - state.canary_size_mean).abs() > SIZE_SIGMA * stddev {
            anomalies.push(format!(
                "input size anomaly: {size:.0}B vs mean {:.0}B",
                state.canary_size_mean
            ));
        }
    }

    if anomalies.is_empty() {
        Ok(GateResult::Pass)
    } else {
        Ok(GateResult::warn(format!(
            "[GATE 18: CANARY] NOTICE: {}.",
            anomalies.join("; ")
        )))
    }
}
