//! Gate 10: MODEL ENFORCEMENT (Tier 3).
//!
//! Tracks per-agent-type model usage and holds premium-tier subagent
//! launches for unrecognized agent types behind a user confirmation
//! instead of silently burning budget.

use super::{GateCtx, GateResult};
use anyhow::Result;

/// Agent types allowed to use premium-tier models without confirmation.
const PREMIUM_AGENT_TYPES: &[&str] = &["architect", "planner", "reviewer"];

/// Model-name substrings marking the premium tier.
const PREMIUM_MARKERS: &[&str] = &["opus"];

pub fn check(ctx: &mut GateCtx) -> Result<GateResult> {
    let model = ctx.input_str("model").to_lowercase();
    let agent_type = ctx.input_str("subagent_type").to_string();

    if !agent_type.is_empty() {
        *ctx.state
            .model_agent_usage
            .entry(agent_type.clone())
            .or_insert(0) += 1;
    }

    let premium = PREMIUM_MARKERS.iter().any(|m| model.contains(m));
    if premium && !PREMIUM_AGENT_TYPES.contains(&agent_type.as_str()) {
        let usage = ctx.state.model_agent_usage.get(&agent_type).copied().unwrap_or(0);
        return Ok(GateResult::ask(format!(
            "Premium model '{model}' requested for agent type '{agent_type}' \
             (launch #{usage} this session). Confirm this tier is needed, or use a \
             standard-tier model."
        )));
    }
    Ok(GateResult::Pass)
}
