//! The PreToolUse enforcer: priority-ordered, tool-scoped gate dispatch.
//!
//! Fail-closed at the edges: malformed input, a missing tool name, an
//! empty input for a write-like tool, a Tier 1 gate crash, or a Tier 1
//! override violation all refuse the call. Everything else fails open —
//! non-Tier-1 crashes are audited and skipped, and the circuit breaker
//! keeps repeat offenders out of the hot path.
//!
//! The loop consults, per gate: the domain/profile mode, the circuit
//! breaker, and the result cache; then runs the gate under a timer,
//! processes the result (ask/block/warn/pass), and feeds the Q-learning
//! router. All persistent caches are flushed once per invocation.

use crate::audit::{AuditLog, Decision, Severity};
use crate::breaker::GateBreaker;
use crate::cache::GateResultCache;
use crate::config::{LiveConfig, Paths};
use crate::event::{
    is_always_allowed, is_subagent_session, EventKind, HookEvent, INJECTION_SCAN_TOOLS,
    WRITE_LIKE_TOOLS,
};
use crate::gates::{
    effective_gate_mode, find_gate, gates_for_tool, Gate, GateCtx, GateMode, GateOverrides,
    GateResult,
};
use crate::router::{GateRouter, GateTimings};
use crate::state::{
    load_state, now_epoch, record_effectiveness, refresh_memory_timestamp, save_state,
    write_enforcer_sideband, BlockOutcome, EffectivenessField, SessionState,
};
use serde_json::Value;
use std::time::Instant;
use tracing::warn;

/// Threshold past which a gate execution is audited as `slow`.
const SLOW_GATE_MS: f64 = 100.0;

/// What the enforcer decided for this invocation.
#[derive(Debug)]
pub enum EnforcerDecision {
    /// Exit 0; the tool may proceed.
    Pass,
    /// Exit 0 with a hook-decision object on stdout; the host prompts.
    Ask(Value),
    /// Exit 2 with the message on stderr; the host refuses the call.
    Block(String),
}

#[derive(Debug)]
pub struct EnforcerOutcome {
    pub decision: EnforcerDecision,
    /// Warnings surfaced on stderr alongside a pass.
    pub warnings: Vec<String>,
}

impl EnforcerOutcome {
    fn block(message: impl Into<String>) -> Self {
        Self {
            decision: EnforcerDecision::Block(message.into()),
            warnings: Vec::new(),
        }
    }
}

/// Run the PreToolUse pipeline over a raw stdin payload.
pub fn enforce(paths: &Paths, raw_input: &str) -> EnforcerOutcome {
    // Fail-closed: malformed input must not bypass gates.
    let Ok(event) = HookEvent::parse(raw_input) else {
        return EnforcerOutcome::block("[ENFORCER] BLOCKED: malformed or missing JSON input");
    };
    if event.tool_name.is_empty() {
        return EnforcerOutcome::block("[ENFORCER] BLOCKED: missing or empty tool_name");
    }
    if WRITE_LIKE_TOOLS.contains(&event.tool_name.as_str()) && input_is_empty(&event.tool_input) {
        return EnforcerOutcome::block(format!(
            "[ENFORCER] BLOCKED: missing or empty tool_input for {}",
            event.tool_name
        ));
    }

    let live = LiveConfig::load(paths);
    let mut state = load_state(paths, &event.session_id);
    state.security_profile = live.security_profile.clone();

    // Subagent mini-boot: first sight of a UUID-patterned session gets a
    // fresh memory-first window without a full boot sequence.
    if !state.sideband_refreshed && is_subagent_session(&event.session_id) {
        refresh_memory_timestamp(paths);
        state.sideband_refreshed = true;
        let _ = save_state(paths, &mut state, &event.session_id);
    }

    let audit = AuditLog::new(paths);
    let overrides = GateOverrides::load(paths);
    if overrides.changed_since_last_seen {
        audit.log(
            "registry",
            &event.tool_name,
            Decision::Reload,
            "gate overrides changed on disk",
            &event.session_id,
            &[],
            Severity::Info,
            "",
        );
    }
    // Structural failure: a Tier 1 gate cannot be disabled or demoted.
    if !overrides.tier1_violations.is_empty() {
        let names = overrides.tier1_violations.join(", ");
        audit.log(
            "registry",
            &event.tool_name,
            Decision::Block,
            &format!("tier 1 gate override violation: {names}"),
            &event.session_id,
            &[],
            Severity::Critical,
            "",
        );
        return EnforcerOutcome::block(format!(
            "[ENFORCER] BLOCKED: Tier 1 safety gate(s) cannot be disabled: {names}. \
             Remove the override to resume work."
        ));
    }

    if is_always_allowed(&event.tool_name) {
        return enforce_always_allowed(paths, &event, &mut state, &audit);
    }

    run_gate_pipeline(paths, &event, &mut state, &audit, &live, &overrides)
}

/// Always-allowed tools bypass the pipeline; WebFetch/WebSearch still get
/// an injection scan of their inputs.
fn enforce_always_allowed(
    paths: &Paths,
    event: &HookEvent,
    state: &mut SessionState,
    audit: &AuditLog,
) -> EnforcerOutcome {
    if !INJECTION_SCAN_TOOLS.contains(&event.tool_name.as_str()) {
        return EnforcerOutcome {
            decision: EnforcerDecision::Pass,
            warnings: Vec::new(),
        };
    }

    let Some(gate) = find_gate("injection_defense") else {
        return EnforcerOutcome {
            decision: EnforcerDecision::Pass,
            warnings: Vec::new(),
        };
    };
    let breaker = GateBreaker::new(paths);
    let result = {
        let mut ctx = GateCtx {
            tool_name: &event.tool_name,
            tool_input: &event.tool_input,
            state,
            event: EventKind::PreToolUse,
            paths,
            session_id: &event.session_id,
        };
        (gate.check)(&mut ctx)
    };

    match result {
        Ok(result) => {
            breaker.record_result(gate.name, true);
            let mut warnings = Vec::new();
            if let Some(message) = result.message() {
                let decision = if result.is_blocking() {
                    Decision::Block
                } else {
                    Decision::Warn
                };
                audit.log(
                    gate.label,
                    &event.tool_name,
                    decision,
                    message,
                    &event.session_id,
                    gate.reads,
                    result.severity(),
                    "",
                );
            }
            if result.is_blocking() {
                write_enforcer_sideband(paths, state, &event.session_id);
                let _ = save_state(paths, state, &event.session_id);
                return EnforcerOutcome::block(result.message().unwrap_or_default());
            }
            if let Some(message) = result.message() {
                warnings.push(message.to_string());
                let _ = save_state(paths, state, &event.session_id);
            }
            EnforcerOutcome {
                decision: EnforcerDecision::Pass,
                warnings,
            }
        }
        Err(err) => {
            // The scan is best-effort on otherwise-allowed tools.
            breaker.record_result(gate.name, false);
            warn!(error = %err, "injection scan failed on always-allowed tool");
            EnforcerOutcome {
                decision: EnforcerDecision::Pass,
                warnings: vec![format!("[ENFORCER] injection scan error: {err}")],
            }
        }
    }
}

fn run_gate_pipeline(
    paths: &Paths,
    event: &HookEvent,
    state: &mut SessionState,
    audit: &AuditLog,
    live: &LiveConfig,
    overrides: &GateOverrides,
) -> EnforcerOutcome {
    let breaker = GateBreaker::new(paths);
    let mut router = GateRouter::load(paths);
    let mut timings = GateTimings::load(paths);
    let mut cache = GateResultCache::load(paths, live.gate_cache_enabled);
    let mut warnings: Vec<String> = Vec::new();

    let candidates = gates_for_tool(&event.tool_name);
    let names: Vec<&str> = candidates.iter().map(|g| g.name).collect();
    let ordered = router.optimal_gate_order(&event.tool_name, &names);
    let gates: Vec<&Gate> = ordered.iter().filter_map(|n| find_gate(n)).collect();

    for gate in gates {
        let mode = effective_gate_mode(gate, state, overrides);
        if mode == GateMode::Disabled {
            continue;
        }
        if breaker.should_skip_gate(gate.name) {
            continue;
        }

        let (result, elapsed_ms) = match cache.get(gate.name, &event.tool_name, &event.tool_input)
        {
            Some(cached) => {
                breaker.record_result(gate.name, true);
                (cached, 0.0)
            }
            None => {
                let started = Instant::now();
                let checked = {
                    let mut ctx = GateCtx {
                        tool_name: &event.tool_name,
                        tool_input: &event.tool_input,
                        state,
                        event: EventKind::PreToolUse,
                        paths,
                        session_id: &event.session_id,
                    };
                    (gate.check)(&mut ctx)
                };
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                match checked {
                    Ok(result) => {
                        breaker.record_result(gate.name, true);
                        cache.store(gate.name, &event.tool_name, &event.tool_input, &result);
                        (result, elapsed_ms)
                    }
                    Err(err) => {
                        breaker.record_result(gate.name, false);
                        if gate.is_tier1() {
                            audit.log(
                                gate.label,
                                &event.tool_name,
                                Decision::Block,
                                &format!("crash: {err}"),
                                &event.session_id,
                                gate.reads,
                                Severity::Error,
                                "",
                            );
                            flush_caches(paths, &router, &timings, &cache);
                            write_enforcer_sideband(paths, state, &event.session_id);
                            let _ = save_state(paths, state, &event.session_id);
                            return EnforcerOutcome::block(format!(
                                "[ENFORCER] BLOCKED: Tier 1 safety gate '{}' crashed: {err}",
                                gate.label
                            ));
                        }
                        audit.log(
                            gate.label,
                            &event.tool_name,
                            Decision::Crash,
                            &format!("crash: {err}"),
                            &event.session_id,
                            gate.reads,
                            Severity::Warn,
                            "",
                        );
                        warnings.push(format!("[ENFORCER] gate error in {}: {err}", gate.label));
                        continue;
                    }
                }
            }
        };

        state
            .gate_timing_stats
            .entry(gate.name.to_string())
            .or_default()
            .record(elapsed_ms);
        if elapsed_ms > SLOW_GATE_MS {
            audit.log(
                gate.label,
                &event.tool_name,
                Decision::Slow,
                &format!("gate took {elapsed_ms:.0}ms (>{SLOW_GATE_MS:.0}ms threshold)"),
                &event.session_id,
                gate.reads,
                Severity::Warn,
                "",
            );
        }

        let file_path = primary_file(&event.tool_input);
        match &result {
            GateResult::Ask { message, severity } => {
                audit.log(
                    gate.label,
                    &event.tool_name,
                    Decision::Ask,
                    message,
                    &event.session_id,
                    gate.reads,
                    *severity,
                    &file_path,
                );
                router.update(gate.name, &event.tool_name, true);
                timings.record(gate.name, &event.tool_name, elapsed_ms, true);
                flush_caches(paths, &router, &timings, &cache);
                write_enforcer_sideband(paths, state, &event.session_id);
                let _ = save_state(paths, state, &event.session_id);
                let decision = result
                    .to_hook_decision(gate.label)
                    .unwrap_or(Value::Null);
                return EnforcerOutcome {
                    decision: EnforcerDecision::Ask(decision),
                    warnings,
                };
            }
            GateResult::Block { message, severity } => {
                // Profile `warn` mode demotes the block — never for Tier 1.
                if mode == GateMode::Warn && !gate.is_tier1() {
                    audit.log(
                        gate.label,
                        &event.tool_name,
                        Decision::Warn,
                        &format!("[profile:downgraded] {message}"),
                        &event.session_id,
                        gate.reads,
                        Severity::Warn,
                        &file_path,
                    );
                    warnings.push(message.clone());
                    router.update(gate.name, &event.tool_name, false);
                    timings.record(gate.name, &event.tool_name, elapsed_ms, false);
                    continue;
                }
                audit.log(
                    gate.label,
                    &event.tool_name,
                    Decision::Block,
                    message,
                    &event.session_id,
                    gate.reads,
                    *severity,
                    &file_path,
                );
                *state
                    .gate_block_counts
                    .entry(gate.name.to_string())
                    .or_insert(0) += 1;
                record_effectiveness(paths, gate.name, EffectivenessField::Blocks);
                state.gate_block_outcomes.push(BlockOutcome {
                    gate: gate.name.to_string(),
                    tool: event.tool_name.clone(),
                    file: file_path.clone(),
                    timestamp: now_epoch(),
                    resolved_by: None,
                });
                router.update(gate.name, &event.tool_name, true);
                timings.record(gate.name, &event.tool_name, elapsed_ms, true);
                flush_caches(paths, &router, &timings, &cache);
                write_enforcer_sideband(paths, state, &event.session_id);
                let _ = save_state(paths, state, &event.session_id);
                return EnforcerOutcome {
                    decision: EnforcerDecision::Block(message.clone()),
                    warnings,
                };
            }
            GateResult::Warn { message, severity } => {
                audit.log(
                    gate.label,
                    &event.tool_name,
                    Decision::Warn,
                    message,
                    &event.session_id,
                    gate.reads,
                    *severity,
                    &file_path,
                );
                warnings.push(message.clone());
                router.update(gate.name, &event.tool_name, false);
                timings.record(gate.name, &event.tool_name, elapsed_ms, false);
            }
            GateResult::Pass => {
                audit.log(
                    gate.label,
                    &event.tool_name,
                    Decision::Pass,
                    "",
                    &event.session_id,
                    gate.reads,
                    Severity::Info,
                    &file_path,
                );
                router.update(gate.name, &event.tool_name, false);
                timings.record(gate.name, &event.tool_name, elapsed_ms, false);
            }
        }
    }

    flush_caches(paths, &router, &timings, &cache);
    write_enforcer_sideband(paths, state, &event.session_id);
    let _ = save_state(paths, state, &event.session_id);
    EnforcerOutcome {
        decision: EnforcerDecision::Pass,
        warnings,
    }
}

fn flush_caches(paths: &Paths, router: &GateRouter, timings: &GateTimings, cache: &GateResultCache) {
    router.flush(paths);
    timings.flush(paths);
    cache.flush(paths);
}

fn input_is_empty(input: &Value) -> bool {
    match input {
        Value::Null => true,
        Value::Object(obj) => obj.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// The file (or command prefix) a block outcome is keyed on.
fn primary_file(input: &Value) -> String {
    if let Some(path) = input
        .get("file_path")
        .or_else(|| input.get("notebook_path"))
        .and_then(Value::as_str)
    {
        return path.to_string();
    }
    input
        .get("command")
        .and_then(Value::as_str)
        .map(|c| c.chars().take(100).collect())
        .unwrap_or_default()
}
