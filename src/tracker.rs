//! The PostToolUse tracker: state evolution after every tool call.
//!
//! Fail-open by contract — whatever happens inside, the invocation exits
//! 0 and never blocks work. On entry the enforcer sideband is merged into
//! the loaded state and deleted; on exit the state is saved.
//!
//! All mutations are idempotent with respect to duplicate events: sets
//! are deduplicated, graduation happens exactly once, and only counters
//! that are explicitly incremental move twice.

use crate::capture::capture_observation;
use crate::config::Paths;
use crate::error_patterns::{detect_error, extract_pattern};
use crate::event::{is_analytics_tool, is_external_tool, is_memory_tool, EventKind, HookEvent};
use crate::gates::{find_gate, GateCtx};
use crate::state::{
    claim_file, delete_enforcer_sideband, load_state, merge_sideband, normalize_path, now_epoch,
    read_enforcer_sideband, record_effectiveness, refresh_memory_timestamp, save_state,
    EffectivenessField, SessionState, TestFailure,
};
use serde_json::Value;
use tracing::debug;

/// Commands recognized as broad test runs.
pub const BROAD_TEST_COMMANDS: &[&str] = &[
    "pytest",
    "python -m pytest",
    "npm test",
    "cargo test",
    "go test",
    "make test",
];

/// Seconds after which a lingering `fixing_error` is expired.
const FIXING_ERROR_TTL_SECS: f64 = 1800.0;
/// Window for resolving gate-block outcomes, seconds.
const OUTCOME_WINDOW_SECS: f64 = 1800.0;
/// Cap on how much external result content the injection scan reads.
const POST_SCAN_CAP: usize = 50_000;

/// Per-tool token estimates for session budgeting.
fn token_estimate(tool_name: &str) -> u64 {
    match tool_name {
        "Bash" => 2000,
        "Edit" | "Write" | "NotebookEdit" => 1500,
        "Read" => 800,
        "Glob" | "Grep" => 500,
        _ => 800,
    }
}

/// Run the tracker over a raw stdin payload. Returns stderr notes; never
/// fails.
pub fn track(paths: &Paths, raw_input: &str) -> Vec<String> {
    let Ok(event) = HookEvent::parse(raw_input) else {
        return Vec::new();
    };
    if event.tool_name.is_empty() {
        return Vec::new();
    }

    let mut state = load_state(paths, &event.session_id);
    if let Some(sideband) = read_enforcer_sideband(paths, &event.session_id) {
        state = merge_sideband(state, sideband);
    }

    let notes = handle_post_tool_use(paths, &event, &mut state);

    if let Err(err) = save_state(paths, &mut state, &event.session_id) {
        debug!(error = %err, "tracker state save failed");
    }
    // Promote complete: the main state file is now the source of truth.
    delete_enforcer_sideband(paths, &event.session_id);
    notes
}

fn handle_post_tool_use(paths: &Paths, event: &HookEvent, state: &mut SessionState) -> Vec<String> {
    let mut notes: Vec<String> = Vec::new();
    let now = now_epoch();
    let tool = event.tool_name.as_str();

    // Counters and token accounting.
    *state.tool_call_counts.entry(tool.to_string()).or_insert(0) += 1;
    state.total_tool_calls += 1;
    if tool != "Task" {
        state.session_token_estimate += token_estimate(tool);
    }
    state.rate_window_timestamps.push(now);
    state
        .rate_window_timestamps
        .retain(|t| now - *t <= 120.0);

    resolve_gate_block_outcomes(paths, event, state, now);

    // Auto-expire a stale fixing_error so a session where tests never
    // pass does not stay locked down forever.
    if state.fixing_error {
        let stale = state
            .recent_test_failure
            .as_ref()
            .map(|f| now - f.timestamp > FIXING_ERROR_TTL_SECS)
            .unwrap_or(true);
        if stale {
            state.fixing_error = false;
            state.recent_test_failure = None;
        }
    }

    if tool == "Read" {
        if let Some(path) = event.file_path() {
            let normalized = normalize_path(path);
            if !state.files_read.contains(&normalized) {
                state.files_read.push(normalized);
            }
        }
    }

    if matches!(tool, "Edit" | "Write" | "NotebookEdit") {
        track_edit(paths, event, state);
    }

    if is_memory_tool(tool) {
        state.memory_last_queried = now;
        refresh_memory_timestamp(paths);
    }

    if tool == "mcp__memory__remember_this" {
        let resp = response_object(event);
        let rejected = resp
            .as_ref()
            .map(|r| {
                r.get("rejected").and_then(Value::as_bool).unwrap_or(false)
                    || r.get("deduplicated").and_then(Value::as_bool).unwrap_or(false)
            })
            .unwrap_or(false);
        if !rejected {
            state.unlogged_errors.clear();
            state.error_pattern_counts.clear();
            state.verified_fixes.clear();
            state.gate6_warn_count = 0;
        }
    }

    if tool == "ExitPlanMode" {
        state.last_exit_plan_mode = now;
    }

    if tool == "Bash" {
        track_bash(paths, event, state, now);
    }

    match tool {
        "mcp__memory__record_attempt" => track_record_attempt(event, state),
        "mcp__memory__record_outcome" => track_record_outcome(event, state, now),
        "mcp__memory__query_fix_history" => track_query_fix_history(event, state, now),
        _ => {}
    }

    if is_analytics_tool(tool) {
        state.analytics_last_queried = now;
    }

    // Injection defense over external tool results: the host cannot block
    // post-facto, so findings surface as warnings.
    if is_external_tool(tool) {
        if let Some(warning) = scan_external_result(paths, event, state) {
            notes.push(warning);
        }
    }

    capture_observation(
        paths,
        &event.session_id,
        &format!("{tool}: {}", event.file_path().unwrap_or("")),
        "tool event",
        "type:event",
        false,
    );

    // Session duration nudges, once per milestone hour.
    let hours = (now - state.session_start) / 3600.0;
    for milestone in [3u32, 2, 1] {
        if hours >= milestone as f64 && state.session_duration_nudge_hour < milestone {
            state.session_duration_nudge_hour = milestone;
            notes.push(format!(
                "[SESSION] ADVISORY: session running {milestone}h+. Save key findings to \
                 memory before context degrades."
            ));
            break;
        }
    }

    notes
}

fn track_edit(paths: &Paths, event: &HookEvent, state: &mut SessionState) {
    let Some(path) = event.file_path() else { return };
    let normalized = normalize_path(path);

    if !state.files_edited.contains(&normalized) {
        state.files_edited.push(normalized.clone());
    }
    if !state.pending_verification.contains(&normalized)
        && !state.verified_fixes.contains(&normalized)
    {
        state.pending_verification.push(normalized.clone());
    }

    let streak = state.edit_streak.entry(normalized.clone()).or_insert(0);
    let old = *streak;
    *streak += 1;
    if old < 3 && *streak >= 3 {
        capture_observation(
            paths,
            &event.session_id,
            &format!("Heavy editing: {normalized} ({streak} edits this session)"),
            "auto-captured heavy edit pattern",
            "type:auto-captured,area:framework",
            false,
        );
    }

    claim_file(paths, &event.session_id, &normalized);
}

fn track_bash(paths: &Paths, event: &HookEvent, state: &mut SessionState, now: f64) {
    let command = event
        .tool_input
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or("");
    if command.is_empty() {
        return;
    }

    if BROAD_TEST_COMMANDS.iter().any(|kw| command.contains(kw)) {
        state.last_test_run = now;
        state.last_test_command = command.chars().take(200).collect();
        state.session_test_baseline = true;
        let exit_code = response_exit_code(event);
        state.last_test_exit_code = Some(exit_code);

        if exit_code != 0 {
            let pattern = response_text(event)
                .as_deref()
                .map(extract_pattern)
                .unwrap_or("other:unclassified");
            state.recent_test_failure = Some(TestFailure {
                pattern: pattern.to_string(),
                timestamp: now,
                command: command.chars().take(200).collect(),
            });
            state.fixing_error = true;
        } else {
            if state.fixing_error {
                let pattern = state
                    .recent_test_failure
                    .as_ref()
                    .map(|f| f.pattern.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                let edited: Vec<String> =
                    state.files_edited.iter().rev().take(5).cloned().collect();
                capture_observation(
                    paths,
                    &event.session_id,
                    &format!("Error fixed: {pattern}. Files edited: {}", edited.join(", ")),
                    &format!("test passed after fixing error: {}", truncate(command, 100)),
                    "type:auto-captured,type:fix,area:framework",
                    true,
                );
            }
            capture_observation(
                paths,
                &event.session_id,
                &format!("Tests passed: {}", truncate(command, 150)),
                "auto-captured test run snapshot",
                "type:auto-captured,area:testing",
                false,
            );
            state.recent_test_failure = None;
            state.fixing_error = false;
            state.confidence_warned_signals.clear();
        }
    }

    if command.contains("git commit") {
        capture_observation(
            paths,
            &event.session_id,
            &format!("Git commit: {}", truncate(command, 200)),
            "auto-captured git commit",
            "type:auto-captured,area:git",
            false,
        );
    }

    apply_verification_scoring(command, state, now);

    if let Some(output) = response_text(event) {
        if let Some((pattern, snippet)) = detect_error(&output) {
            if !state.unlogged_errors.contains(&snippet) {
                state.unlogged_errors.push(snippet);
            }
            *state
                .error_pattern_counts
                .entry(pattern.to_string())
                .or_insert(0) += 1;
        }
    }
}

/// Progressive verification scoring over pending files.
///
/// Broad test commands credit every pending file; targeted commands
/// credit only files whose path, basename, or stem appears in the
/// command (with a floor of 70 when the file is directly exercised).
/// Files reaching the threshold graduate to verified, except throwaway
/// temp paths.
fn apply_verification_scoring(command: &str, state: &mut SessionState, now: f64) {
    const EXCLUDED_PREFIXES: &[&str] = &["/tmp/", "/var/tmp/", "/dev/"];
    let score = classify_verification_score(command);
    state.edit_streak.clear();

    let broad = score == 100 && BROAD_TEST_COMMANDS.iter().any(|kw| command.contains(kw));
    let pending = state.pending_verification.clone();
    let tokens = shlex::split(command).unwrap_or_default();

    for path in &pending {
        let credited = if broad {
            score
        } else {
            let basename = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = std::path::Path::new(path)
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let referenced = contains_word(command, path)
                || (!basename.is_empty() && contains_word(command, &basename))
                || (!stem.is_empty() && contains_word(command, &stem));
            if !referenced {
                continue;
            }
            // Running the exact file you edited is strong evidence.
            let directly_executed = tokens.iter().any(|t| {
                let t = t.trim_start_matches("./");
                t == path.as_str()
                    || (!basename.is_empty()
                        && (t == basename || t.ends_with(&format!("/{basename}"))))
            });
            if score >= 30 && directly_executed {
                score.max(70)
            } else {
                score
            }
        };
        *state.verification_scores.entry(path.clone()).or_insert(0) += credited;
    }

    let mut remaining = Vec::new();
    for path in pending {
        if state.verification_scores.get(&path).copied().unwrap_or(0) >= 70 {
            if !EXCLUDED_PREFIXES.iter().any(|p| path.starts_with(p)) {
                if !state.verified_fixes.contains(&path) {
                    state.verified_fixes.push(path.clone());
                }
                state.verification_timestamps.insert(path.clone(), now);
            }
            state.verification_scores.remove(&path);
        } else {
            remaining.push(path);
        }
    }
    state.pending_verification = remaining;
}

/// Confidence score for a Bash command as verification evidence.
///
/// Full suite 100, targeted test 70, script run 50, informational 10,
/// anything else 30.
pub fn classify_verification_score(command: &str) -> i64 {
    for kw in BROAD_TEST_COMMANDS {
        if let Some(idx) = command.find(kw) {
            let rest = &command[idx + kw.len()..];
            let targeted = rest.contains("::")
                || rest
                    .split_whitespace()
                    .any(|w| w.contains("test_") && w.ends_with(".py"))
                || rest
                    .split_whitespace()
                    .any(|w| w.contains(".test.") || w.contains(".spec."));
            return if targeted { 70 } else { 100 };
        }
    }

    const SCRIPT_RUNNERS: &[&str] = &["python ", "python3 ", "node ", "ruby ", "bash ", "sh ", "./"];
    if SCRIPT_RUNNERS.iter().any(|kw| command.contains(kw)) {
        return 50;
    }

    const INFORMATIONAL: &[&str] = &["ls", "git status", "echo ", "cat ", "pwd", "which "];
    if INFORMATIONAL.iter().any(|kw| command.starts_with(kw)) {
        return 10;
    }
    30
}

/// Resolve pending gate-block outcomes: a later success on the same
/// (tool, file) within the window is `prevented` when memory or fix
/// history was consulted after the block, `override` otherwise.
fn resolve_gate_block_outcomes(
    paths: &Paths,
    event: &HookEvent,
    state: &mut SessionState,
    now: f64,
) {
    if state.gate_block_outcomes.is_empty() {
        return;
    }
    let file = event
        .file_path()
        .map(str::to_string)
        .or_else(|| {
            event
                .tool_input
                .get("command")
                .and_then(Value::as_str)
                .map(|c| c.chars().take(100).collect())
        })
        .unwrap_or_default();

    for outcome in state.gate_block_outcomes.iter_mut() {
        if outcome.resolved_by.is_some() {
            continue;
        }
        if outcome.tool != event.tool_name || outcome.file != file {
            continue;
        }
        if now - outcome.timestamp >= OUTCOME_WINDOW_SECS {
            continue;
        }
        let consulted = state.memory_last_queried > outcome.timestamp
            || state.fix_history_queried > outcome.timestamp;
        let (field, label) = if consulted {
            (EffectivenessField::Prevented, "prevented")
        } else {
            (EffectivenessField::Overrides, "override")
        };
        record_effectiveness(paths, &outcome.gate, field);
        outcome.resolved_by = Some(label.to_string());
    }

    // Prune entries past the window once they are resolved.
    state
        .gate_block_outcomes
        .retain(|o| o.resolved_by.is_none() || now - o.timestamp < OUTCOME_WINDOW_SECS);
}

fn track_record_attempt(event: &HookEvent, state: &mut SessionState) {
    let error_text = event
        .tool_input
        .get("error_text")
        .and_then(Value::as_str)
        .unwrap_or("");
    let strategy_id = event
        .tool_input
        .get("strategy_id")
        .and_then(Value::as_str)
        .unwrap_or("");
    if error_text.is_empty() || strategy_id.is_empty() {
        return;
    }
    let error_hash = fnv1a64(extract_pattern(error_text).as_bytes());
    let strategy_hash = fnv1a64(strategy_id.as_bytes());
    let chain_id = format!("{error_hash:016x}_{strategy_hash:016x}");

    state.current_strategy_id = strategy_id.to_string();
    state.current_error_signature = format!("{error_hash:016x}");
    if !state.pending_chain_ids.contains(&chain_id) {
        state.pending_chain_ids.push(chain_id);
    }
}

fn track_record_outcome(event: &HookEvent, state: &mut SessionState, now: f64) {
    let resp = response_object(event).unwrap_or_default();
    let strategy_id = resp
        .get("strategy_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.current_strategy_id.clone());
    let outcome = resp.get("outcome").and_then(Value::as_str).unwrap_or("");
    let explicit_ban = resp.get("banned").and_then(Value::as_bool).unwrap_or(false);

    if !strategy_id.is_empty() {
        if outcome == "success" {
            let entry = state
                .successful_strategies
                .entry(strategy_id.clone())
                .or_default();
            entry.success_count += 1;
            entry.last_success = now;
        }
        if explicit_ban || outcome == "failure" {
            let ban = state
                .active_bans
                .entry(strategy_id)
                .or_insert(crate::state::BanRecord {
                    fail_count: 0,
                    first_failed: now,
                    last_failed: now,
                });
            if explicit_ban {
                ban.fail_count = ban.fail_count.max(3);
            } else {
                ban.fail_count += 1;
            }
            ban.last_failed = now;
        }
    }

    state.pending_chain_ids.clear();
    state.current_strategy_id.clear();
}

fn track_query_fix_history(event: &HookEvent, state: &mut SessionState, now: f64) {
    state.fix_history_queried = now;
    let Some(resp) = response_object(event) else {
        return;
    };
    let Some(banned) = resp.get("banned").and_then(Value::as_array) else {
        return;
    };
    for entry in banned {
        let Some(sid) = entry.get("strategy_id").and_then(Value::as_str) else {
            continue;
        };
        if !sid.is_empty() && !state.active_bans.contains_key(sid) {
            state
                .active_bans
                .insert(sid.to_string(), crate::state::BanRecord::at_threshold(now));
        }
    }
}

fn scan_external_result(
    paths: &Paths,
    event: &HookEvent,
    state: &mut SessionState,
) -> Option<String> {
    let content = response_text(event)?;
    if content.is_empty() {
        return None;
    }
    let capped: String = content.chars().take(POST_SCAN_CAP).collect();
    let scan_input = serde_json::json!({ "content": capped });

    let gate = find_gate("injection_defense")?;
    let result = {
        let mut ctx = GateCtx {
            tool_name: &event.tool_name,
            tool_input: &scan_input,
            state,
            event: EventKind::PostToolUse,
            paths,
            session_id: &event.session_id,
        };
        (gate.check)(&mut ctx)
    };
    match result {
        Ok(result) => result.message().map(str::to_string),
        Err(err) => {
            debug!(error = %err, "post-tool injection scan failed");
            None
        }
    }
}

// ── Response helpers ────────────────────────────────────────────────────

/// The tool response as a JSON object, tolerating string-encoded JSON.
fn response_object(event: &HookEvent) -> Option<serde_json::Map<String, Value>> {
    match event.tool_response.as_ref()? {
        Value::Object(obj) => Some(obj.clone()),
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| v.as_object().cloned()),
        _ => None,
    }
}

/// Exit code from a tool response (`exit_code`, `exitCode`, or `status`).
fn response_exit_code(event: &HookEvent) -> i64 {
    let Some(obj) = response_object(event) else {
        return 0;
    };
    ["exit_code", "exitCode", "status"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_i64))
        .unwrap_or(0)
}

/// Free-text content of a tool response.
fn response_text(event: &HookEvent) -> Option<String> {
    match event.tool_response.as_ref()? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => ["content", "output", "stdout", "stderr"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| Some(Value::Object(obj.clone()).to_string())),
        other => Some(other.to_string()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// True when `needle` appears in `haystack` bounded by non-alphanumeric
/// chars. Underscores count as boundaries so `test_a.py` references `a`.
fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(idx) = haystack[start..].find(needle) {
        let abs = start + idx;
        let before_ok = !haystack[..abs]
            .chars()
            .next_back()
            .map(char::is_alphanumeric)
            .unwrap_or(false);
        let end = abs + needle.len();
        let after_ok = !haystack[end..]
            .chars()
            .next()
            .map(char::is_alphanumeric)
            .unwrap_or(false);
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

/// FNV-1a 64-bit hash, used for compact chain ids.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
