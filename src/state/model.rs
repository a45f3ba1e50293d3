//! The session state document and its consistency rules.

use super::now_epoch;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Caps applied on every load and save to prevent unbounded growth.
pub const MAX_FILES_READ: usize = 200;
pub const MAX_FILES_EDITED: usize = 200;
pub const MAX_VERIFIED_FIXES: usize = 100;
pub const MAX_PENDING_VERIFICATION: usize = 50;
pub const MAX_UNLOGGED_ERRORS: usize = 20;
pub const MAX_ERROR_PATTERNS: usize = 50;
pub const MAX_ACTIVE_BANS: usize = 50;
pub const MAX_PENDING_CHAINS: usize = 10;
pub const MAX_EDIT_STREAK: usize = 50;
pub const MAX_GATE_BLOCK_OUTCOMES: usize = 100;
pub const MAX_TOOL_CALL_COUNTS: usize = 50;
pub const MAX_GATE_TIMING_STATS: usize = 20;
pub const MAX_CANARY_TIMESTAMPS: usize = 600;
pub const MAX_CANARY_SEQ: usize = 10;

/// Record of the most recent failing test run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestFailure {
    pub pattern: String,
    pub timestamp: f64,
    pub command: String,
}

/// Retry budget for a banned fix strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BanRecord {
    pub fail_count: u32,
    pub first_failed: f64,
    pub last_failed: f64,
}

impl BanRecord {
    pub fn at_threshold(now: f64) -> Self {
        Self {
            fail_count: 3,
            first_failed: now,
            last_failed: now,
        }
    }
}

/// Success tally for a strategy that has worked before.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub success_count: u32,
    pub last_success: f64,
}

/// A gate block awaiting resolution into `override` or `prevented`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockOutcome {
    pub gate: String,
    pub tool: String,
    pub file: String,
    pub timestamp: f64,
    pub resolved_by: Option<String>,
}

/// Per-gate wall-clock aggregates kept in session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingEntry {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Default for TimingEntry {
    fn default() -> Self {
        Self {
            count: 0,
            total_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: 0.0,
        }
    }
}

impl TimingEntry {
    pub fn record(&mut self, elapsed_ms: f64) {
        self.count += 1;
        self.total_ms += elapsed_ms;
        self.min_ms = self.min_ms.min(elapsed_ms);
        self.max_ms = self.max_ms.max(elapsed_ms);
    }
}

/// A running subagent with token accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentHandle {
    pub agent_id: String,
    pub agent_type: String,
    pub start_ts: f64,
    #[serde(default)]
    pub tokens: u64,
}

/// Per-session state document (schema v3).
///
/// Every field carries a serde default so documents written by older
/// versions deserialize cleanly; unknown keys from removed features are
/// dropped by typed deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    #[serde(rename = "_version")]
    pub version: u32,

    // File history
    pub files_read: Vec<String>,
    pub files_edited: Vec<String>,
    pub pending_verification: Vec<String>,
    pub verified_fixes: Vec<String>,
    pub verification_scores: HashMap<String, i64>,
    pub verification_timestamps: HashMap<String, f64>,

    // Test-run facts
    pub last_test_run: f64,
    pub last_test_exit_code: Option<i64>,
    pub last_test_command: String,
    pub session_test_baseline: bool,

    // Error tracking
    pub unlogged_errors: Vec<String>,
    pub error_pattern_counts: HashMap<String, u64>,
    pub recent_test_failure: Option<TestFailure>,
    pub fixing_error: bool,

    // Causal chain
    pub current_strategy_id: String,
    pub current_error_signature: String,
    pub pending_chain_ids: Vec<String>,
    pub active_bans: HashMap<String, BanRecord>,
    pub successful_strategies: HashMap<String, StrategyRecord>,
    pub fix_history_queried: f64,

    // Memory awareness
    pub memory_last_queried: f64,
    pub last_exit_plan_mode: f64,
    pub analytics_last_queried: f64,

    // Rate limiting
    pub rate_window_timestamps: Vec<f64>,

    // Counters
    pub tool_call_counts: HashMap<String, u64>,
    pub total_tool_calls: u64,
    pub session_token_estimate: u64,
    pub gate_timing_stats: HashMap<String, TimingEntry>,
    pub gate_block_counts: HashMap<String, u64>,
    pub gate_block_outcomes: Vec<BlockOutcome>,

    // Subagent registry
    pub active_subagents: Vec<SubagentHandle>,
    pub subagent_total_tokens: u64,
    pub subagent_history: Vec<SubagentHandle>,

    // Mentor (advisory signals, written by external heuristics)
    pub mentor_last_verdict: String,
    pub mentor_last_score: f64,
    pub mentor_escalation_count: u32,

    // Gate scratch counters
    pub gate6_warn_count: u32,
    pub confidence_warnings_per_file: HashMap<String, u32>,
    pub confidence_warned_signals: Vec<String>,
    pub code_quality_warnings_per_file: HashMap<String, u32>,
    pub model_agent_usage: HashMap<String, u64>,
    pub injection_attempts: u64,
    pub edit_streak: HashMap<String, u32>,

    // Canary (gate 18) observation windows
    pub canary_tool_counts: HashMap<String, u64>,
    pub canary_total_calls: u64,
    pub canary_size_count: u64,
    pub canary_size_mean: f64,
    pub canary_size_m2: f64,
    pub canary_short_timestamps: Vec<f64>,
    pub canary_long_timestamps: Vec<f64>,
    pub canary_recent_seq: Vec<String>,

    // Live configuration overlay
    pub security_profile: String,
    pub active_domain: String,

    // Session lifetime
    pub session_start: f64,
    pub session_duration_nudge_hour: u32,
    pub sideband_refreshed: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            version: super::STATE_VERSION,
            files_read: Vec::new(),
            files_edited: Vec::new(),
            pending_verification: Vec::new(),
            verified_fixes: Vec::new(),
            verification_scores: HashMap::new(),
            verification_timestamps: HashMap::new(),
            last_test_run: 0.0,
            last_test_exit_code: None,
            last_test_command: String::new(),
            session_test_baseline: false,
            unlogged_errors: Vec::new(),
            error_pattern_counts: HashMap::new(),
            recent_test_failure: None,
            fixing_error: false,
            current_strategy_id: String::new(),
            current_error_signature: String::new(),
            pending_chain_ids: Vec::new(),
            active_bans: HashMap::new(),
            successful_strategies: HashMap::new(),
            fix_history_queried: 0.0,
            memory_last_queried: 0.0,
            last_exit_plan_mode: 0.0,
            analytics_last_queried: 0.0,
            rate_window_timestamps: Vec::new(),
            tool_call_counts: HashMap::new(),
            total_tool_calls: 0,
            session_token_estimate: 0,
            gate_timing_stats: HashMap::new(),
            gate_block_counts: HashMap::new(),
            gate_block_outcomes: Vec::new(),
            active_subagents: Vec::new(),
            subagent_total_tokens: 0,
            subagent_history: Vec::new(),
            mentor_last_verdict: "proceed".to_string(),
            mentor_last_score: 1.0,
            mentor_escalation_count: 0,
            gate6_warn_count: 0,
            confidence_warnings_per_file: HashMap::new(),
            confidence_warned_signals: Vec::new(),
            code_quality_warnings_per_file: HashMap::new(),
            model_agent_usage: HashMap::new(),
            injection_attempts: 0,
            edit_streak: HashMap::new(),
            canary_tool_counts: HashMap::new(),
            canary_total_calls: 0,
            canary_size_count: 0,
            canary_size_mean: 0.0,
            canary_size_m2: 0.0,
            canary_short_timestamps: Vec::new(),
            canary_long_timestamps: Vec::new(),
            canary_recent_seq: Vec::new(),
            security_profile: "balanced".to_string(),
            active_domain: String::new(),
            session_start: now_epoch(),
            session_duration_nudge_hour: 0,
            sideband_refreshed: false,
        }
    }
}

impl SessionState {
    /// Re-establish invariants after load and before save.
    ///
    /// - list fields deduplicated preserving insertion order
    /// - `pending_verification ∩ verified_fixes = ∅` (pending loses)
    /// - every collection capped to its maximum
    /// - version stamped to the current schema
    pub fn validate(&mut self) {
        self.version = super::STATE_VERSION;

        dedup_preserving_order(&mut self.files_read);
        dedup_preserving_order(&mut self.files_edited);
        dedup_preserving_order(&mut self.pending_verification);
        dedup_preserving_order(&mut self.verified_fixes);
        dedup_preserving_order(&mut self.unlogged_errors);
        dedup_preserving_order(&mut self.pending_chain_ids);
        dedup_preserving_order(&mut self.confidence_warned_signals);

        // I1: an entry in both pending and verified leaves pending.
        if !self.verified_fixes.is_empty() {
            let verified: std::collections::HashSet<&String> =
                self.verified_fixes.iter().collect();
            self.pending_verification.retain(|p| !verified.contains(p));
        }

        cap_tail(&mut self.files_read, MAX_FILES_READ);
        cap_tail(&mut self.files_edited, MAX_FILES_EDITED);
        cap_tail(&mut self.verified_fixes, MAX_VERIFIED_FIXES);
        cap_tail(&mut self.pending_verification, MAX_PENDING_VERIFICATION);
        cap_tail(&mut self.unlogged_errors, MAX_UNLOGGED_ERRORS);
        cap_tail(&mut self.pending_chain_ids, MAX_PENDING_CHAINS);
        cap_tail(&mut self.gate_block_outcomes, MAX_GATE_BLOCK_OUTCOMES);
        cap_tail(&mut self.canary_short_timestamps, MAX_CANARY_TIMESTAMPS);
        cap_tail(&mut self.canary_long_timestamps, MAX_CANARY_TIMESTAMPS);
        cap_tail(&mut self.canary_recent_seq, MAX_CANARY_SEQ);

        cap_map_by(&mut self.error_pattern_counts, MAX_ERROR_PATTERNS, |v| *v as f64);
        cap_map_by(&mut self.edit_streak, MAX_EDIT_STREAK, |v| *v as f64);
        cap_map_by(&mut self.active_bans, MAX_ACTIVE_BANS, |v| v.last_failed);
        cap_map_by(&mut self.tool_call_counts, MAX_TOOL_CALL_COUNTS, |v| *v as f64);
        cap_map_by(&mut self.gate_timing_stats, MAX_GATE_TIMING_STATS, |v| {
            v.count as f64
        });
    }
}

/// Remove duplicates from a list, keeping the first occurrence of each.
fn dedup_preserving_order(list: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|item| seen.insert(item.clone()));
}

/// Keep only the most recent (tail) `max` entries of a list.
fn cap_tail<T>(list: &mut Vec<T>, max: usize) {
    if list.len() > max {
        list.drain(..list.len() - max);
    }
}

/// Trim a map to `max` entries, keeping the highest-ranked by `rank`.
fn cap_map_by<V, F>(map: &mut HashMap<String, V>, max: usize, rank: F)
where
    F: Fn(&V) -> f64,
{
    if map.len() <= max {
        return;
    }
    let mut ranked: Vec<(String, f64)> = map.iter().map(|(k, v)| (k.clone(), rank(v))).collect();
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    for (key, _) in ranked.into_iter().take(map.len() - max) {
        map.remove(&key);
    }
}

/// Lexically normalize a path: collapse `.` and `..` components without
/// touching the filesystem (symlinks are deliberately not resolved).
pub fn normalize_path(path: &str) -> String {
    use std::path::Component;

    let mut parts: Vec<String> = Vec::new();
    let mut absolute = false;
    for comp in std::path::Path::new(path).components() {
        match comp {
            Component::RootDir => {
                absolute = true;
                parts.clear();
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !parts.is_empty() && parts.last().map(String::as_str) != Some("..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..".to_string());
                }
            }
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
            Component::Prefix(_) => {}
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
