//! The gate registry.
//!
//! Gates are static values implementing a predicate capability: a name,
//! tier, watched-tool set, declared state reads/writes, and a check
//! function over `(tool_name, tool_input, state)`. The registry fixes the
//! canonical priority order; the dispatcher intersects it with each
//! tool's watch set and lets the Q-learning router reorder the
//! non-Tier-1 tail.
//!
//! Tier 1 gates (read-before-edit, no-destroy, test-before-deploy) are
//! safety-critical: they are never skipped by the circuit breaker, never
//! demoted by a security profile, and a crash inside one blocks the call.

mod gate_01_read_before_edit;
mod gate_02_no_destroy;
mod gate_03_test_before_deploy;
mod gate_04_memory_first;
mod gate_05_proof_before_fixed;
mod gate_06_save_fix;
mod gate_07_critical_file_guard;
mod gate_09_strategy_ban;
mod gate_10_model_enforcement;
mod gate_11_rate_limit;
mod gate_13_workspace_isolation;
mod gate_14_confidence_check;
mod gate_15_causal_chain;
mod gate_16_code_quality;
pub mod gate_17_injection_defense;
mod gate_18_canary;
mod modes;
mod result;

pub use modes::{effective_gate_mode, GateMode, GateOverrides};
pub use result::GateResult;

use crate::config::Paths;
use crate::event::EventKind;
use crate::state::SessionState;
use serde_json::Value;

/// Short names of the Tier 1 safety gates.
pub const TIER1_GATE_NAMES: &[&str] = &["read_before_edit", "no_destroy", "test_before_deploy"];

/// Everything a gate predicate may look at.
pub struct GateCtx<'a> {
    pub tool_name: &'a str,
    pub tool_input: &'a Value,
    pub state: &'a mut SessionState,
    pub event: EventKind,
    pub paths: &'a Paths,
    pub session_id: &'a str,
}

impl GateCtx<'_> {
    /// The primary path the tool targets, if any.
    pub fn target_path(&self) -> Option<&str> {
        self.tool_input
            .get("file_path")
            .or_else(|| self.tool_input.get("notebook_path"))
            .and_then(Value::as_str)
    }

    /// A named string field of the tool input, defaulting to "".
    pub fn input_str(&self, key: &str) -> &str {
        self.tool_input.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

/// A registered gate predicate.
pub struct Gate {
    pub id: u8,
    /// Short name used by the breaker, router, cache, and audit.
    pub name: &'static str,
    /// Display label used in user-facing messages.
    pub label: &'static str,
    pub tier: u8,
    /// Watched tools; `None` means universal.
    pub tools: Option<&'static [&'static str]>,
    /// State keys this gate reads (audit provenance).
    pub reads: &'static [&'static str],
    /// State keys this gate writes.
    pub writes: &'static [&'static str],
    pub check: fn(&mut GateCtx) -> anyhow::Result<GateResult>,
}

impl Gate {
    pub fn watches(&self, tool_name: &str) -> bool {
        match self.tools {
            None => true,
            Some(tools) => tools.contains(&tool_name),
        }
    }

    pub fn is_tier1(&self) -> bool {
        self.tier == 1
    }
}

const EDIT_TOOLS: &[&str] = &["Edit", "Write", "NotebookEdit"];
const EDIT_AND_TASK_TOOLS: &[&str] = &["Edit", "Write", "NotebookEdit", "Task"];
const SAVE_FIX_TOOLS: &[&str] = &["Edit", "Write", "Task", "Bash", "NotebookEdit"];
const EXTERNAL_INPUT_TOOLS: &[&str] = &["WebFetch", "WebSearch"];

/// Canonical priority-ordered registry.
pub static REGISTRY: &[Gate] = &[
    Gate {
        id: 1,
        name: "read_before_edit",
        label: "GATE 1: READ BEFORE EDIT",
        tier: 1,
        tools: Some(EDIT_TOOLS),
        reads: &["files_read"],
        writes: &[],
        check: gate_01_read_before_edit::check,
    },
    Gate {
        id: 2,
        name: "no_destroy",
        label: "GATE 2: NO DESTROY",
        tier: 1,
        tools: Some(&["Bash"]),
        reads: &[],
        writes: &[],
        check: gate_02_no_destroy::check,
    },
    Gate {
        id: 3,
        name: "test_before_deploy",
        label: "GATE 3: TEST BEFORE DEPLOY",
        tier: 1,
        tools: Some(&["Bash"]),
        reads: &["last_test_run", "last_test_exit_code", "last_test_command"],
        writes: &[],
        check: gate_03_test_before_deploy::check,
    },
    Gate {
        id: 4,
        name: "memory_first",
        label: "GATE 4: MEMORY FIRST",
        tier: 2,
        tools: Some(EDIT_AND_TASK_TOOLS),
        reads: &["memory_last_queried"],
        writes: &[],
        check: gate_04_memory_first::check,
    },
    Gate {
        id: 5,
        name: "proof_before_fixed",
        label: "GATE 5: PROOF BEFORE FIXED",
        tier: 2,
        tools: Some(EDIT_TOOLS),
        reads: &["pending_verification", "verification_scores", "edit_streak"],
        writes: &[],
        check: gate_05_proof_before_fixed::check,
    },
    Gate {
        id: 6,
        name: "save_fix",
        label: "GATE 6: SAVE VERIFIED FIX",
        tier: 2,
        tools: Some(SAVE_FIX_TOOLS),
        reads: &[
            "gate6_warn_count",
            "verified_fixes",
            "unlogged_errors",
            "last_exit_plan_mode",
            "memory_last_queried",
        ],
        writes: &["gate6_warn_count"],
        check: gate_06_save_fix::check,
    },
    Gate {
        id: 7,
        name: "critical_file_guard",
        label: "GATE 7: CRITICAL FILE GUARD",
        tier: 2,
        tools: Some(EDIT_TOOLS),
        reads: &["memory_last_queried"],
        writes: &[],
        check: gate_07_critical_file_guard::check,
    },
    Gate {
        id: 9,
        name: "strategy_ban",
        label: "GATE 9: STRATEGY BAN",
        tier: 2,
        tools: Some(EDIT_TOOLS),
        reads: &["current_strategy_id", "active_bans", "successful_strategies"],
        writes: &[],
        check: gate_09_strategy_ban::check,
    },
    Gate {
        id: 10,
        name: "model_enforcement",
        label: "GATE 10: MODEL ENFORCEMENT",
        tier: 3,
        tools: Some(&["Task"]),
        reads: &["model_agent_usage"],
        writes: &["model_agent_usage"],
        check: gate_10_model_enforcement::check,
    },
    Gate {
        id: 11,
        name: "rate_limit",
        label: "GATE 11: RATE LIMIT",
        tier: 3,
        tools: None,
        reads: &["rate_window_timestamps"],
        writes: &[],
        check: gate_11_rate_limit::check,
    },
    Gate {
        id: 13,
        name: "workspace_isolation",
        label: "GATE 13: WORKSPACE ISOLATION",
        tier: 3,
        tools: Some(EDIT_TOOLS),
        reads: &[],
        writes: &[],
        check: gate_13_workspace_isolation::check,
    },
    Gate {
        id: 14,
        name: "confidence_check",
        label: "GATE 14: CONFIDENCE CHECK",
        tier: 3,
        tools: Some(EDIT_TOOLS),
        reads: &[
            "session_test_baseline",
            "pending_verification",
            "memory_last_queried",
            "confidence_warnings_per_file",
        ],
        writes: &["confidence_warnings_per_file", "confidence_warned_signals"],
        check: gate_14_confidence_check::check,
    },
    Gate {
        id: 15,
        name: "causal_chain",
        label: "GATE 15: CAUSAL CHAIN",
        tier: 2,
        tools: Some(EDIT_TOOLS),
        reads: &["recent_test_failure", "fix_history_queried", "fixing_error"],
        writes: &[],
        check: gate_15_causal_chain::check,
    },
    Gate {
        id: 16,
        name: "code_quality",
        label: "GATE 16: CODE QUALITY",
        tier: 3,
        tools: Some(EDIT_TOOLS),
        reads: &["code_quality_warnings_per_file"],
        writes: &["code_quality_warnings_per_file"],
        check: gate_16_code_quality::check,
    },
    Gate {
        id: 17,
        name: "injection_defense",
        label: "GATE 17: INJECTION DEFENSE",
        tier: 2,
        tools: Some(EXTERNAL_INPUT_TOOLS),
        reads: &["injection_attempts"],
        writes: &["injection_attempts"],
        check: gate_17_injection_defense::check,
    },
    Gate {
        id: 18,
        name: "canary",
        label: "GATE 18: CANARY",
        tier: 3,
        tools: None,
        reads: &["canary_tool_counts", "canary_total_calls", "canary_size_mean"],
        writes: &[
            "canary_tool_counts",
            "canary_total_calls",
            "canary_size_count",
            "canary_size_mean",
            "canary_size_m2",
            "canary_short_timestamps",
            "canary_long_timestamps",
            "canary_recent_seq",
        ],
        check: gate_18_canary::check,
    },
];

/// Look up a gate by its short name.
pub fn find_gate(name: &str) -> Option<&'static Gate> {
    REGISTRY.iter().find(|g| g.name == name)
}

/// Gates watching `tool_name`, in canonical priority order.
pub fn gates_for_tool(tool_name: &str) -> Vec<&'static Gate> {
    REGISTRY.iter().filter(|g| g.watches(tool_name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_order_is_by_id() {
        let ids: Vec<u8> = REGISTRY.iter().map(|g| g.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn tier1_names_match_tier1_gates() {
        for gate in REGISTRY {
            assert_eq!(gate.is_tier1(), TIER1_GATE_NAMES.contains(&gate.name), "{}", gate.name);
        }
    }

    #[test]
    fn edit_watchers_include_expected_gates() {
        let names: Vec<&str> = gates_for_tool("Edit").iter().map(|g| g.name).collect();
        assert!(names.contains(&"read_before_edit"));
        assert!(names.contains(&"workspace_isolation"));
        assert!(!names.contains(&"no_destroy"));
        // Universal gates watch everything.
        assert!(names.contains(&"rate_limit"));
        assert!(names.contains(&"canary"));
    }

    #[test]
    fn bash_watchers_lead_with_tier1() {
        let names: Vec<&str> = gates_for_tool("Bash").iter().map(|g| g.name).collect();
        assert_eq!(names[0], "no_destroy");
        assert_eq!(names[1], "test_before_deploy");
    }
}
