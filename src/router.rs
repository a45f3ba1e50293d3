//! Q-learning gate router and per-gate timing analytics.
//!
//! For each (gate, tool) pair the router keeps a usefulness value in
//! [0, 1]: nudged toward 1 whenever the gate blocked or asked, toward 0
//! otherwise. At dispatch time non-Tier-1 gates are reordered so the
//! gates most likely to block run first, enabling earlier exits. Tier 1
//! gates are pinned to the front in canonical priority order regardless
//! of their Q values.
//!
//! Both tables are small persistent documents; in-memory handles are
//! rebuilt per invocation and flushed once.

use crate::config::Paths;
use crate::gates::TIER1_GATE_NAMES;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

/// Learning rate for Q updates.
pub const LEARNING_RATE: f64 = 0.2;

/// Per-invocation handle over the Q table.
pub struct GateRouter {
    qtable: HashMap<String, HashMap<String, f64>>,
    dirty: bool,
}

impl GateRouter {
    pub fn load(paths: &Paths) -> Self {
        let qtable = std::fs::read_to_string(paths.gate_qtable())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            qtable,
            dirty: false,
        }
    }

    /// Nudge the (gate, tool) value toward 1 on block/ask, toward 0
    /// otherwise.
    pub fn update(&mut self, gate: &str, tool: &str, blocked: bool) {
        let target = if blocked { 1.0 } else { 0.0 };
        let entry = self
            .qtable
            .entry(gate.to_string())
            .or_default()
            .entry(tool.to_string())
            .or_insert(0.0);
        *entry += LEARNING_RATE * (target - *entry);
        *entry = entry.clamp(0.0, 1.0);
        self.dirty = true;
    }

    pub fn q_value(&self, gate: &str, tool: &str) -> f64 {
        self.qtable
            .get(gate)
            .and_then(|tools| tools.get(tool))
            .copied()
            .unwrap_or(0.0)
    }

    /// Order candidate gates for a tool: Tier 1 first in canonical
    /// (candidate-list) order, then the rest stable-sorted by Q
    /// descending.
    pub fn optimal_gate_order<'g>(&self, tool: &str, candidates: &[&'g str]) -> Vec<&'g str> {
        let mut tier1: Vec<&str> = Vec::new();
        let mut rest: Vec<&str> = Vec::new();
        for gate in candidates {
            if TIER1_GATE_NAMES.contains(gate) {
                tier1.push(gate);
            } else {
                rest.push(gate);
            }
        }
        rest.sort_by(|a, b| {
            self.q_value(b, tool)
                .partial_cmp(&self.q_value(a, tool))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        tier1.extend(rest);
        tier1
    }

    /// Persist the Q table (single write per invocation).
    pub fn flush(&self, paths: &Paths) {
        if self.dirty {
            write_document(&paths.gate_qtable(), &self.qtable);
        }
    }
}

/// Cross-session timing aggregates per (gate, tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingAggregate {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub blocks: u64,
}

impl Default for TimingAggregate {
    fn default() -> Self {
        Self {
            count: 0,
            total_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: 0.0,
            blocks: 0,
        }
    }
}

/// Per-invocation handle over the timing analytics document.
pub struct GateTimings {
    table: HashMap<String, HashMap<String, TimingAggregate>>,
    dirty: bool,
}

impl GateTimings {
    pub fn load(paths: &Paths) -> Self {
        let table = std::fs::read_to_string(paths.gate_timings())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            table,
            dirty: false,
        }
    }

    pub fn record(&mut self, gate: &str, tool: &str, elapsed_ms: f64, blocked: bool) {
        let entry = self
            .table
            .entry(gate.to_string())
            .or_default()
            .entry(tool.to_string())
            .or_default();
        entry.count += 1;
        entry.total_ms += elapsed_ms;
        entry.min_ms = entry.min_ms.min(elapsed_ms);
        entry.max_ms = entry.max_ms.max(elapsed_ms);
        if blocked {
            entry.blocks += 1;
        }
        self.dirty = true;
    }

    pub fn flush(&self, paths: &Paths) {
        if self.dirty {
            write_document(&paths.gate_timings(), &self.table);
        }
    }
}

fn write_document<T: Serialize>(path: &Path, data: &T) {
    let Some(dir) = path.parent() else { return };
    let _ = std::fs::create_dir_all(dir);
    let Ok(mut tmp) = tempfile::Builder::new()
        .prefix(".router_tmp_")
        .tempfile_in(dir)
    else {
        return;
    };
    if serde_json::to_writer(tmp.as_file_mut(), data).is_err() {
        return;
    }
    let _ = tmp.as_file_mut().flush();
    let _ = tmp.persist(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;

    #[test]
    fn q_values_move_toward_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        let mut router = GateRouter::load(&paths);

        router.update("rate_limit", "Bash", true);
        let after_block = router.q_value("rate_limit", "Bash");
        assert!(after_block > 0.0);

        router.update("rate_limit", "Bash", false);
        assert!(router.q_value("rate_limit", "Bash") < after_block);
    }

    #[test]
    fn tier1_pinned_front_in_canonical_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        let mut router = GateRouter::load(&paths);
        // Make a non-Tier-1 gate look maximally useful.
        for _ in 0..50 {
            router.update("rate_limit", "Bash", true);
        }

        let order = router.optimal_gate_order(
            "Bash",
            &["read_before_edit", "no_destroy", "test_before_deploy", "save_fix", "rate_limit"],
        );
        assert_eq!(
            &order[..3],
            &["read_before_edit", "no_destroy", "test_before_deploy"]
        );
        assert_eq!(order[3], "rate_limit");
    }

    #[test]
    fn non_tier1_sort_is_stable_on_equal_q() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        let router = GateRouter::load(&paths);
        let order = router.optimal_gate_order("Edit", &["a", "b", "c"]);
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn qtable_persists_across_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        {
            let mut router = GateRouter::load(&paths);
            router.update("save_fix", "Edit", true);
            router.flush(&paths);
        }
        let reloaded = GateRouter::load(&paths);
        assert!(reloaded.q_value("save_fix", "Edit") > 0.0);
    }

    #[test]
    fn timings_aggregate_min_max() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        let mut timings = GateTimings::load(&paths);
        timings.record("g", "Bash", 5.0, false);
        timings.record("g", "Bash", 15.0, true);
        timings.flush(&paths);

        let reloaded = GateTimings::load(&paths);
        let entry = &reloaded.table["g"]["Bash"];
        assert_eq!(entry.count, 2);
        assert_eq!(entry.min_ms, 5.0);
        assert_eq!(entry.max_ms, 15.0);
        assert_eq!(entry.blocks, 1);
    }
}
