//! Persistent per-gate effectiveness counters.
//!
//! Lives outside session state (`.gate_effectiveness.json`) so the numbers
//! survive across sessions. Every operation is fail-open: statistics must
//! never break enforcement.

use crate::config::Paths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;

/// Which counter a gate outcome feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectivenessField {
    /// The gate blocked a call.
    Blocks,
    /// The agent retried the same call without consulting memory — the
    /// block was worked around.
    Overrides,
    /// Memory or fix history was consulted between block and retry — the
    /// block forced a better approach.
    Prevented,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateEffectiveness {
    pub blocks: u64,
    pub overrides: u64,
    pub prevented: u64,
}

/// Atomically increment one effectiveness counter for a gate.
pub fn record_effectiveness(paths: &Paths, gate: &str, field: EffectivenessField) {
    let mut data = load_effectiveness(paths);
    let entry = data.entry(gate.to_string()).or_default();
    match field {
        EffectivenessField::Blocks => entry.blocks += 1,
        EffectivenessField::Overrides => entry.overrides += 1,
        EffectivenessField::Prevented => entry.prevented += 1,
    }

    let target = paths.gate_effectiveness();
    let Some(dir) = target.parent() else { return };
    let _ = std::fs::create_dir_all(dir);
    let Ok(mut tmp) = tempfile::Builder::new()
        .prefix(".effectiveness_tmp_")
        .tempfile_in(dir)
    else {
        return;
    };
    if serde_json::to_writer_pretty(tmp.as_file_mut(), &data).is_err() {
        return;
    }
    let _ = tmp.as_file_mut().flush();
    let _ = tmp.persist(&target);
}

/// Load the persistent effectiveness table (empty on any error).
pub fn load_effectiveness(paths: &Paths) -> HashMap<String, GateEffectiveness> {
    std::fs::read_to_string(paths.gate_effectiveness())
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
