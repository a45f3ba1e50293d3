//! Per-gate runtime modes: security profiles plus the override overlay.
//!
//! The gate registry is compiled in; what changes at runtime is each
//! gate's mode — `enforce`, `warn` (blocks demoted to warnings), or
//! `disabled`. Modes come from the active security profile and from the
//! operator-editable `.gate_overrides.json`, which is re-read every
//! invocation. A watermark file records its last seen mtime so the
//! dispatcher can audit a `reload` when the overlay changes.
//!
//! Tier 1 gates are exempt from all of this: a profile never downgrades
//! them and an override attempting to disable one is a structural
//! failure that the dispatcher turns into a refuse-all-work block.

use super::{Gate, TIER1_GATE_NAMES};
use crate::config::Paths;
use crate::state::SessionState;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    Enforce,
    Warn,
    Disabled,
}

/// Parsed `.gate_overrides.json`: gate short name → mode.
#[derive(Debug, Clone, Default)]
pub struct GateOverrides {
    modes: HashMap<String, GateMode>,
    /// Overrides that try to disable a Tier 1 gate (structural failure).
    pub tier1_violations: Vec<String>,
    /// Set when the overlay file's mtime advanced past the watermark.
    pub changed_since_last_seen: bool,
}

impl GateOverrides {
    /// Load the overlay and advance the mtime watermark.
    pub fn load(paths: &Paths) -> Self {
        let target = paths.gate_overrides();
        let modes: HashMap<String, GateMode> = std::fs::read_to_string(&target)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let tier1_violations: Vec<String> = modes
            .iter()
            .filter(|(name, mode)| {
                TIER1_GATE_NAMES.contains(&name.as_str()) && **mode != GateMode::Enforce
            })
            .map(|(name, _)| name.clone())
            .collect();

        let changed_since_last_seen = advance_watermark(paths);

        Self {
            modes,
            tier1_violations,
            changed_since_last_seen,
        }
    }

    pub fn mode_for(&self, gate_name: &str) -> Option<GateMode> {
        self.modes.get(gate_name).copied()
    }
}

/// Compare the overlay mtime to the stored watermark; update it and
/// report whether it advanced. Best-effort on any I/O error.
fn advance_watermark(paths: &Paths) -> bool {
    let mtime = std::fs::metadata(paths.gate_overrides())
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64());
    let Some(mtime) = mtime else {
        return false;
    };

    let watermark_path = paths.gate_overrides_watermark();
    let last_seen: f64 = std::fs::read_to_string(&watermark_path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0.0);

    if mtime > last_seen {
        let _ = std::fs::write(&watermark_path, format!("{mtime}"));
        last_seen > 0.0
    } else {
        false
    }
}

/// The mode a gate runs in for this invocation.
///
/// Resolution: Tier 1 → always enforce; explicit override → that mode;
/// otherwise the active security profile (per-session, refreshed from the
/// live config by the dispatcher).
pub fn effective_gate_mode(gate: &Gate, state: &SessionState, overrides: &GateOverrides) -> GateMode {
    if gate.is_tier1() {
        return GateMode::Enforce;
    }
    if let Some(mode) = overrides.mode_for(gate.name) {
        return mode;
    }
    match state.security_profile.as_str() {
        "permissive" => {
            if gate.name == "canary" {
                GateMode::Disabled
            } else if gate.tier == 3 {
                GateMode::Warn
            } else {
                GateMode::Enforce
            }
        }
        // "strict" and "balanced" both enforce everything; strict exists
        // so operators can layer tighter overrides on top of it.
        _ => GateMode::Enforce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::gates::find_gate;

    fn write_overrides(paths: &Paths, body: &str) {
        std::fs::write(paths.gate_overrides(), body).unwrap();
    }

    #[test]
    fn profile_permissive_demotes_tier3() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        let overrides = GateOverrides::load(&paths);
        let mut state = SessionState::default();
        state.security_profile = "permissive".to_string();

        assert_eq!(
            effective_gate_mode(find_gate("rate_limit").unwrap(), &state, &overrides),
            GateMode::Warn
        );
        assert_eq!(
            effective_gate_mode(find_gate("canary").unwrap(), &state, &overrides),
            GateMode::Disabled
        );
        assert_eq!(
            effective_gate_mode(find_gate("memory_first").unwrap(), &state, &overrides),
            GateMode::Enforce
        );
    }

    #[test]
    fn tier1_is_never_downgraded() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        write_overrides(&paths, r#"{"no_destroy": "disabled"}"#);
        let overrides = GateOverrides::load(&paths);
        let mut state = SessionState::default();
        state.security_profile = "permissive".to_string();

        assert_eq!(
            effective_gate_mode(find_gate("no_destroy").unwrap(), &state, &overrides),
            GateMode::Enforce
        );
        assert_eq!(overrides.tier1_violations, vec!["no_destroy"]);
    }

    #[test]
    fn explicit_override_beats_profile() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        write_overrides(&paths, r#"{"code_quality": "disabled"}"#);
        let overrides = GateOverrides::load(&paths);
        let state = SessionState::default();

        assert_eq!(
            effective_gate_mode(find_gate("code_quality").unwrap(), &state, &overrides),
            GateMode::Disabled
        );
    }

    #[test]
    fn watermark_reports_change_on_second_sight() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        write_overrides(&paths, r#"{}"#);
        // First sight establishes the watermark, not a change.
        assert!(!GateOverrides::load(&paths).changed_since_last_seen);
        assert!(!GateOverrides::load(&paths).changed_since_last_seen);

        // Touch the file into the future to simulate an edit.
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(paths.gate_overrides())
            .unwrap();
        file.set_modified(future).unwrap();
        assert!(GateOverrides::load(&paths).changed_since_last_seen);
    }
}
