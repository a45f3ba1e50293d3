//! Filesystem layout and live configuration.
//!
//! Every toolgate invocation works against a single root directory
//! (`$TOOLGATE_DIR`, defaulting to `~/.claude/hooks`). All shared mutable
//! documents — state files, audit logs, breaker/router/cache snapshots —
//! live under this root so that concurrent sessions coordinate purely
//! through files. `Paths` is the one place that knows the layout.
//!
//! Live toggles (`security_profile`, cache enablement, mentor switches)
//! come from `<root>/config.json` and are read once per process.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding the hooks root (used by tests).
pub const ROOT_ENV_VAR: &str = "TOOLGATE_DIR";

/// Resolved file locations for one invocation.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Resolve the root from `$TOOLGATE_DIR`, falling back to
    /// `~/.claude/hooks`.
    pub fn resolve() -> Self {
        let root = std::env::var_os(ROOT_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".claude")
                    .join("hooks")
            });
        Self { root }
    }

    /// Build a layout rooted at an explicit directory (test helper and
    /// embedding API).
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-session state document.
    pub fn state_file(&self, session_id: &str) -> PathBuf {
        self.root
            .join(format!("state_{}.json", sanitize_session_id(session_id)))
    }

    /// Advisory lock file guarding the state document.
    pub fn state_lock_file(&self, session_id: &str) -> PathBuf {
        self.root
            .join(format!("state_{}.json.lock", sanitize_session_id(session_id)))
    }

    /// Enforcer→tracker sideband for a session.
    pub fn enforcer_sideband(&self, session_id: &str) -> PathBuf {
        self.root.join(format!(
            ".enforcer_sideband_{}.json",
            sanitize_session_id(session_id)
        ))
    }

    /// Memory-query timestamp sideband (written by the memory worker).
    pub fn memory_timestamp_file(&self) -> PathBuf {
        self.root.join(".memory_last_queried")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn audit_trail(&self) -> PathBuf {
        self.root.join(".audit_trail.jsonl")
    }

    pub fn capture_queue(&self) -> PathBuf {
        self.root.join(".capture_queue.jsonl")
    }

    pub fn gate_effectiveness(&self) -> PathBuf {
        self.root.join(".gate_effectiveness.json")
    }

    pub fn gate_qtable(&self) -> PathBuf {
        self.root.join(".gate_qtable.json")
    }

    pub fn gate_timings(&self) -> PathBuf {
        self.root.join(".gate_timings.json")
    }

    pub fn gate_breaker_state(&self) -> PathBuf {
        self.root.join(".circuit_breaker_state.json")
    }

    pub fn service_breaker_state(&self) -> PathBuf {
        self.root.join(".service_breaker.json")
    }

    pub fn gate_result_cache(&self) -> PathBuf {
        self.root.join(".gate_result_cache.json")
    }

    pub fn file_claims(&self) -> PathBuf {
        self.root.join(".file_claims.json")
    }

    pub fn gate_overrides(&self) -> PathBuf {
        self.root.join(".gate_overrides.json")
    }

    /// Watermark recording the last observed mtime of the overrides file.
    pub fn gate_overrides_watermark(&self) -> PathBuf {
        self.root.join(".gate_overrides.mtime")
    }

    pub fn live_config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn session_stats(&self) -> PathBuf {
        self.root.join(".session_stats.json")
    }

    /// Unix domain socket of the memory worker.
    pub fn memory_socket(&self) -> PathBuf {
        self.root.join(".memory_worker.sock")
    }

    /// Create the root (and audit dir) if missing. Best-effort.
    pub fn ensure_dirs(&self) {
        let _ = std::fs::create_dir_all(&self.root);
        let _ = std::fs::create_dir_all(self.audit_dir());
    }
}

/// Sanitize a session id for use as a filename component.
///
/// Keeps `[A-Za-z0-9_-]`; an id that sanitizes to nothing becomes "main".
pub fn sanitize_session_id(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if safe.is_empty() {
        "main".to_string()
    } else {
        safe
    }
}

/// Live toggles from `<root>/config.json`.
///
/// Unknown keys are ignored; a missing or unparseable file yields defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Active risk profile: "strict" | "balanced" | "permissive".
    pub security_profile: String,
    /// Master switch for the gate-result cache.
    pub gate_cache_enabled: bool,
    /// Advisory mentor subsystems in the tracker.
    pub mentor_enabled: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            security_profile: "balanced".to_string(),
            gate_cache_enabled: true,
            mentor_enabled: false,
        }
    }
}

impl LiveConfig {
    /// Load toggles, falling back to defaults on any error.
    pub fn load(paths: &Paths) -> Self {
        match std::fs::read_to_string(paths.live_config()) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_session_id("abc/../etc"), "abcetc");
        assert_eq!(sanitize_session_id("team-2_worker"), "team-2_worker");
        assert_eq!(sanitize_session_id("///"), "main");
        assert_eq!(sanitize_session_id(""), "main");
    }

    #[test]
    fn state_file_uses_sanitized_id() {
        let paths = Paths::from_root("/tmp/tg");
        assert!(paths
            .state_file("a/b")
            .to_string_lossy()
            .ends_with("state_ab.json"));
    }

    #[test]
    fn live_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LiveConfig::load(&Paths::from_root(dir.path()));
        assert_eq!(cfg.security_profile, "balanced");
        assert!(cfg.gate_cache_enabled);
    }
}
