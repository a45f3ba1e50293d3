//! Sideband files: short-lived carriers between invocations.
//!
//! The enforcer sideband carries state mutations from a PreToolUse
//! invocation to the tracker's next PostToolUse invocation without waiting
//! for the tracker to promote them into the main state file. The tracker
//! merges it into the loaded state and deletes it on first read.
//!
//! The memory-timestamp sideband is written by the memory worker on every
//! query and lives on durable disk; the effective "memory was queried"
//! time is the max of the in-state timestamp and the sideband, clamped to
//! wall-clock now so a future-dated file cannot bypass gates forever.

use super::{now_epoch, SessionState};
use crate::config::Paths;
use serde_json::Value;
use std::io::Write;
use tracing::debug;

/// Write the enforcer's view of state to the sideband file (atomic,
/// fail-open: a lost sideband loses mutations but never blocks work).
pub fn write_enforcer_sideband(paths: &Paths, state: &SessionState, session_id: &str) {
    let target = paths.enforcer_sideband(session_id);
    let Some(dir) = target.parent() else { return };
    let _ = std::fs::create_dir_all(dir);
    let Ok(mut tmp) = tempfile::Builder::new()
        .prefix(".sideband_tmp_")
        .tempfile_in(dir)
    else {
        return;
    };
    if serde_json::to_writer(tmp.as_file_mut(), state).is_err() {
        return;
    }
    let _ = tmp.as_file_mut().flush();
    if let Err(err) = tmp.persist(&target) {
        debug!(error = %err, "sideband write failed");
    }
}

/// Read the enforcer sideband as a raw document, or `None` if absent or
/// unparseable.
pub fn read_enforcer_sideband(paths: &Paths, session_id: &str) -> Option<Value> {
    let raw = std::fs::read_to_string(paths.enforcer_sideband(session_id)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Delete the enforcer sideband after the tracker has promoted it.
pub fn delete_enforcer_sideband(paths: &Paths, session_id: &str) {
    let _ = std::fs::remove_file(paths.enforcer_sideband(session_id));
}

/// Merge sideband keys over the loaded state. Underscore-prefixed keys are
/// invocation-internal and skipped. Returns the merged state; on any merge
/// failure the original state is returned untouched.
pub fn merge_sideband(state: SessionState, sideband: Value) -> SessionState {
    let Value::Object(incoming) = sideband else {
        return state;
    };
    let Ok(Value::Object(mut base)) = serde_json::to_value(&state) else {
        return state;
    };
    for (key, value) in incoming {
        if key.starts_with('_') && key != "_version" {
            continue;
        }
        base.insert(key, value);
    }
    match serde_json::from_value(Value::Object(base)) {
        Ok(merged) => merged,
        Err(err) => {
            debug!(error = %err, "sideband merge failed, keeping loaded state");
            state
        }
    }
}

/// Refresh the memory-timestamp sideband to "now". Used by the subagent
/// mini-boot so a fresh subagent gets a full memory-first window.
pub fn refresh_memory_timestamp(paths: &Paths) {
    let target = paths.memory_timestamp_file();
    let Some(dir) = target.parent() else { return };
    let _ = std::fs::create_dir_all(dir);
    let doc = serde_json::json!({ "timestamp": now_epoch() });
    let Ok(mut tmp) = tempfile::Builder::new()
        .prefix(".memts_tmp_")
        .tempfile_in(dir)
    else {
        return;
    };
    if serde_json::to_writer(tmp.as_file_mut(), &doc).is_err() {
        return;
    }
    let _ = tmp.persist(&target);
}

/// Effective memory-query timestamp: max of the per-session state value
/// and the worker-written sideband, clamped at wall-clock now.
pub fn effective_memory_last_queried(paths: &Paths, state: &SessionState) -> f64 {
    let mut sideband_ts = 0.0;
    if let Ok(raw) = std::fs::read_to_string(paths.memory_timestamp_file()) {
        if let Ok(doc) = serde_json::from_str::<Value>(&raw) {
            sideband_ts = doc.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        }
    }
    let clamped = sideband_ts.clamp(0.0, now_epoch());
    state.memory_last_queried.max(clamped)
}
