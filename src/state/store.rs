//! Locked, atomic persistence for session state documents.
//!
//! Reads take a shared advisory lock on `<state>.json.lock`; writes take an
//! exclusive one. Writes always go through a uniquely-named temp file in
//! the same directory followed by an atomic rename, so a crash mid-save
//! leaves the previous document intact. If the lock file itself cannot be
//! acquired, reads fall back to an unlocked best-effort read.

use super::{migrate_document, SessionState};
use crate::config::Paths;
use crate::errors::StateError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use tracing::{debug, warn};

/// Load the state document for a session.
///
/// Missing file, unparseable JSON, or an unreadable lock all degrade to a
/// fresh default state — enforcement must keep working over a corrupt
/// document (the corruption is logged, not propagated).
pub fn load_state(paths: &Paths, session_id: &str) -> SessionState {
    let state_file = paths.state_file(session_id);
    if !state_file.exists() {
        return SessionState::default();
    }

    let raw = match open_lock(paths, session_id) {
        Ok(lock_fd) => {
            let mut lock = fd_lock::RwLock::new(lock_fd);
            let result = match lock.read() {
                Ok(_guard) => std::fs::read_to_string(&state_file),
                Err(err) => {
                    debug!(error = %err, "shared lock unavailable, unlocked read fallback");
                    std::fs::read_to_string(&state_file)
                }
            };
            result
        }
        Err(err) => {
            debug!(error = %err, "lock file unavailable, unlocked read fallback");
            std::fs::read_to_string(&state_file)
        }
    };

    let raw = match raw {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %state_file.display(), error = %err, "state read failed, using defaults");
            return SessionState::default();
        }
    };

    let doc: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(path = %state_file.display(), error = %err, "state parse failed, using defaults");
            return SessionState::default();
        }
    };

    let migrated = migrate_document(doc);
    let mut state: SessionState = match serde_json::from_value(migrated) {
        Ok(state) => state,
        Err(err) => {
            warn!(error = %err, "state deserialization failed, using defaults");
            SessionState::default()
        }
    };
    state.validate();
    state
}

/// Persist the state document for a session atomically.
pub fn save_state(
    paths: &Paths,
    state: &mut SessionState,
    session_id: &str,
) -> Result<(), StateError> {
    state.validate();
    paths.ensure_dirs();

    let state_file = paths.state_file(session_id);
    let write_err = |message: String| StateError::Write {
        path: state_file.clone(),
        message,
    };
    let dir = state_file
        .parent()
        .ok_or_else(|| write_err("no parent directory".to_string()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".state_tmp_")
        .tempfile_in(dir)
        .map_err(|e| write_err(e.to_string()))?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), state)
        .map_err(|e| write_err(e.to_string()))?;
    tmp.as_file_mut()
        .flush()
        .map_err(|e| write_err(e.to_string()))?;

    let lock_path = paths.state_lock_file(session_id);
    let lock_fd = open_lock(paths, session_id).map_err(|_| StateError::LockUnavailable {
        path: lock_path.clone(),
    })?;
    let mut lock = fd_lock::RwLock::new(lock_fd);
    let _guard = lock
        .write()
        .map_err(|_| StateError::LockUnavailable { path: lock_path })?;
    tmp.persist(&state_file)
        .map_err(|e| write_err(e.to_string()))?;
    Ok(())
}

/// Reset a session to a fresh default document.
pub fn reset_state(paths: &Paths, session_id: &str) -> Result<(), StateError> {
    let mut state = SessionState::default();
    save_state(paths, &mut state, session_id)
}

/// Remove all session state files and their locks (session-boot cleanup).
/// In-progress temp files are left alone.
pub fn cleanup_all_states(paths: &Paths) {
    let Some(root) = paths.root().to_str() else {
        return;
    };
    for pattern in [
        format!("{root}/state_*.json"),
        format!("{root}/state_*.json.lock"),
    ] {
        let Ok(entries) = glob::glob(&pattern) else {
            continue;
        };
        for entry in entries.flatten() {
            if entry.extension().map(|e| e == "tmp").unwrap_or(false) {
                continue;
            }
            let _ = std::fs::remove_file(entry);
        }
    }
}

fn open_lock(paths: &Paths, session_id: &str) -> std::io::Result<File> {
    paths.ensure_dirs();
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.state_lock_file(session_id))
}
