//! Workspace-isolation claim registry (`.file_claims.json`).
//!
//! A shared document mapping edited paths to the session that last touched
//! them. The tracker writes a claim after every edit; gate 13 reads it to
//! refuse writes to files another live session is working on. All
//! read-modify-write cycles hold an exclusive lock on the document itself.

use super::{normalize_path, now_epoch};
use crate::config::Paths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Claims older than this are considered abandoned.
pub const CLAIM_TTL_SECS: f64 = 600.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileClaim {
    pub session_id: String,
    pub claimed_at: f64,
}

/// Record that `session_id` is working on `path`. Stale claims are pruned
/// in the same write. Fail-open.
pub fn claim_file(paths: &Paths, session_id: &str, path: &str) {
    if path.is_empty() {
        return;
    }
    let normalized = normalize_path(path);
    let claims_file = paths.file_claims();
    if let Some(dir) = claims_file.parent() {
        let _ = std::fs::create_dir_all(dir);
    }

    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&claims_file)
    {
        Ok(f) => f,
        Err(err) => {
            debug!(error = %err, "claims file open failed");
            return;
        }
    };

    let mut lock = fd_lock::RwLock::new(file);
    let Ok(mut guard) = lock.write() else {
        debug!("claims lock unavailable, skipping claim");
        return;
    };

    let mut raw = String::new();
    let _ = guard.read_to_string(&mut raw);
    let mut claims: HashMap<String, FileClaim> =
        serde_json::from_str(&raw).unwrap_or_default();

    let now = now_epoch();
    claims.retain(|_, claim| now - claim.claimed_at < CLAIM_TTL_SECS);
    claims.insert(
        normalized,
        FileClaim {
            session_id: session_id.to_string(),
            claimed_at: now,
        },
    );

    let Ok(serialized) = serde_json::to_string(&claims) else {
        return;
    };
    if guard.seek(SeekFrom::Start(0)).is_ok() {
        let _ = guard.set_len(0);
        let _ = guard.write_all(serialized.as_bytes());
    }
}

/// Read the claim registry (empty on any error).
pub fn read_claims(paths: &Paths) -> HashMap<String, FileClaim> {
    std::fs::read_to_string(paths.file_claims())
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
