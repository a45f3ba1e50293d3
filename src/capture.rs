//! Append-only observation queue.
//!
//! The tracker emits one semantic observation per interesting event
//! (test passes, fixed errors, commits, heavy edit streaks). The queue is
//! drained out-of-process by the memory worker on session end; it is not
//! required for correctness of the core, so every write is best-effort.

use crate::config::Paths;
use crate::state::now_epoch;
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Random id so the worker can deduplicate replayed queue segments.
    pub id: String,
    pub timestamp: f64,
    pub session_id: String,
    pub summary: String,
    pub context: String,
    pub tags: String,
    pub critical: bool,
}

/// Append one observation to the capture queue (fail-open).
pub fn capture_observation(
    paths: &Paths,
    session_id: &str,
    summary: &str,
    context: &str,
    tags: &str,
    critical: bool,
) {
    let observation = Observation {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: now_epoch(),
        session_id: session_id.to_string(),
        summary: summary.to_string(),
        context: context.to_string(),
        tags: tags.to_string(),
        critical,
    };
    let Ok(mut line) = serde_json::to_string(&observation) else {
        return;
    };
    line.push('\n');

    let target = paths.capture_queue();
    if let Some(dir) = target.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&target)
    {
        let _ = file.write_all(line.as_bytes());
    }
}

/// Read all queued observations (empty on any error).
pub fn read_queue(paths: &Paths) -> Vec<Observation> {
    let Ok(raw) = std::fs::read_to_string(paths.capture_queue()) else {
        return Vec::new();
    };
    raw.lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// Remove the queue file after a successful flush.
pub fn clear_queue(paths: &Paths) {
    let _ = std::fs::remove_file(paths.capture_queue());
}
