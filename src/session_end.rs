//! Session teardown: flush queues, bump counters, summarize.
//!
//! Fail-open like the tracker — always exits 0. The capture queue is
//! handed to the memory worker when it is reachable (and left on disk
//! when it is not), the persistent session counter advances, old audit
//! files are cleaned up, and a summary object lands on stdout for the
//! host.

use crate::audit::{AuditLog, CLEANUP_AGE_DAYS};
use crate::capture::{clear_queue, read_queue};
use crate::config::Paths;
use crate::event::SessionEndEvent;
use crate::memory_socket::MemoryWorker;
use crate::state::{load_state, now_epoch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct SessionStats {
    session_count: u64,
    last_session_end: f64,
    total_tool_calls: u64,
    total_blocks: u64,
}

/// Run the session-end hook over a raw stdin payload. Returns the
/// summary to print on stdout; never fails.
pub fn finish_session(paths: &Paths, raw_input: &str) -> Value {
    let event = SessionEndEvent::parse(raw_input).unwrap_or(SessionEndEvent {
        session_id: "main".to_string(),
        transcript_path: None,
        reason: None,
    });

    let state = load_state(paths, &event.session_id);
    let now = now_epoch();

    // Flush the capture queue through the memory worker. A down worker
    // leaves the queue in place for the next teardown.
    let queued = read_queue(paths).len() as u64;
    let mut flushed = 0u64;
    if queued > 0 {
        let worker = MemoryWorker::new(paths);
        if worker.is_available() {
            if let Some(count) = worker.flush() {
                flushed = count;
                clear_queue(paths);
                let _ = worker.backup();
            }
        } else {
            debug!("memory worker unavailable, capture queue left on disk");
        }
    }

    // Persistent session counter.
    let mut stats: SessionStats = std::fs::read_to_string(paths.session_stats())
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    stats.session_count += 1;
    stats.last_session_end = now;
    stats.total_tool_calls += state.total_tool_calls;
    let session_blocks: u64 = state.gate_block_counts.values().sum();
    stats.total_blocks += session_blocks;
    write_stats(paths, &stats);

    let audit = AuditLog::new(paths);
    let _ = audit.cleanup(CLEANUP_AGE_DAYS);
    let _ = audit.compact();

    let mut top_gates: Vec<(&String, &u64)> = state.gate_block_counts.iter().collect();
    top_gates.sort_by(|a, b| b.1.cmp(a.1));

    serde_json::json!({
        "session_id": event.session_id,
        "reason": event.reason,
        "duration_secs": (now - state.session_start).max(0.0),
        "tool_calls": state.total_tool_calls,
        "blocks": session_blocks,
        "top_blocking_gates": top_gates
            .iter()
            .take(3)
            .map(|(gate, count)| serde_json::json!({ "gate": gate, "blocks": count }))
            .collect::<Vec<_>>(),
        "files_edited": state.files_edited.len(),
        "verified_fixes": state.verified_fixes.len(),
        "injection_attempts": state.injection_attempts,
        "token_estimate": state.session_token_estimate,
        "observations_queued": queued,
        "observations_flushed": flushed,
        "session_count": stats.session_count,
    })
}

fn write_stats(paths: &Paths, stats: &SessionStats) {
    let target = paths.session_stats();
    let Some(dir) = target.parent() else { return };
    let _ = std::fs::create_dir_all(dir);
    let Ok(mut tmp) = tempfile::Builder::new()
        .prefix(".stats_tmp_")
        .tempfile_in(dir)
    else {
        return;
    };
    if serde_json::to_writer_pretty(tmp.as_file_mut(), stats).is_err() {
        return;
    }
    let _ = tmp.as_file_mut().flush();
    let _ = tmp.persist(&target);
}
