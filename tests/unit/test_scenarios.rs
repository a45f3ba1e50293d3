//! Cross-component scenario tests through the library API.

use serde_json::json;
use toolgate::audit::AuditLog;
use toolgate::breaker::{GateBreaker, GATE_CRASH_THRESHOLD};
use toolgate::config::Paths;
use toolgate::dispatch::{enforce, EnforcerDecision};
use toolgate::state::{load_state, now_epoch, refresh_memory_timestamp, save_state};
use toolgate::tracker::track;

fn temp_paths() -> (tempfile::TempDir, Paths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::from_root(dir.path());
    paths.ensure_dirs();
    (dir, paths)
}

fn pre(tool: &str, input: serde_json::Value) -> String {
    json!({ "session_id": "sess", "tool_name": tool, "tool_input": input }).to_string()
}

fn post(tool: &str, input: serde_json::Value, response: serde_json::Value) -> String {
    json!({
        "session_id": "sess",
        "tool_name": tool,
        "tool_input": input,
        "tool_response": response,
    })
    .to_string()
}

/// Read-before-edit, end to end: block, read, track, retry.
#[test]
fn read_before_edit_cycle() {
    let (_dir, paths) = temp_paths();

    let blocked = enforce(&paths, &pre("Edit", json!({"file_path": "/src/a.py", "old_string": "x"})));
    let EnforcerDecision::Block(message) = &blocked.decision else {
        panic!("expected block, got {:?}", blocked.decision);
    };
    assert!(message.contains("READ BEFORE EDIT"));
    let state = load_state(&paths, "sess");
    assert!(state.files_read.is_empty());
    assert!(state.pending_verification.is_empty());

    // Read is always allowed; the tracker records it.
    let read = enforce(&paths, &pre("Read", json!({"file_path": "/src/a.py"})));
    assert!(matches!(read.decision, EnforcerDecision::Pass));
    track(&paths, &post("Read", json!({"file_path": "/src/a.py"}), json!({})));
    assert_eq!(load_state(&paths, "sess").files_read, vec!["/src/a.py"]);

    // The same edit now proceeds.
    let retried = enforce(&paths, &pre("Edit", json!({"file_path": "/src/a.py", "old_string": "x"})));
    assert!(
        matches!(retried.decision, EnforcerDecision::Pass),
        "expected pass, got {:?}",
        retried.decision
    );
}

/// Verification graduation: edit, then a targeted test promotes the file.
#[test]
fn verification_graduation_cycle() {
    let (_dir, paths) = temp_paths();
    track(&paths, &post("Edit", json!({"file_path": "/src/a.py"}), json!({})));

    let state = load_state(&paths, "sess");
    assert_eq!(state.pending_verification, vec!["/src/a.py"]);

    track(
        &paths,
        &post(
            "Bash",
            json!({"command": "pytest tests/test_a.py"}),
            json!({"exit_code": 0, "output": "1 passed"}),
        ),
    );
    let state = load_state(&paths, "sess");
    assert!(state.pending_verification.is_empty());
    assert_eq!(state.verified_fixes, vec!["/src/a.py"]);
    assert!(state.last_test_run > 0.0);
    assert!(state.session_test_baseline);
}

/// Circuit-breaker skip: after repeated crashes a non-Tier-1 gate is not
/// invoked, and the dispatcher continues through the rest.
#[test]
fn breaker_skips_crashing_gate() {
    let (_dir, paths) = temp_paths();
    refresh_memory_timestamp(&paths);
    let mut state = load_state(&paths, "sess");
    state.files_read.push("/src/a.py".to_string());
    state.session_test_baseline = true;
    save_state(&paths, &mut state, "sess").unwrap();

    let breaker = GateBreaker::new(&paths);
    for _ in 0..GATE_CRASH_THRESHOLD {
        breaker.record_result("confidence_check", false);
    }
    assert!(breaker.should_skip_gate("confidence_check"));

    let outcome = enforce(
        &paths,
        &pre("Edit", json!({"file_path": "/src/a.py", "old_string": "x", "new_string": "y"})),
    );
    assert!(matches!(outcome.decision, EnforcerDecision::Pass));

    // No audit entry for the skipped gate; others did run.
    let audit = AuditLog::new(&paths);
    assert!(audit
        .recent_decisions(Some("GATE 14: CONFIDENCE CHECK"), 50)
        .is_empty());
    assert!(!audit
        .recent_decisions(Some("GATE 1: READ BEFORE EDIT"), 50)
        .is_empty());
}

/// Block outcomes age out of the resolution window.
#[test]
fn block_outcomes_age_out() {
    let (_dir, paths) = temp_paths();
    let mut state = load_state(&paths, "sess");
    state.gate_block_outcomes.push(toolgate::state::BlockOutcome {
        gate: "memory_first".to_string(),
        tool: "Edit".to_string(),
        file: "/old.py".to_string(),
        timestamp: now_epoch() - 4000.0,
        resolved_by: Some("override".to_string()),
    });
    save_state(&paths, &mut state, "sess").unwrap();

    track(&paths, &post("Read", json!({"file_path": "/x.py"}), json!({})));
    assert!(load_state(&paths, "sess").gate_block_outcomes.is_empty());
}

/// Warnings from the enforcer do not stop the call, and per-gate block
/// counters survive into the session summary.
#[test]
fn session_summary_reflects_blocks() {
    let (_dir, paths) = temp_paths();
    let _ = enforce(&paths, &pre("Bash", json!({"command": "rm -rf /"})));
    let _ = enforce(&paths, &pre("Bash", json!({"command": "rm -rf /"})));

    let summary = toolgate::finish_session(&paths, r#"{"session_id": "sess"}"#);
    assert_eq!(summary["blocks"], 2);
    assert_eq!(summary["top_blocking_gates"][0]["gate"], "no_destroy");
}
