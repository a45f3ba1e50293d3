//! Schema migrations for state documents.
//!
//! Migrations run over the raw JSON value before typed deserialization so
//! that a v1 or v2 document from an older release loads without data loss.
//! Each migration is total: it fills new fields with defaults and never
//! fails. If a document somehow carries a version the chain cannot handle,
//! it is stamped with the current version and taken as-is — typed
//! deserialization backfills whatever is missing.

use serde_json::{json, Value};
use tracing::warn;

/// Current schema version.
pub const STATE_VERSION: u32 = 3;

/// Keys from removed features, dropped silently on load.
const ORPHANED_KEYS: &[&str] = &["edits_locked", "confidence_warnings", "gate12_warn_count"];

/// Migrate a raw state document forward to [`STATE_VERSION`].
pub fn migrate_document(mut doc: Value) -> Value {
    let Some(obj) = doc.as_object_mut() else {
        return json!({ "_version": STATE_VERSION });
    };

    let mut version = obj
        .get("_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    while version < STATE_VERSION {
        match version {
            1 => migrate_v1_to_v2(obj),
            2 => migrate_v2_to_v3(obj),
            other => {
                warn!(version = other, "no migration for state version, stamping current");
                break;
            }
        }
        version = obj
            .get("_version")
            .and_then(Value::as_u64)
            .unwrap_or(STATE_VERSION as u64) as u32;
    }

    for key in ORPHANED_KEYS {
        obj.remove(*key);
    }

    // Legacy ban format: a bare list of strategy ids instead of a map of
    // retry-budget records. Rewrite each id as an at-threshold record.
    if let Some(bans) = obj.get("active_bans").cloned() {
        if let Value::Array(ids) = bans {
            let now = super::now_epoch();
            let mut map = serde_json::Map::new();
            for id in ids.into_iter().filter_map(|v| v.as_str().map(String::from)) {
                map.insert(
                    id,
                    json!({ "fail_count": 3, "first_failed": now, "last_failed": now }),
                );
            }
            obj.insert("active_bans".to_string(), Value::Object(map));
        }
    }

    obj.insert("_version".to_string(), json!(STATE_VERSION));
    doc
}

/// v1 → v2: verification scoring, strategy tallies, and per-tool counters.
fn migrate_v1_to_v2(obj: &mut serde_json::Map<String, Value>) {
    for (key, default) in [
        ("gate6_warn_count", json!(0)),
        ("verification_scores", json!({})),
        ("successful_strategies", json!({})),
        ("tool_call_counts", json!({})),
        ("total_tool_calls", json!(0)),
        ("active_subagents", json!([])),
        ("subagent_total_tokens", json!(0)),
        ("subagent_history", json!([])),
    ] {
        obj.entry(key.to_string()).or_insert(default);
    }
    obj.insert("_version".to_string(), json!(2));
}

/// v2 → v3: causal-chain enforcement fields.
fn migrate_v2_to_v3(obj: &mut serde_json::Map<String, Value>) {
    for (key, default) in [
        ("recent_test_failure", Value::Null),
        ("fix_history_queried", json!(0.0)),
        ("fixing_error", json!(false)),
    ] {
        obj.entry(key.to_string()).or_insert(default);
    }
    obj.insert("_version".to_string(), json!(3));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionState;

    #[test]
    fn v1_document_migrates_to_current() {
        let doc = json!({
            "files_read": ["/a.py"],
            "memory_last_queried": 123.0
        });
        let migrated = migrate_document(doc);
        assert_eq!(migrated["_version"], STATE_VERSION);
        assert_eq!(migrated["gate6_warn_count"], 0);
        assert_eq!(migrated["fixing_error"], false);

        let state: SessionState = serde_json::from_value(migrated).unwrap();
        assert_eq!(state.files_read, vec!["/a.py"]);
        assert_eq!(state.memory_last_queried, 123.0);
    }

    #[test]
    fn v3_document_is_untouched() {
        let doc = json!({
            "_version": 3,
            "files_read": ["/a.py"],
            "fixing_error": true
        });
        let migrated = migrate_document(doc);
        assert_eq!(migrated["_version"], 3);
        assert_eq!(migrated["fixing_error"], true);
    }

    #[test]
    fn orphaned_keys_are_dropped() {
        let doc = json!({
            "_version": 2,
            "edits_locked": true,
            "confidence_warnings": 4,
            "gate12_warn_count": 1
        });
        let migrated = migrate_document(doc);
        assert!(migrated.get("edits_locked").is_none());
        assert!(migrated.get("confidence_warnings").is_none());
        assert!(migrated.get("gate12_warn_count").is_none());
    }

    #[test]
    fn legacy_ban_list_becomes_threshold_records() {
        let doc = json!({
            "_version": 2,
            "active_bans": ["strategy-a", "strategy-b"]
        });
        let migrated = migrate_document(doc);
        let state: SessionState = serde_json::from_value(migrated).unwrap();
        assert_eq!(state.active_bans.len(), 2);
        assert_eq!(state.active_bans["strategy-a"].fail_count, 3);
    }

    #[test]
    fn non_object_document_resets_to_defaults() {
        let migrated = migrate_document(json!([1, 2, 3]));
        assert_eq!(migrated["_version"], STATE_VERSION);
    }
}
