//! Per-session state: typed model, migrations, locked atomic persistence,
//! sidebands, and the persistent gate-effectiveness counters.
//!
//! Each session owns exactly one state document (`state_<id>.json`) and one
//! advisory lock file. Documents carry a `_version` schema number and are
//! migrated forward on load; invariants are re-validated on every load and
//! save so a corrupt or hand-edited document cannot poison the gates.

mod claims;
mod effectiveness;
mod migrate;
mod model;
mod sideband;
mod store;

pub use claims::{claim_file, read_claims, FileClaim, CLAIM_TTL_SECS};
pub use effectiveness::{
    load_effectiveness, record_effectiveness, EffectivenessField, GateEffectiveness,
};
pub use migrate::{migrate_document, STATE_VERSION};
pub use model::{
    normalize_path, BanRecord, BlockOutcome, SessionState, StrategyRecord, SubagentHandle,
    TestFailure, TimingEntry,
};
pub use sideband::{
    delete_enforcer_sideband, effective_memory_last_queried, merge_sideband,
    read_enforcer_sideband, refresh_memory_timestamp, write_enforcer_sideband,
};
pub use store::{cleanup_all_states, load_state, reset_state, save_state};

/// Seconds since the Unix epoch as a float, the timestamp unit used
/// throughout state documents.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
