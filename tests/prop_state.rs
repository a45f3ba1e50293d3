//! Property tests over state persistence and cache keying.

use proptest::prelude::*;
use serde_json::json;
use toolgate::cache::cache_key;
use toolgate::config::Paths;
use toolgate::state::{load_state, normalize_path, save_state, SessionState};

fn path_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec("[a-z]{1,8}", 1..5).prop_map(|segs| format!("/{}", segs.join("/")))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Saving then reloading is a fixed point for the path sets.
    #[test]
    fn save_load_round_trips(paths_read in proptest::collection::vec(path_strategy(), 0..30)) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Paths::from_root(dir.path());

        let mut state = SessionState::default();
        state.files_read = paths_read;
        save_state(&layout, &mut state, "prop").unwrap();
        let reloaded = load_state(&layout, "prop");
        // After validation the in-memory and on-disk views agree.
        prop_assert_eq!(&state.files_read, &reloaded.files_read);

        let mut second = reloaded.clone();
        save_state(&layout, &mut second, "prop").unwrap();
        prop_assert_eq!(&reloaded.files_read, &load_state(&layout, "prop").files_read);
    }

    /// Pending and verified stay disjoint no matter the input overlap.
    #[test]
    fn pending_verified_always_disjoint(
        pending in proptest::collection::vec(path_strategy(), 0..20),
        verified in proptest::collection::vec(path_strategy(), 0..20),
    ) {
        let mut state = SessionState::default();
        state.pending_verification = pending;
        state.verified_fixes = verified;
        state.validate();
        for p in &state.pending_verification {
            prop_assert!(!state.verified_fixes.contains(p));
        }
    }

    /// Lexical normalization is idempotent.
    #[test]
    fn normalize_path_idempotent(raw in "[a-z./]{1,40}") {
        let once = normalize_path(&raw);
        prop_assert_eq!(normalize_path(&once), once.clone());
    }

    /// Changing a salient field always changes the cache key; changing a
    /// non-salient field never does.
    #[test]
    fn cache_key_tracks_salient_fields(
        cmd_a in "[a-z ]{1,20}",
        cmd_b in "[a-z ]{1,20}",
        noise in "[a-z]{1,10}",
    ) {
        let key_a = cache_key("g", "Bash", &json!({"command": cmd_a}));
        let key_b = cache_key("g", "Bash", &json!({"command": cmd_b}));
        if cmd_a != cmd_b {
            prop_assert_ne!(key_a.clone(), key_b);
        } else {
            prop_assert_eq!(key_a.clone(), key_b);
        }
        let with_noise = cache_key("g", "Bash", &json!({"command": cmd_a, "unrelated": noise}));
        prop_assert_eq!(key_a, with_noise);
    }
}
