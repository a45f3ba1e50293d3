//! TTL cache for non-blocking gate results.
//!
//! Avoids redundant gate evaluation when the same (gate, tool, input)
//! tuple is seen within the TTL window (retried tool calls). Only pass
//! and warn results are cached — blocks and asks always re-evaluate so
//! the agent can correct the condition and retry freely.
//!
//! Keys hash only the fields that affect gate decisions (e.g. `new_string`
//! on Edit is excluded) to avoid spurious misses. The cache is a small
//! persistent document rebuilt in memory per invocation and flushed once.

use crate::config::Paths;
use crate::gates::GateResult;
use crate::state::now_epoch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;

/// Seconds a cached result stays valid.
pub const CACHE_TTL_SECS: f64 = 60.0;

/// Fields included in the cache key, per tool.
const CACHE_KEY_FIELDS: &[(&str, &[&str])] = &[
    ("Edit", &["file_path", "old_string"]),
    ("Write", &["file_path"]),
    ("NotebookEdit", &["notebook_path", "cell_number"]),
    ("Bash", &["command"]),
    ("Task", &["model", "subagent_type", "description"]),
    ("WebFetch", &["url"]),
    ("WebSearch", &["query"]),
];
const CACHE_KEY_FIELDS_DEFAULT: &[&str] = &["file_path", "command", "url", "query"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    result: GateResult,
    stored_at: f64,
}

/// Observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub ttl_secs: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
}

/// Per-invocation handle over the persistent result cache.
pub struct GateResultCache {
    entries: HashMap<String, CacheEntry>,
    enabled: bool,
    hits: u64,
    misses: u64,
    dirty: bool,
}

impl GateResultCache {
    /// Load the cache document, dropping entries already past the TTL.
    pub fn load(paths: &Paths, enabled: bool) -> Self {
        let mut entries: HashMap<String, CacheEntry> =
            std::fs::read_to_string(paths.gate_result_cache())
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default();
        let now = now_epoch();
        entries.retain(|_, e| now - e.stored_at <= CACHE_TTL_SECS);
        Self {
            entries,
            enabled,
            hits: 0,
            misses: 0,
            dirty: false,
        }
    }

    /// Look up a cached result for this (gate, tool, input) tuple.
    pub fn get(&mut self, gate: &str, tool: &str, tool_input: &Value) -> Option<GateResult> {
        if !self.enabled {
            self.misses += 1;
            return None;
        }
        let key = cache_key(gate, tool, tool_input);
        let now = now_epoch();
        match self.entries.get(&key) {
            Some(entry) if now - entry.stored_at <= CACHE_TTL_SECS => {
                self.hits += 1;
                Some(entry.result.clone())
            }
            Some(_) => {
                self.entries.remove(&key);
                self.dirty = true;
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store a result if it is cache-eligible (pass or warn only).
    pub fn store(&mut self, gate: &str, tool: &str, tool_input: &Value, result: &GateResult) {
        if !self.enabled || result.is_blocking() || result.is_ask() {
            return;
        }
        let key = cache_key(gate, tool, tool_input);
        self.entries.insert(
            key,
            CacheEntry {
                result: result.clone(),
                stored_at: now_epoch(),
            },
        );
        self.dirty = true;
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            enabled: self.enabled,
            ttl_secs: CACHE_TTL_SECS,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total > 0 {
                self.hits as f64 / total as f64
            } else {
                0.0
            },
            entries: self.entries.len(),
        }
    }

    /// Persist the cache document (single write per invocation).
    pub fn flush(&self, paths: &Paths) {
        if !self.dirty {
            return;
        }
        let target = paths.gate_result_cache();
        let Some(dir) = target.parent() else { return };
        let _ = std::fs::create_dir_all(dir);
        let Ok(mut tmp) = tempfile::Builder::new()
            .prefix(".gate_cache_tmp_")
            .tempfile_in(dir)
        else {
            return;
        };
        if serde_json::to_writer(tmp.as_file_mut(), &self.entries).is_err() {
            return;
        }
        let _ = tmp.as_file_mut().flush();
        let _ = tmp.persist(&target);
    }
}

/// Stable 16-hex-char cache key: first 64 bits of SHA-256 over the
/// canonical (gate, tool, salient-fields) encoding.
pub fn cache_key(gate: &str, tool: &str, tool_input: &Value) -> String {
    let fields = CACHE_KEY_FIELDS
        .iter()
        .find(|(t, _)| *t == tool)
        .map(|(_, f)| *f)
        .unwrap_or(CACHE_KEY_FIELDS_DEFAULT);

    let mut salient = serde_json::Map::new();
    for field in fields {
        let value = tool_input
            .get(*field)
            .cloned()
            .unwrap_or(Value::String(String::new()));
        salient.insert(field.to_string(), value);
    }
    let raw = serde_json::json!([gate, tool, salient]).to_string();
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[..8])
}
