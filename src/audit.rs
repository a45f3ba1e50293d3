//! JSONL audit trail for gate decisions.
//!
//! Every decision is appended to two destinations: the day's rotating file
//! under `audit/YYYY-MM-DD.jsonl` and the persistent `.audit_trail.jsonl`.
//! The write path swallows every error — logging must never break
//! enforcement. Rotation kicks in at 5 MiB (current → `.1`, older
//! rotations gzipped, at most 10 kept); files older than 90 days are
//! eligible for cleanup.

use crate::config::Paths;
use crate::errors::AuditError;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};

const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;
const MAX_ROTATED_FILES: u32 = 10;
pub const CLEANUP_AGE_DAYS: u64 = 90;

/// What the dispatcher decided for one gate execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pass,
    Warn,
    Block,
    Ask,
    Crash,
    Slow,
    Reload,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Pass => "pass",
            Decision::Warn => "warn",
            Decision::Block => "block",
            Decision::Ask => "ask",
            Decision::Crash => "crash",
            Decision::Slow => "slow",
            Decision::Reload => "reload",
        };
        f.write_str(s)
    }
}

/// Severity attached to a decision or gate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: String,
    pub gate: String,
    pub tool: String,
    pub decision: Decision,
    pub reason: String,
    pub session_id: String,
    #[serde(default)]
    pub state_keys: Vec<String>,
    pub severity: Severity,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub agent_id: String,
}

/// Audit writer/reader bound to one filesystem layout.
pub struct AuditLog<'a> {
    paths: &'a Paths,
}

impl<'a> AuditLog<'a> {
    pub fn new(paths: &'a Paths) -> Self {
        Self { paths }
    }

    /// Append a gate decision. Never fails out of this function.
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        gate: &str,
        tool: &str,
        decision: Decision,
        reason: &str,
        session_id: &str,
        state_keys: &[&str],
        severity: Severity,
        file_path: &str,
    ) {
        let now = Utc::now();
        let entry = AuditEntry {
            id: ulid(now),
            timestamp: now.to_rfc3339(),
            gate: gate.to_string(),
            tool: tool.to_string(),
            decision,
            reason: reason.to_string(),
            session_id: session_id.to_string(),
            state_keys: state_keys.iter().map(|s| s.to_string()).collect(),
            severity,
            file_path: file_path.to_string(),
            agent_id: session_id.to_string(),
        };
        let Ok(mut line) = serde_json::to_string(&entry) else {
            return;
        };
        line.push('\n');

        let audit_dir = self.paths.audit_dir();
        let _ = std::fs::create_dir_all(&audit_dir);
        let daily = audit_dir.join(format!("{}.jsonl", now.format("%Y-%m-%d")));

        if let Ok(meta) = std::fs::metadata(&daily) {
            if meta.len() >= MAX_FILE_SIZE {
                rotate_file(&daily);
            }
        }

        append_line(&daily, &line);
        append_line(&self.paths.audit_trail(), &line);
    }

    /// Last `limit` entries from the persistent trail, newest first,
    /// optionally filtered by gate.
    pub fn recent_decisions(&self, gate: Option<&str>, limit: usize) -> Vec<AuditEntry> {
        let Ok(file) = std::fs::File::open(self.paths.audit_trail()) else {
            return Vec::new();
        };
        let reader = std::io::BufReader::new(file);
        let mut entries: Vec<AuditEntry> = reader
            .lines()
            .map_while(|l| l.ok())
            .filter_map(|l| serde_json::from_str(&l).ok())
            .filter(|e: &AuditEntry| gate.map(|g| e.gate == g).unwrap_or(true))
            .collect();
        entries.reverse();
        entries.truncate(limit);
        entries
    }

    /// Blocks from the trailing window, aggregated by gate and by tool.
    pub fn block_summary(&self, hours: u64) -> BlockSummary {
        let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);
        let mut by_gate: HashMap<String, u64> = HashMap::new();
        let mut by_tool: HashMap<String, u64> = HashMap::new();
        let mut total = 0u64;

        for entry in self.iter_daily_entries() {
            if entry.decision != Decision::Block {
                continue;
            }
            if !within_window(&entry.timestamp, cutoff) {
                continue;
            }
            *by_gate.entry(entry.gate).or_default() += 1;
            *by_tool.entry(entry.tool).or_default() += 1;
            total += 1;
        }

        BlockSummary {
            blocked_by_gate: by_gate,
            blocked_by_tool: by_tool,
            total_blocks: total,
        }
    }

    /// Pass/warn/block counts for one gate inside a trailing window.
    pub fn recent_gate_activity(&self, gate: &str, minutes: u64) -> GateActivity {
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes as i64);
        let mut activity = GateActivity::default();

        for entry in self.iter_daily_entries() {
            if entry.gate != gate || !within_window(&entry.timestamp, cutoff) {
                continue;
            }
            match entry.decision {
                Decision::Pass => activity.pass_count += 1,
                Decision::Block => activity.block_count += 1,
                Decision::Warn => activity.warn_count += 1,
                _ => {}
            }
        }
        activity
    }

    /// Fold all daily files (including rotations and gzipped archives)
    /// into `audit/summary.json`.
    pub fn compact(&self) -> Result<PathBuf, AuditError> {
        let compaction = |e: &dyn std::fmt::Display| AuditError::Compaction(e.to_string());
        let audit_dir = self.paths.audit_dir();
        std::fs::create_dir_all(&audit_dir).map_err(|e| compaction(&e))?;

        // date -> gate -> decision counts
        let mut daily: HashMap<String, HashMap<String, HashMap<String, u64>>> = HashMap::new();
        for entry in self.iter_all_entries() {
            let date = entry.timestamp.chars().take(10).collect::<String>();
            let gates = daily.entry(date).or_default();
            let counts = gates.entry(entry.gate).or_default();
            *counts.entry(entry.decision.to_string()).or_default() += 1;
        }

        let mut days: Vec<&String> = daily.keys().collect();
        days.sort();
        let summary: Vec<serde_json::Value> = days
            .into_iter()
            .map(|date| {
                let gates = &daily[date];
                let total: u64 = gates.values().flat_map(|c| c.values()).sum();
                serde_json::json!({ "date": date, "gates": gates, "total_events": total })
            })
            .collect();

        let target = audit_dir.join("summary.json");
        let mut tmp = tempfile::Builder::new()
            .prefix(".summary_tmp_")
            .tempfile_in(&audit_dir)
            .map_err(|e| compaction(&e))?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &summary).map_err(|e| compaction(&e))?;
        tmp.persist(&target).map_err(|e| compaction(&e))?;
        Ok(target)
    }

    /// Delete audit files older than `max_age_days`. Returns how many were
    /// removed. `summary.json` and in-progress temp files are spared.
    pub fn cleanup(&self, max_age_days: u64) -> u64 {
        let audit_dir = self.paths.audit_dir();
        let Ok(entries) = std::fs::read_dir(&audit_dir) else {
            return 0;
        };
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(max_age_days * 86_400);
        let mut deleted = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_audit = name.ends_with(".jsonl") || name.contains(".jsonl.") || name.ends_with(".gz");
            if !is_audit || name == "summary.json" || name.ends_with(".tmp") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            if mtime < cutoff && std::fs::remove_file(entry.path()).is_ok() {
                deleted += 1;
            }
        }
        deleted
    }

    fn iter_daily_entries(&self) -> impl Iterator<Item = AuditEntry> {
        let mut entries = Vec::new();
        if let Ok(dir) = std::fs::read_dir(self.paths.audit_dir()) {
            for file in dir.flatten() {
                let name = file.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".jsonl") {
                    continue;
                }
                entries.extend(read_jsonl(&file.path()));
            }
        }
        entries.into_iter()
    }

    fn iter_all_entries(&self) -> impl Iterator<Item = AuditEntry> {
        let mut entries = Vec::new();
        if let Ok(dir) = std::fs::read_dir(self.paths.audit_dir()) {
            for file in dir.flatten() {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.ends_with(".jsonl") || name.contains(".jsonl.") && !name.ends_with(".gz") {
                    entries.extend(read_jsonl(&file.path()));
                } else if name.ends_with(".gz") {
                    entries.extend(read_gzipped_jsonl(&file.path()));
                }
            }
        }
        entries.into_iter()
    }
}

#[derive(Debug, Default)]
pub struct BlockSummary {
    pub blocked_by_gate: HashMap<String, u64>,
    pub blocked_by_tool: HashMap<String, u64>,
    pub total_blocks: u64,
}

#[derive(Debug, Default)]
pub struct GateActivity {
    pub pass_count: u64,
    pub block_count: u64,
    pub warn_count: u64,
}

impl GateActivity {
    pub fn total(&self) -> u64 {
        self.pass_count + self.block_count + self.warn_count
    }
}

fn append_line(path: &Path, line: &str) {
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = file.write_all(line.as_bytes());
    }
}

fn within_window(timestamp: &str, cutoff: DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc) >= cutoff)
        .unwrap_or(false)
}

fn read_jsonl(path: &Path) -> Vec<AuditEntry> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    std::io::BufReader::new(file)
        .lines()
        .map_while(|l| l.ok())
        .filter_map(|l| serde_json::from_str(&l).ok())
        .collect()
}

fn read_gzipped_jsonl(path: &Path) -> Vec<AuditEntry> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut raw = String::new();
    if decoder.read_to_string(&mut raw).is_err() {
        return Vec::new();
    }
    raw.lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// Rotate: shift gzipped archives up, gzip the previous `.1`, move the
/// current file to `.1`. Rotation failure must not break logging.
fn rotate_file(path: &Path) {
    let base = path.to_string_lossy().into_owned();

    // Shift .N.gz upward; the oldest falls off the end.
    let _ = std::fs::remove_file(format!("{base}.{MAX_ROTATED_FILES}.gz"));
    for i in (1..MAX_ROTATED_FILES).rev() {
        let old = format!("{base}.{i}.gz");
        let new = format!("{base}.{}.gz", i + 1);
        if Path::new(&old).exists() {
            let _ = std::fs::rename(&old, &new);
        }
    }

    // Compress the previous .1 into .1.gz.
    let rotated_1 = format!("{base}.1");
    if Path::new(&rotated_1).exists() {
        if let Ok(raw) = std::fs::read(&rotated_1) {
            if let Ok(out) = std::fs::File::create(format!("{base}.1.gz")) {
                let mut encoder = GzEncoder::new(out, Compression::default());
                if encoder.write_all(&raw).is_ok() && encoder.finish().is_ok() {
                    let _ = std::fs::remove_file(&rotated_1);
                }
            }
        }
    }

    let _ = std::fs::rename(path, &rotated_1);
}

// ULID: 48-bit millisecond timestamp + 80-bit randomness, Crockford
// base32, lexicographically sortable.
const ULID_CHARS: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn ulid(now: DateTime<Utc>) -> String {
    let ts_ms = now.timestamp_millis().max(0) as u128;
    let rand_bits: u128 = ((rand::random::<u64>() as u128) << 16) | rand::random::<u16>() as u128;

    let mut out = String::with_capacity(26);
    for shift in (0..10).rev() {
        let idx = ((ts_ms >> (shift * 5)) & 0x1F) as usize;
        out.push(ULID_CHARS[idx] as char);
    }
    for shift in (0..16).rev() {
        let idx = ((rand_bits >> (shift * 5)) & 0x1F) as usize;
        out.push(ULID_CHARS[idx] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;

    fn temp_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        paths.ensure_dirs();
        (dir, paths)
    }

    #[test]
    fn log_writes_daily_file_and_trail() {
        let (_dir, paths) = temp_paths();
        let log = AuditLog::new(&paths);
        log.log(
            "no_destroy",
            "Bash",
            Decision::Block,
            "rm -rf refused",
            "s1",
            &[],
            Severity::Critical,
            "",
        );

        let entries = log.recent_decisions(None, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].gate, "no_destroy");
        assert_eq!(entries[0].decision, Decision::Block);
        assert_eq!(entries[0].severity, Severity::Critical);
        assert_eq!(entries[0].id.len(), 26);
    }

    #[test]
    fn recent_decisions_filters_by_gate_newest_first() {
        let (_dir, paths) = temp_paths();
        let log = AuditLog::new(&paths);
        log.log("a", "Bash", Decision::Pass, "", "s", &[], Severity::Info, "");
        log.log("b", "Bash", Decision::Warn, "w", "s", &[], Severity::Warn, "");
        log.log("a", "Edit", Decision::Block, "x", "s", &[], Severity::Error, "");

        let only_a = log.recent_decisions(Some("a"), 10);
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[0].tool, "Edit");
    }

    #[test]
    fn block_summary_counts_by_gate_and_tool() {
        let (_dir, paths) = temp_paths();
        let log = AuditLog::new(&paths);
        log.log("g1", "Edit", Decision::Block, "", "s", &[], Severity::Error, "");
        log.log("g1", "Bash", Decision::Block, "", "s", &[], Severity::Error, "");
        log.log("g2", "Bash", Decision::Pass, "", "s", &[], Severity::Info, "");

        let summary = log.block_summary(24);
        assert_eq!(summary.total_blocks, 2);
        assert_eq!(summary.blocked_by_gate["g1"], 2);
        assert_eq!(summary.blocked_by_tool["Edit"], 1);
    }

    #[test]
    fn gate_activity_counts_decisions() {
        let (_dir, paths) = temp_paths();
        let log = AuditLog::new(&paths);
        log.log("g", "Bash", Decision::Pass, "", "s", &[], Severity::Info, "");
        log.log("g", "Bash", Decision::Warn, "", "s", &[], Severity::Warn, "");
        log.log("g", "Bash", Decision::Block, "", "s", &[], Severity::Error, "");

        let activity = log.recent_gate_activity("g", 30);
        assert_eq!(activity.pass_count, 1);
        assert_eq!(activity.warn_count, 1);
        assert_eq!(activity.block_count, 1);
        assert_eq!(activity.total(), 3);
    }

    #[test]
    fn compact_produces_summary() {
        let (_dir, paths) = temp_paths();
        let log = AuditLog::new(&paths);
        log.log("g", "Bash", Decision::Pass, "", "s", &[], Severity::Info, "");
        let summary_path = log.compact().unwrap();
        let raw = std::fs::read_to_string(summary_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed[0]["total_events"], 1);
    }

    #[test]
    fn ulids_are_sortable_and_unique() {
        let now = Utc::now();
        let a = ulid(now);
        let b = ulid(now + chrono::Duration::milliseconds(5));
        assert!(a < b);
        assert_ne!(ulid(now), ulid(now));
    }

    #[test]
    fn rotation_moves_oversized_file_aside() {
        let (_dir, paths) = temp_paths();
        let daily = paths.audit_dir().join("2026-01-01.jsonl");
        std::fs::write(&daily, "x".repeat(10)).unwrap();
        rotate_file(&daily);
        assert!(!daily.exists());
        assert!(paths.audit_dir().join("2026-01-01.jsonl.1").exists());

        // A second rotation gzips the previous .1.
        std::fs::write(&daily, "y".repeat(10)).unwrap();
        rotate_file(&daily);
        assert!(paths.audit_dir().join("2026-01-01.jsonl.1.gz").exists());
    }
}
