//! Normalization of raw error output into stable pattern labels.
//!
//! Gate messages, test stderr, and tool failures are noisy; the tracker
//! keys its frequency counters and causal chains on a small set of
//! canonical labels instead. Unmatched text falls back to
//! `other:unclassified`.

use once_cell::sync::Lazy;
use regex::Regex;

/// Label used when no pattern matches.
pub const FALLBACK_PATTERN: &str = "other:unclassified";

static PATTERN_TABLE: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let table: &[(&str, &str)] = &[
        // Gate-enforcement refusals
        (r"(?i)read .{0,80}before edit", "gate1:read-before-edit"),
        (r"(?i)(rm\s*-rf|DROP TABLE|reset --hard|force.?push|no.?destroy)", "gate2:destructive-command"),
        (r"(?i)(deploy.*no tests|tests.*before deploy)", "gate3:deploy-without-tests"),
        (r"(?i)(memory.*not.*queried|query.*memory.*first)", "gate4:memory-not-queried"),
        (r"(?i)(proof.*before.*fixed|verification score)", "gate5:proof-missing"),
        (r"(?i)(save.*to.*memory|remember.*fix)", "gate6:fix-not-saved"),
        (r"(?i)(critical file|sensitive.*file)", "gate7:critical-file-access"),
        (r"(?i)(strategy.*banned|proven.*fail)", "gate9:banned-strategy"),
        (r"(?i)(rate limit|too many tool calls|rolling window.*exceeded)", "gate11:rate-limit"),
        (r"(?i)(workspace.*claimed|concurrent edit)", "gate13:workspace-conflict"),
        (r"(?i)(causal chain|fix_history.*required)", "gate15:causal-chain-skipped"),
        // Language / runtime errors
        (r"(?i)\bAssertionError\b", "test:assertion"),
        (r"(?i)\bAttributeError\b", "python:attribute-error"),
        (r"(?i)\bKeyError\b", "python:key-error"),
        (r"(?i)\bTypeError\b", "python:type-error"),
        (r"(?i)\b(ImportError|ModuleNotFoundError)\b", "import:missing-module"),
        (r"(?i)\bSyntaxError\b", "syntax:parse-error"),
        (r"(?i)cannot borrow|borrow checker", "rust:borrowck"),
        (r"(?i)error\[E\d{4}\]", "rust:compile-error"),
        (r"(?i)panicked at", "rust:panic"),
        (r"(?i)\bsegmentation fault\b", "native:segfault"),
        // Filesystem / environment
        (r"(?i)(no such file or directory|FileNotFoundError)", "filesystem:not-found"),
        (r"(?i)permission denied", "filesystem:permission-denied"),
        (r"(?i)(disk full|no space left)", "filesystem:disk-full"),
        (r"(?i)(connection refused|connection reset|timed? ?out)", "transient:network"),
        (r"(?i)command not found", "environmental:missing-binary"),
        // Test-runner summaries
        (r"(?i)\d+ (failed|failures?)", "test:failures"),
        (r"(?i)FAILED [\w/\.]+::", "test:failures"),
    ];
    table
        .iter()
        .filter_map(|(pat, label)| Regex::new(pat).ok().map(|re| (re, *label)))
        .collect()
});

/// Normalize an error message to its canonical pattern label.
pub fn extract_pattern(error_msg: &str) -> &'static str {
    let msg = error_msg.trim();
    if msg.is_empty() {
        return FALLBACK_PATTERN;
    }
    for (regex, label) in PATTERN_TABLE.iter() {
        if regex.is_match(msg) {
            return label;
        }
    }
    FALLBACK_PATTERN
}

/// Scan tool output for error lines worth tracking. Returns the first
/// matched pattern plus a short snippet, or `None` for clean output.
pub fn detect_error(output: &str) -> Option<(&'static str, String)> {
    for line in output.lines() {
        let pattern = extract_pattern(line);
        if pattern != FALLBACK_PATTERN {
            let snippet: String = line.chars().take(160).collect();
            return Some((pattern, snippet));
        }
    }
    None
}
