//! The gate-result protocol.
//!
//! Every gate returns one of four variants. `Ask` is a special form of
//! block that carries a structured confirmation request for the host
//! instead of a hard refusal; the dispatcher renders it as a hook
//! decision on stdout.

use crate::audit::Severity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateResult {
    /// Nothing to report; the call proceeds.
    Pass,
    /// The call proceeds, but the message is surfaced on stderr.
    Warn { message: String, severity: Severity },
    /// The call is held pending explicit user confirmation.
    Ask { message: String, severity: Severity },
    /// The call is refused before side effects occur.
    Block { message: String, severity: Severity },
}

impl GateResult {
    pub fn warn(message: impl Into<String>) -> Self {
        GateResult::Warn {
            message: message.into(),
            severity: Severity::Warn,
        }
    }

    pub fn block(message: impl Into<String>, severity: Severity) -> Self {
        GateResult::Block {
            message: message.into(),
            severity,
        }
    }

    pub fn ask(message: impl Into<String>) -> Self {
        GateResult::Ask {
            message: message.into(),
            severity: Severity::Warn,
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, GateResult::Block { .. })
    }

    pub fn is_ask(&self) -> bool {
        matches!(self, GateResult::Ask { .. })
    }

    /// Blocked-or-ask: the signal the Q-learning router learns from.
    pub fn was_useful(&self) -> bool {
        self.is_blocking() || self.is_ask()
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            GateResult::Pass => None,
            GateResult::Warn { message, .. }
            | GateResult::Ask { message, .. }
            | GateResult::Block { message, .. } => Some(message),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            GateResult::Pass => Severity::Info,
            GateResult::Warn { severity, .. }
            | GateResult::Ask { severity, .. }
            | GateResult::Block { severity, .. } => *severity,
        }
    }

    /// Render an `Ask` as the host's hook-decision object. Only asks have
    /// a rendering; other variants return `None`.
    pub fn to_hook_decision(&self, gate_label: &str) -> Option<Value> {
        match self {
            GateResult::Ask { message, .. } => Some(serde_json::json!({
                "hookSpecificOutput": {
                    "hookEventName": "PreToolUse",
                    "permissionDecision": "ask",
                    "permissionDecisionReason": format!("[{gate_label}] {message}"),
                }
            })),
            _ => None,
        }
    }

    /// Downgrade a block to a warn (profile `warn` mode, PostToolUse
    /// scans). Other variants pass through unchanged.
    pub fn demoted_to_warn(self) -> Self {
        match self {
            GateResult::Block { message, severity } => GateResult::Warn { message, severity },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_renders_a_hook_decision() {
        let result = GateResult::ask("expensive model requested");
        let decision = result.to_hook_decision("GATE 10: MODEL ENFORCEMENT").unwrap();
        assert_eq!(
            decision["hookSpecificOutput"]["permissionDecision"],
            "ask"
        );
        assert!(GateResult::Pass.to_hook_decision("x").is_none());
    }

    #[test]
    fn usefulness_covers_block_and_ask() {
        assert!(GateResult::block("no", Severity::Error).was_useful());
        assert!(GateResult::ask("sure?").was_useful());
        assert!(!GateResult::warn("careful").was_useful());
        assert!(!GateResult::Pass.was_useful());
    }

    #[test]
    fn demote_turns_block_into_warn() {
        let demoted = GateResult::block("stop", Severity::Error).demoted_to_warn();
        assert!(matches!(demoted, GateResult::Warn { .. }));
        assert_eq!(demoted.message(), Some("stop"));
    }
}
