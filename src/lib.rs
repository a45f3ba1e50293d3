//! toolgate — policy enforcement and self-healing middleware for LLM
//! agent tool calls.
//!
//! The engine interposes between an agent and its tools as three
//! short-lived hook executables sharing one state schema and one storage
//! layout:
//!
//! - **enforce** (PreToolUse): runs a priority-ordered pipeline of gates
//!   that may pass, warn, ask for confirmation, or block the call before
//!   side effects occur. Fail-closed for Tier 1 safety concerns.
//! - **track** (PostToolUse): evolves per-session state (files read,
//!   test outcomes, causal chains, verification scores) and resolves
//!   deferred block outcomes. Fail-open, always exits 0.
//! - **session-end**: flushes the observation queue, bumps counters, and
//!   emits a session summary.
//!
//! Cross-invocation state lives in JSON documents under a shared root
//! with advisory locks and rename-atomic writes; there is no long-lived
//! daemon.

pub mod audit;
pub mod breaker;
pub mod cache;
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error_patterns;
pub mod errors;
pub mod event;
pub mod gates;
pub mod memory_socket;
pub mod router;
pub mod session_end;
pub mod state;
pub mod tracker;

pub use dispatch::{enforce, EnforcerDecision, EnforcerOutcome};
pub use session_end::finish_session;
pub use tracker::track;
