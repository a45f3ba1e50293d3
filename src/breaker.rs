//! Circuit breakers: per-gate crash tracking and a general-purpose
//! service breaker for external collaborators.
//!
//! The gate breaker counts crashes in a sliding window and temporarily
//! skips gates that keep failing; Tier 1 safety gates are structurally
//! exempt and can never be skipped. The service breaker protects calls to
//! out-of-process services (the memory worker) with the classic
//! CLOSED/OPEN/HALF_OPEN machine.
//!
//! Both persist to small JSON documents under the hooks root so state is
//! shared across short-lived invocations. Every operation is fail-open:
//! on any I/O error the breaker reports closed, which for the pipeline
//! means the gate still runs (fail-closed enforcement).

use crate::config::Paths;
use crate::gates::TIER1_GATE_NAMES;
use crate::state::now_epoch;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Crashes within the sliding window that open a gate circuit.
pub const GATE_CRASH_THRESHOLD: usize = 3;
/// Sliding window for gate crashes, seconds.
pub const GATE_CRASH_WINDOW_SECS: f64 = 300.0;
/// Cooldown before an OPEN gate circuit allows a probe, seconds.
pub const GATE_COOLDOWN_SECS: f64 = 60.0;

/// Consecutive failures that open a service circuit.
pub const SERVICE_FAILURE_THRESHOLD: u32 = 5;
/// Seconds an OPEN service circuit waits before HALF_OPEN.
pub const SERVICE_RECOVERY_SECS: f64 = 60.0;
/// Successes in HALF_OPEN that close a service circuit.
pub const SERVICE_SUCCESS_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl Default for CircuitState {
    fn default() -> Self {
        CircuitState::Closed
    }
}

// ── Gate breaker ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateCircuit {
    pub state: CircuitState,
    pub crash_timestamps: Vec<f64>,
    pub opened_at: Option<f64>,
    pub total_crashes: u64,
    pub total_skips: u64,
}

impl GateCircuit {
    fn prune_window(&mut self, now: f64) {
        let cutoff = now - GATE_CRASH_WINDOW_SECS;
        self.crash_timestamps.retain(|t| *t >= cutoff);
    }

    fn maybe_recover(&mut self, now: f64) {
        if self.state == CircuitState::Open {
            let opened = self.opened_at.unwrap_or(0.0);
            if now - opened >= GATE_COOLDOWN_SECS {
                self.state = CircuitState::HalfOpen;
            }
        }
    }
}

/// Gate circuit breaker bound to one filesystem layout.
pub struct GateBreaker<'a> {
    paths: &'a Paths,
}

impl<'a> GateBreaker<'a> {
    pub fn new(paths: &'a Paths) -> Self {
        Self { paths }
    }

    /// True if the dispatcher should skip this gate right now.
    ///
    /// Tier 1 gates always return false — that is a hard safety
    /// invariant, independent of any crash history on disk. The read
    /// performs the opportunistic OPEN→HALF_OPEN transition.
    pub fn should_skip_gate(&self, gate_name: &str) -> bool {
        if TIER1_GATE_NAMES.contains(&gate_name) {
            return false;
        }
        let mut data = load_map::<GateCircuit>(&self.paths.gate_breaker_state());
        let Some(circuit) = data.get_mut(gate_name) else {
            return false;
        };
        let now = now_epoch();
        circuit.maybe_recover(now);
        match circuit.state {
            CircuitState::Open => {
                circuit.total_skips += 1;
                save_map(&self.paths.gate_breaker_state(), &data);
                true
            }
            CircuitState::HalfOpen => {
                save_map(&self.paths.gate_breaker_state(), &data);
                false
            }
            CircuitState::Closed => false,
        }
    }

    /// Record a gate execution outcome.
    ///
    /// Crashes land in the sliding window; the window crossing the
    /// threshold opens the circuit (never for Tier 1). A success while
    /// HALF_OPEN closes it.
    pub fn record_result(&self, gate_name: &str, success: bool) {
        let path = self.paths.gate_breaker_state();
        let mut data = load_map::<GateCircuit>(&path);
        let circuit = data.entry(gate_name.to_string()).or_default();
        let now = now_epoch();
        circuit.maybe_recover(now);

        if success {
            if circuit.state == CircuitState::HalfOpen {
                info!(gate = gate_name, "probe succeeded, closing gate circuit");
                circuit.state = CircuitState::Closed;
                circuit.crash_timestamps.clear();
                circuit.opened_at = None;
            }
        } else {
            circuit.crash_timestamps.push(now);
            circuit.prune_window(now);
            circuit.total_crashes += 1;

            if !TIER1_GATE_NAMES.contains(&gate_name) {
                match circuit.state {
                    CircuitState::HalfOpen => {
                        circuit.state = CircuitState::Open;
                        circuit.opened_at = Some(now);
                    }
                    CircuitState::Closed
                        if circuit.crash_timestamps.len() >= GATE_CRASH_THRESHOLD =>
                    {
                        info!(gate = gate_name, "crash threshold reached, opening gate circuit");
                        circuit.state = CircuitState::Open;
                        circuit.opened_at = Some(now);
                    }
                    _ => {}
                }
            }
        }
        save_map(&path, &data);
    }

    /// Current circuit state for a gate (CLOSED for unknown gates).
    pub fn circuit_state(&self, gate_name: &str) -> CircuitState {
        let mut data = load_map::<GateCircuit>(&self.paths.gate_breaker_state());
        match data.get_mut(gate_name) {
            Some(circuit) => {
                circuit.maybe_recover(now_epoch());
                circuit.state
            }
            None => CircuitState::Closed,
        }
    }

    /// Force a gate circuit back to CLOSED (manual recovery, tests).
    pub fn reset(&self, gate_name: &str) {
        let path = self.paths.gate_breaker_state();
        let mut data = load_map::<GateCircuit>(&path);
        data.insert(gate_name.to_string(), GateCircuit::default());
        save_map(&path, &data);
    }
}

// ── Service breaker ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCircuit {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<f64>,
    pub opened_at: Option<f64>,
    pub total_failures: u64,
    pub total_successes: u64,
}

impl ServiceCircuit {
    fn maybe_recover(&mut self, now: f64) {
        if self.state == CircuitState::Open {
            let opened = self.opened_at.or(self.last_failure_time).unwrap_or(0.0);
            if now - opened >= SERVICE_RECOVERY_SECS {
                self.state = CircuitState::HalfOpen;
                self.failure_count = 0;
                self.success_count = 0;
            }
        }
    }
}

/// Service circuit breaker for external collaborators.
pub struct ServiceBreaker<'a> {
    paths: &'a Paths,
}

impl<'a> ServiceBreaker<'a> {
    pub fn new(paths: &'a Paths) -> Self {
        Self { paths }
    }

    /// True if calls to the service should be rejected right now.
    pub fn is_open(&self, service: &str) -> bool {
        let path = self.paths.service_breaker_state();
        let mut data = load_map::<ServiceCircuit>(&path);
        let Some(circuit) = data.get_mut(service) else {
            return false;
        };
        circuit.maybe_recover(now_epoch());
        let open = circuit.state == CircuitState::Open;
        save_map(&path, &data);
        open
    }

    pub fn record_success(&self, service: &str) {
        let path = self.paths.service_breaker_state();
        let mut data = load_map::<ServiceCircuit>(&path);
        let circuit = data.entry(service.to_string()).or_default();
        circuit.maybe_recover(now_epoch());
        circuit.total_successes += 1;
        match circuit.state {
            CircuitState::Closed => circuit.failure_count = 0,
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                if circuit.success_count >= SERVICE_SUCCESS_THRESHOLD {
                    circuit.state = CircuitState::Closed;
                    circuit.failure_count = 0;
                    circuit.success_count = 0;
                    circuit.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
        save_map(&path, &data);
    }

    pub fn record_failure(&self, service: &str) {
        let path = self.paths.service_breaker_state();
        let mut data = load_map::<ServiceCircuit>(&path);
        let circuit = data.entry(service.to_string()).or_default();
        let now = now_epoch();
        circuit.maybe_recover(now);
        circuit.last_failure_time = Some(now);
        circuit.total_failures += 1;
        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= SERVICE_FAILURE_THRESHOLD {
                    debug!(service, "failure threshold reached, opening service circuit");
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                circuit.failure_count = 1;
                circuit.success_count = 0;
            }
            CircuitState::Open => {}
        }
        save_map(&path, &data);
    }
}

// ── Shared persistence helpers ──────────────────────────────────────────

fn load_map<T: for<'de> Deserialize<'de>>(path: &Path) -> HashMap<String, T> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn save_map<T: Serialize>(path: &Path, data: &HashMap<String, T>) {
    let Some(dir) = path.parent() else { return };
    let _ = std::fs::create_dir_all(dir);
    let Ok(mut tmp) = tempfile::Builder::new().prefix(".cb_tmp_").tempfile_in(dir) else {
        return;
    };
    if serde_json::to_writer_pretty(tmp.as_file_mut(), data).is_err() {
        return;
    }
    let _ = tmp.as_file_mut().flush();
    let _ = tmp.persist(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::gates::TIER1_GATE_NAMES;

    fn temp_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_root(dir.path());
        (dir, paths)
    }

    fn backdate_opened_at(paths: &Paths, gate: &str, secs: f64) {
        let path = paths.gate_breaker_state();
        let mut data = load_map::<GateCircuit>(&path);
        if let Some(c) = data.get_mut(gate) {
            c.opened_at = Some(now_epoch() - secs);
        }
        save_map(&path, &data);
    }

    #[test]
    fn three_crashes_open_the_circuit() {
        let (_dir, paths) = temp_paths();
        let breaker = GateBreaker::new(&paths);
        assert!(!breaker.should_skip_gate("confidence_check"));
        for _ in 0..GATE_CRASH_THRESHOLD {
            breaker.record_result("confidence_check", false);
        }
        assert!(breaker.should_skip_gate("confidence_check"));
        assert_eq!(breaker.circuit_state("confidence_check"), CircuitState::Open);
    }

    #[test]
    fn cooldown_allows_a_probe_and_success_closes() {
        let (_dir, paths) = temp_paths();
        let breaker = GateBreaker::new(&paths);
        for _ in 0..GATE_CRASH_THRESHOLD {
            breaker.record_result("canary", false);
        }
        assert!(breaker.should_skip_gate("canary"));

        backdate_opened_at(&paths, "canary", GATE_COOLDOWN_SECS + 1.0);
        // Cooldown elapsed: HALF_OPEN allows the probe through.
        assert!(!breaker.should_skip_gate("canary"));
        assert_eq!(breaker.circuit_state("canary"), CircuitState::HalfOpen);

        breaker.record_result("canary", true);
        assert_eq!(breaker.circuit_state("canary"), CircuitState::Closed);
    }

    #[test]
    fn crash_in_half_open_reopens() {
        let (_dir, paths) = temp_paths();
        let breaker = GateBreaker::new(&paths);
        for _ in 0..GATE_CRASH_THRESHOLD {
            breaker.record_result("canary", false);
        }
        backdate_opened_at(&paths, "canary", GATE_COOLDOWN_SECS + 1.0);
        assert!(!breaker.should_skip_gate("canary"));
        breaker.record_result("canary", false);
        assert_eq!(breaker.circuit_state("canary"), CircuitState::Open);
    }

    #[test]
    fn tier1_gates_are_never_skipped() {
        let (_dir, paths) = temp_paths();
        let breaker = GateBreaker::new(&paths);
        for tier1 in TIER1_GATE_NAMES {
            for _ in 0..20 {
                breaker.record_result(tier1, false);
            }
            assert!(
                !breaker.should_skip_gate(tier1),
                "tier 1 gate {tier1} must never be skipped"
            );
        }
    }

    #[test]
    fn crashes_outside_window_do_not_open() {
        let (_dir, paths) = temp_paths();
        let breaker = GateBreaker::new(&paths);
        // Two old crashes, aged out of the window by hand.
        breaker.record_result("canary", false);
        breaker.record_result("canary", false);
        let path = paths.gate_breaker_state();
        let mut data = load_map::<GateCircuit>(&path);
        for t in data.get_mut("canary").unwrap().crash_timestamps.iter_mut() {
            *t -= GATE_CRASH_WINDOW_SECS + 10.0;
        }
        save_map(&path, &data);

        breaker.record_result("canary", false);
        assert_eq!(breaker.circuit_state("canary"), CircuitState::Closed);
    }

    #[test]
    fn service_breaker_full_cycle() {
        let (_dir, paths) = temp_paths();
        let breaker = ServiceBreaker::new(&paths);
        assert!(!breaker.is_open("memory_worker"));
        for _ in 0..SERVICE_FAILURE_THRESHOLD {
            breaker.record_failure("memory_worker");
        }
        assert!(breaker.is_open("memory_worker"));

        // Back-date the open time to trigger recovery.
        let path = paths.service_breaker_state();
        let mut data = load_map::<ServiceCircuit>(&path);
        data.get_mut("memory_worker").unwrap().opened_at =
            Some(now_epoch() - SERVICE_RECOVERY_SECS - 1.0);
        save_map(&path, &data);

        assert!(!breaker.is_open("memory_worker"));
        for _ in 0..SERVICE_SUCCESS_THRESHOLD {
            breaker.record_success("memory_worker");
        }
        assert!(!breaker.is_open("memory_worker"));
    }
}
