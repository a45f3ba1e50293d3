//! Client for the out-of-process memory worker.
//!
//! The worker listens on a Unix domain socket and speaks a line-oriented
//! JSON request/response protocol (`ping`, `flush`, `count`, `backup`,
//! `search_knowledge`). The engine never blocks indefinitely on it: every
//! call carries a read/write timeout and failures feed the service
//! circuit breaker so repeated outages stop being attempted at all.

use crate::breaker::ServiceBreaker;
use crate::config::Paths;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::debug;

/// Service name under which the worker is tracked by the breaker.
pub const MEMORY_WORKER_SERVICE: &str = "memory_worker";

/// Per-call socket timeout.
const CALL_TIMEOUT: Duration = Duration::from_millis(1500);

/// Handle to the memory worker for one invocation.
pub struct MemoryWorker<'a> {
    paths: &'a Paths,
}

impl<'a> MemoryWorker<'a> {
    pub fn new(paths: &'a Paths) -> Self {
        Self { paths }
    }

    /// True when the worker answers a ping and the circuit allows calls.
    pub fn is_available(&self) -> bool {
        let breaker = ServiceBreaker::new(self.paths);
        if breaker.is_open(MEMORY_WORKER_SERVICE) {
            return false;
        }
        self.call("ping", json!({})).is_some()
    }

    /// Ask the worker to drain the capture queue. Returns the number of
    /// observations it reports having ingested.
    pub fn flush(&self) -> Option<u64> {
        self.call("flush", json!({}))
            .and_then(|resp| resp.get("flushed").and_then(Value::as_u64))
    }

    /// Number of stored memories.
    pub fn count(&self) -> Option<u64> {
        self.call("count", json!({}))
            .and_then(|resp| resp.get("count").and_then(Value::as_u64))
    }

    /// Trigger a durable backup.
    pub fn backup(&self) -> bool {
        self.call("backup", json!({})).is_some()
    }

    /// Search stored knowledge. Best-effort; `None` when the worker is
    /// unreachable.
    pub fn search_knowledge(&self, query: &str, limit: u32) -> Option<Value> {
        self.call("search_knowledge", json!({ "query": query, "limit": limit }))
    }

    /// One request/response exchange, guarded by the service breaker.
    fn call(&self, op: &str, params: Value) -> Option<Value> {
        let breaker = ServiceBreaker::new(self.paths);
        if breaker.is_open(MEMORY_WORKER_SERVICE) {
            return None;
        }
        match self.exchange(op, params) {
            Ok(resp) => {
                breaker.record_success(MEMORY_WORKER_SERVICE);
                Some(resp)
            }
            Err(err) => {
                debug!(op, error = %err, "memory worker call failed");
                breaker.record_failure(MEMORY_WORKER_SERVICE);
                None
            }
        }
    }

    fn exchange(&self, op: &str, params: Value) -> anyhow::Result<Value> {
        let stream = UnixStream::connect(self.paths.memory_socket())?;
        stream.set_read_timeout(Some(CALL_TIMEOUT))?;
        stream.set_write_timeout(Some(CALL_TIMEOUT))?;

        let mut request = json!({ "op": op });
        if let (Some(obj), Value::Object(extra)) = (request.as_object_mut(), params) {
            obj.extend(extra);
        }
        let mut writer = stream.try_clone()?;
        writer.write_all(request.to_string().as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line)?;
        let response: Value = serde_json::from_str(line.trim())?;
        if response.get("error").is_some() {
            anyhow::bail!("worker error: {}", response["error"]);
        }
        Ok(response)
    }
}
