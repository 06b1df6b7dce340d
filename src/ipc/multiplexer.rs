//! Request multiplexer for one worker.
//!
//! Many callers may have requests in flight against the same worker. Each
//! request gets a correlation id, and the worker echoes it on every message
//! it emits for that request. Stream order means nothing: the id alone
//! decides which caller a response belongs to.
//!
//! The pending table is behind a plain mutex that is never held across an
//! await. Settling a request always starts by removing its entry, so when a
//! response and a timeout race, whichever removes the entry first wins and the
//! other becomes a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::defaults;
use crate::error::{Error, Result};
use crate::ipc::codec::{decode_line, encode_line, MessageKind, WireProtocol};

/// Destination for serialized request lines.
///
/// Implemented by the process supervisor; tests substitute an in-memory sink.
pub trait LineWriter: Send + Sync {
    /// Queue one newline-terminated line for the worker's input stream.
    fn write_line(&self, line: String) -> Result<()>;
}

/// How long a request may wait for its final response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Window used when the payload carries no compute-time hint
    #[serde(default = "defaults::request_timeout_ms")]
    pub default_ms: u64,
    /// Payload field holding the requested compute time in seconds
    #[serde(default = "defaults::timeout_hint_field")]
    pub hint_field: Option<String>,
    /// Milliseconds of waiting allowed per second of requested compute
    #[serde(default = "defaults::timeout_hint_scale_ms")]
    pub hint_scale_ms: u64,
    /// Lower bound for hint-derived windows
    #[serde(default = "defaults::timeout_floor_ms")]
    pub floor_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            default_ms: defaults::REQUEST_TIMEOUT_MS,
            hint_field: defaults::timeout_hint_field(),
            hint_scale_ms: defaults::TIMEOUT_HINT_SCALE_MS,
            floor_ms: defaults::TIMEOUT_FLOOR_MS,
        }
    }
}

impl TimeoutPolicy {
    /// Timeout window for a payload.
    pub fn window_for(&self, payload: &Value) -> Duration {
        let hint = self
            .hint_field
            .as_deref()
            .and_then(|field| payload.get(field))
            .and_then(Value::as_f64)
            .filter(|secs| secs.is_finite() && *secs > 0.0);

        match hint {
            Some(secs) => {
                let scaled = (secs * self.hint_scale_ms as f64).floor() as u64;
                Duration::from_millis(scaled.max(self.floor_ms))
            }
            None => Duration::from_millis(self.default_ms),
        }
    }
}

/// What `on_line` did with a line from the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Final response delivered to the waiting caller
    Resolved(String),
    /// Worker-reported failure delivered to the waiting caller
    Rejected(String),
    /// Progress update, ignored
    Partial(String),
    /// Warning about a request, ignored
    Notice(String),
    /// Final response for an id nobody is waiting on anymore
    Orphaned(String),
    /// Protocol message without a correlation id
    Unsolicited,
    /// Not a JSON object
    Malformed,
}

/// Counters for one multiplexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    pub pending: usize,
    pub resolved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub dropped_lines: u64,
    pub orphaned_responses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    resolved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    dropped_lines: AtomicU64,
    orphaned_responses: AtomicU64,
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Value>>,
    sent_at: Instant,
}

/// Correlates responses from one worker stream with their callers.
pub struct Multiplexer {
    engine: String,
    wire: WireProtocol,
    pending: Mutex<HashMap<String, PendingRequest>>,
    request_id_counter: AtomicU64,
    counters: Counters,
}

impl Multiplexer {
    pub fn new(engine: impl Into<String>, wire: WireProtocol) -> Self {
        Self {
            engine: engine.into(),
            wire,
            pending: Mutex::new(HashMap::new()),
            request_id_counter: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn wire(&self) -> &WireProtocol {
        &self.wire
    }

    /// Send a request and wait for its final response.
    ///
    /// The returned future settles exactly once: with the worker's final
    /// message, a worker-reported error, a crash of the worker, or a
    /// `Timeout` after `timeout`. Dropping the future abandons the request.
    /// Nothing is sent to the worker when a request times out or is abandoned.
    pub async fn send<W>(&self, writer: &W, payload: Value, timeout: Duration) -> Result<Value>
    where
        W: LineWriter + ?Sized,
    {
        let (id, mut rx) = self.register();
        let _guard = PendingGuard {
            mux: self,
            id: id.clone(),
        };

        let message = self.wire.with_id(payload, &id)?;
        let line = encode_line(&message)?;
        writer.write_line(line)?;
        log::debug!("[{}] sent {}", self.engine, id);

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            // The sender only disappears unsettled if the multiplexer itself is torn down.
            Ok(Err(_)) => Err(Error::WorkerUnavailable(self.engine.clone())),
            Err(_) => self.expire(id, rx, timeout),
        }
    }

    /// Settle a request whose deadline has passed.
    ///
    /// If a response removed the entry between the deadline and this call,
    /// that response is returned instead of a timeout.
    fn expire(
        &self,
        id: String,
        mut rx: oneshot::Receiver<Result<Value>>,
        after: Duration,
    ) -> Result<Value> {
        if self.take(&id).is_some() {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            log::warn!("[{}] timeout for id={} after {:?}", self.engine, id, after);
            return Err(Error::Timeout {
                engine: self.engine.clone(),
                id,
                after,
            });
        }
        rx.try_recv().unwrap_or_else(|_| {
            Err(Error::Timeout {
                engine: self.engine.clone(),
                id,
                after,
            })
        })
    }

    /// Route one line from the worker's output stream.
    pub fn on_line(&self, line: &str) -> LineOutcome {
        let message = match decode_line(line) {
            Ok(message) => message,
            Err(e) => {
                self.counters.dropped_lines.fetch_add(1, Ordering::Relaxed);
                if self.wire.log_malformed {
                    log::debug!("[{}] dropped non-protocol line ({}): {}", self.engine, e, line.trim());
                }
                return LineOutcome::Malformed;
            }
        };

        let envelope = self.wire.envelope(&message);
        let Some(id) = envelope.id else {
            log::debug!("[{}] ignoring message without {}", self.engine, self.wire.id_field);
            return LineOutcome::Unsolicited;
        };

        match envelope.kind {
            MessageKind::Partial => LineOutcome::Partial(id),
            MessageKind::Notice(text) => {
                log::warn!("[{}] worker warning for id={}: {}", self.engine, id, text);
                LineOutcome::Notice(id)
            }
            MessageKind::Final => {
                if self.settle(&id, Ok(Value::Object(message))) {
                    self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                    LineOutcome::Resolved(id)
                } else {
                    LineOutcome::Orphaned(id)
                }
            }
            MessageKind::Failed(text) => {
                let err = Error::EngineReported {
                    engine: self.engine.clone(),
                    message: text,
                };
                if self.settle(&id, Err(err)) {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    LineOutcome::Rejected(id)
                } else {
                    LineOutcome::Orphaned(id)
                }
            }
        }
    }

    /// Reject every pending request. Returns how many were rejected.
    pub fn fail_all<F>(&self, make_err: F) -> usize
    where
        F: Fn(&str) -> Error,
    {
        let drained: Vec<(String, PendingRequest)> = self.table().drain().collect();
        let count = drained.len();
        for (id, request) in drained {
            let _ = request.tx.send(Err(make_err(&id)));
        }
        if count > 0 {
            self.counters.rejected.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Number of requests currently waiting.
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// Ids of requests currently waiting, oldest first.
    pub fn pending_ids(&self) -> Vec<String> {
        let table = self.table();
        let mut ids: Vec<_> = table.iter().map(|(id, p)| (p.sent_at, id.clone())).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            pending: self.pending_count(),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            dropped_lines: self.counters.dropped_lines.load(Ordering::Relaxed),
            orphaned_responses: self.counters.orphaned_responses.load(Ordering::Relaxed),
        }
    }

    /// Allocate an id that no pending request uses and register it.
    fn register(&self) -> (String, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table();
        let id = loop {
            let candidate = self.next_request_id();
            if !table.contains_key(&candidate) {
                break candidate;
            }
        };
        table.insert(
            id.clone(),
            PendingRequest {
                tx,
                sent_at: Instant::now(),
            },
        );
        (id, rx)
    }

    /// Format: `req_<counter>_<random>`, both hex.
    fn next_request_id(&self) -> String {
        let n = self.request_id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let salt: u32 = rand::thread_rng().gen();
        format!("req_{:x}_{:08x}", n, salt)
    }

    fn settle(&self, id: &str, result: Result<Value>) -> bool {
        match self.take(id) {
            Some(request) => {
                log::debug!(
                    "[{}] settled {} after {:?}",
                    self.engine,
                    id,
                    request.sent_at.elapsed()
                );
                let _ = request.tx.send(result);
                true
            }
            None => {
                self.counters.orphaned_responses.fetch_add(1, Ordering::Relaxed);
                log::debug!("[{}] dropping response for unknown id={}", self.engine, id);
                false
            }
        }
    }

    fn take(&self, id: &str) -> Option<PendingRequest> {
        self.table().remove(id)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a request's entry when its `send` future ends for any reason.
struct PendingGuard<'a> {
    mux: &'a Multiplexer,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.mux.take(&self.id);
    }
}
