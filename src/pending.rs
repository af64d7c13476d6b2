//! Registry of in-flight two-way calls.
//!
//! Every two-way request registers a waiter under its request id before the
//! frame is written. The waiter is resolved exactly once, by whichever comes
//! first: the matching response, the timeout sweep, or a failed connection.
//! Resolution always removes the entry under the lock and signals the waiter
//! outside it, so a late response and a timeout can never both land.
//!
//! ```text
//!  send ──► register(id) ──► ┌──────────────────────────┐
//!                            │ calls: id -> Entry{tx}   │ ◄── complete(resp)  (read loop)
//!  wait ◄── oneshot rx  ◄─── │                          │ ◄── sweep(now)      (sweeper task)
//!                            └──────────────────────────┘ ◄── fail_endpoint() (disconnect)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, RpcError};
use crate::protocol::{Response, Status};

/// Default period of the timeout sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    registered_at: Instant,
    timeout: Duration,
    endpoint_id: Option<u64>,
    tx: oneshot::Sender<Response>,
}

impl Entry {
    #[inline]
    fn deadline(&self) -> Instant {
        self.registered_at + self.timeout
    }
}

/// Shared map of outstanding calls plus the request id counter.
pub struct PendingCalls {
    calls: Mutex<HashMap<i64, Entry>>,
    next_id: AtomicI64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
        }
    }

    /// Allocate the next request id. Ids are unique for the registry's lifetime.
    #[inline]
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a waiter for `id`.
    ///
    /// `endpoint_id` ties the call to the connection it was written on so a
    /// disconnect can fail it early.
    pub fn register(
        self: &Arc<Self>,
        id: i64,
        timeout: Duration,
        endpoint_id: Option<u64>,
    ) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();
        let registered_at = Instant::now();

        {
            let mut calls = self.calls.lock();
            if calls.contains_key(&id) {
                return Err(RpcError::DuplicateRequestId(id));
            }
            calls.insert(
                id,
                Entry {
                    registered_at,
                    timeout,
                    endpoint_id,
                    tx,
                },
            );
            tracing::trace!(request_id = id, pending = calls.len(), "registered pending call");
        }

        Ok(PendingCall {
            id,
            registered_at,
            timeout,
            rx,
            resolved: None,
            registry: Arc::downgrade(self),
        })
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns false when nothing is waiting for that id (late, duplicate,
    /// or unsolicited response); the response is dropped.
    pub fn complete(&self, response: Response) -> bool {
        let entry = self.calls.lock().remove(&response.id);
        match entry {
            Some(entry) => {
                // The waiter may have been dropped already; nothing to do then.
                let _ = entry.tx.send(response);
                true
            }
            None => {
                tracing::debug!(request_id = response.id, "no pending call for response, dropping");
                false
            }
        }
    }

    /// Resolve every call whose deadline is at or before `now` with a
    /// synthesized `SERVER_TIMEOUT` response. Returns how many expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(i64, Entry)> = {
            let mut calls = self.calls.lock();
            let ids: Vec<i64> = calls
                .iter()
                .filter(|(_, entry)| entry.deadline() <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            let elapsed = now.saturating_duration_since(entry.registered_at);
            tracing::warn!(request_id = id, elapsed_ms = elapsed.as_millis() as u64, "call timed out");
            let _ = entry.tx.send(Response::timeout(id, elapsed));
        }
        count
    }

    /// Fail every call written on `endpoint_id` with a `CLIENT_ERROR` response.
    pub fn fail_endpoint(&self, endpoint_id: u64, message: &str) -> usize {
        let failed: Vec<(i64, Entry)> = {
            let mut calls = self.calls.lock();
            let ids: Vec<i64> = calls
                .iter()
                .filter(|(_, entry)| entry.endpoint_id == Some(endpoint_id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = failed.len();
        for (id, entry) in failed {
            let _ = entry.tx.send(Response::error(id, Status::ClientError, message));
        }
        if count > 0 {
            tracing::warn!(endpoint_id, failed = count, "failed pending calls of lost connection");
        }
        count
    }

    /// Fail every outstanding call with a `CLIENT_ERROR` response.
    pub fn fail_all(&self, message: &str) -> usize {
        let drained: Vec<(i64, Entry)> = self.calls.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let _ = entry.tx.send(Response::error(id, Status::ClientError, message));
        }
        count
    }

    /// Remove a waiter without resolving it.
    pub fn forget(&self, id: i64) -> bool {
        self.calls.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.calls.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    /// Ids of all outstanding calls, sorted (for diagnostics).
    pub fn pending_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.calls.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `sweep` every `period` until the registry is dropped.
pub fn spawn_sweeper(registry: Weak<PendingCalls>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.sweep(Instant::now());
        }
    })
}

/// Handle to one outstanding call.
///
/// Dropping it unregisters the call.
pub struct PendingCall {
    id: i64,
    registered_at: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Response>,
    resolved: Option<Response>,
    registry: Weak<PendingCalls>,
}

impl PendingCall {
    #[inline]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[inline]
    pub fn deadline(&self) -> Instant {
        self.registered_at + self.timeout
    }

    /// Non-blocking check whether the call has been resolved.
    pub fn is_done(&mut self) -> bool {
        if self.resolved.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(response) => {
                self.resolved = Some(response);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.resolved = Some(self.abandoned());
                true
            }
        }
    }

    /// Wait for the response, resolving it as a timeout at the deadline.
    pub async fn response(&mut self) -> Response {
        if let Some(response) = self.resolved.take() {
            return response;
        }

        match tokio::time::timeout_at(self.deadline(), &mut self.rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => self.abandoned(),
            Err(_) => {
                // Resolve through the registry so a response racing the
                // deadline and the timeout cannot both be observed.
                let elapsed = self.registered_at.elapsed();
                if let Some(registry) = self.registry.upgrade() {
                    registry.complete(Response::timeout(self.id, elapsed));
                }
                match self.rx.try_recv() {
                    Ok(response) => response,
                    Err(_) => Response::timeout(self.id, elapsed),
                }
            }
        }
    }

    /// Wait and convert into the caller-facing result.
    pub async fn wait(mut self) -> Result<Value> {
        self.response().await.into_result()
    }

    fn abandoned(&self) -> Response {
        Response::error(self.id, Status::ClientError, "pending call was discarded")
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self.id);
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("resolved", &self.resolved.is_some())
            .finish()
    }
}
