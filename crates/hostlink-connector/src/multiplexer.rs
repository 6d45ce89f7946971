//! Request/response correlation and inbound routing.
//!
//! The pending table is the one piece of state shared between callers and
//! the receive loop. Every insert, lookup and removal is a single step under
//! its lock, and results are delivered only after the lock is released, so a
//! response reaches its waiter at most once and waiters never run under it.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use hostlink_frame::{Envelope, EnvelopeKind, Message};
use tracing::{debug, trace, warn};

use crate::error::{ConnectorError, Result};

/// Completion callback of a call made with
/// [`Connector::call_with`](crate::Connector::call_with).
pub type Completion = Box<dyn FnOnce(Result<Message>) + Send>;

/// Receives what the multiplexer does not handle itself.
pub trait Dispatch: Send + Sync {
    /// An inbound NOTIFICATION.
    fn notification(&self, message: Message);
    /// An inbound HEARTBEAT (probe or ack).
    fn heartbeat(&self, sequence: u64, message: Message);
    /// Run a settled call's completion callback.
    ///
    /// The default runs it on the settling thread; the connector hands it
    /// to its dispatch thread instead.
    fn completion(&self, callback: Completion, result: Result<Message>) {
        callback(result);
    }
}

/// Where a call's outcome goes.
pub enum Waiter {
    /// A thread parked in [`Connector::call`](crate::Connector::call).
    Blocking(mpsc::SyncSender<Result<Message>>),
    /// A completion callback, routed through [`Dispatch::completion`].
    Callback(Completion),
    #[cfg(feature = "async")]
    Async(tokio::sync::oneshot::Sender<Result<Message>>),
}

impl Waiter {
    /// A blocking waiter and the receiver its result arrives on.
    pub fn channel() -> (Self, mpsc::Receiver<Result<Message>>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (Self::Blocking(tx), rx)
    }

    fn deliver(self, result: Result<Message>) {
        match self {
            Self::Blocking(tx) => {
                let _ = tx.send(result);
            }
            Self::Callback(callback) => callback(result),
            #[cfg(feature = "async")]
            Self::Async(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

struct PendingCall {
    submitted: Instant,
    timeout: Option<Duration>,
    waiter: Waiter,
}

impl PendingCall {
    fn expired(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| now.saturating_duration_since(self.submitted) >= timeout)
    }
}

struct PendingTable {
    calls: HashMap<u64, PendingCall>,
    next_id: u64,
}

impl PendingTable {
    /// Next free id. Zero is never handed out (notifications use it), and
    /// after wrap-around ids still in flight are skipped.
    fn allocate(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.calls.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Correlates REQUEST/RESPONSE pairs and routes everything else.
pub struct Multiplexer {
    table: Mutex<PendingTable>,
    dispatch: Weak<dyn Dispatch>,
}

impl Multiplexer {
    /// `dispatch` is not kept alive by the multiplexer; once it is gone,
    /// notifications and heartbeats are dropped.
    pub fn new(dispatch: Weak<dyn Dispatch>) -> Self {
        Self::with_start_id(dispatch, 1)
    }

    /// Start the id counter somewhere else, e.g. near the wrap point.
    pub fn with_start_id(dispatch: Weak<dyn Dispatch>, next_id: u64) -> Self {
        Self {
            table: Mutex::new(PendingTable {
                calls: HashMap::new(),
                next_id,
            }),
            dispatch,
        }
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a result to its waiter. Never called with the table locked.
    fn settle(&self, waiter: Waiter, result: Result<Message>) {
        match (waiter, self.dispatch.upgrade()) {
            (Waiter::Callback(callback), Some(dispatch)) => dispatch.completion(callback, result),
            (waiter, _) => waiter.deliver(result),
        }
    }

    /// Record a new outstanding call and return its correlation id.
    ///
    /// With a `timeout`, [`expire`](Self::expire) fails the call once it has
    /// been outstanding that long.
    pub fn register(&self, waiter: Waiter, timeout: Option<Duration>) -> u64 {
        let mut table = self.table();
        let id = table.allocate();
        table.calls.insert(
            id,
            PendingCall {
                submitted: Instant::now(),
                timeout,
                waiter,
            },
        );
        trace!(correlation_id = id, pending = table.calls.len(), "registered call");
        id
    }

    /// Settle a call. Returns `false` if no such call is outstanding.
    pub fn complete(&self, correlation_id: u64, result: Result<Message>) -> bool {
        let call = self.table().calls.remove(&correlation_id);
        match call {
            Some(call) => {
                trace!(
                    correlation_id,
                    elapsed = ?call.submitted.elapsed(),
                    "call settled"
                );
                self.settle(call.waiter, result);
                true
            }
            None => false,
        }
    }

    /// Forget a call without notifying its waiter.
    pub fn cancel(&self, correlation_id: u64) -> bool {
        self.table().calls.remove(&correlation_id).is_some()
    }

    /// Fail every outstanding call; returns how many there were.
    pub fn fail_all(&self, make_error: impl Fn() -> ConnectorError) -> usize {
        let drained: Vec<(u64, PendingCall)> = self.table().calls.drain().collect();
        let count = drained.len();
        for (correlation_id, call) in drained {
            trace!(correlation_id, "failing outstanding call");
            self.settle(call.waiter, Err(make_error()));
        }
        count
    }

    /// Fail calls whose timeout has elapsed; returns how many.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(u64, PendingCall)> = {
            let mut table = self.table();
            let ids: Vec<u64> = table
                .calls
                .iter()
                .filter(|(_, call)| call.expired(now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.calls.remove(&id).map(|call| (id, call)))
                .collect()
        };

        let count = expired.len();
        for (correlation_id, call) in expired {
            let timeout = call.timeout.unwrap_or_default();
            debug!(correlation_id, ?timeout, "call timed out");
            self.settle(call.waiter, Err(ConnectorError::CallTimeout(timeout)));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().calls.len()
    }

    /// Route one inbound envelope.
    pub fn demux(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Response => {
                let id = envelope.correlation_id;
                if !self.complete(id, Ok(envelope.message)) {
                    warn!(correlation_id = id, "discarding stale or unexpected response");
                }
            }
            EnvelopeKind::Notification => match self.dispatch.upgrade() {
                Some(dispatch) => dispatch.notification(envelope.message),
                None => trace!("no dispatcher; dropping notification"),
            },
            EnvelopeKind::Heartbeat => match self.dispatch.upgrade() {
                Some(dispatch) => dispatch.heartbeat(envelope.correlation_id, envelope.message),
                None => trace!("no dispatcher; dropping heartbeat"),
            },
            EnvelopeKind::Request => {
                warn!(
                    correlation_id = envelope.correlation_id,
                    "discarding inbound request; this side does not serve calls"
                );
            }
        }
    }
}
