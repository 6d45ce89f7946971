//! The host-facing connector.
//!
//! One [`Connector`] owns one connection to a service: a receive thread that
//! drains the stream into the [`Multiplexer`], a monitor thread that sends
//! heartbeats and expires callback deadlines, and, while degraded, a
//! reconnect thread. All of them hold the shared state; only the connector
//! itself changes the lifecycle.
//!
//! Subscription handlers and `call_with` callbacks never run on those
//! threads. They are queued to a single dispatch thread that lives as long
//! as the connector, so user code may block or call back into the
//! connector without stalling reads or heartbeats.
//!
//! Every established connection gets a new generation number. Background
//! threads carry the generation they were started for and stand down once
//! it is no longer current, so a late failure report from an old connection
//! can never tear down its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hostlink_frame::{Envelope, FrameConfig, FrameReader, FrameWriter, Message};
use hostlink_transport::{Endpoint, IpcStream, TransportError};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::ConnectorConfig;
use crate::control::{topic_of, validate_topic, with_topic, HeartbeatMarker};
use crate::error::{ConnectorError, Result};
use crate::event::ConnectorEvent;
use crate::handshake::{handshake_client, HandshakeResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::multiplexer::{Completion, Dispatch, Multiplexer, Waiter};
use crate::state::ConnectionState;

/// Handler invoked for notifications on a subscribed topic.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

const MAX_MONITOR_TICK: Duration = Duration::from_millis(100);
const MIN_MONITOR_TICK: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client side of a host ↔ service connection.
///
/// Dropping the connector closes it.
pub struct Connector {
    shared: Arc<Shared>,
}

struct Shared {
    config: ConnectorConfig,
    state: Mutex<ConnectionState>,
    lifecycle: Mutex<Lifecycle>,
    /// Current generation; bumped whenever a connection is installed or retired.
    generation: AtomicU64,
    writer: Mutex<Option<FrameWriter<IpcStream>>>,
    mux: Multiplexer,
    subscriptions: Mutex<HashMap<String, Handler>>,
    listeners: Mutex<Vec<mpsc::Sender<ConnectorEvent>>>,
    heartbeat: Mutex<HeartbeatMonitor>,
    protocol_errors: AtomicU32,
    handshake: Mutex<Option<HandshakeResult>>,
    shutdown: ShutdownSignal,
    closed: AtomicBool,
    /// Queue of the dispatch thread; taken on close.
    deliveries: Mutex<Option<mpsc::Sender<Delivery>>>,
}

/// User code waiting to run on the dispatch thread.
enum Delivery {
    Notification {
        topic: String,
        handler: Handler,
        message: Message,
    },
    Completion {
        callback: Completion,
        result: Result<Message>,
    },
}

#[derive(Default)]
struct Lifecycle {
    endpoint: Option<Endpoint>,
    session: Option<Session>,
    reconnector: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    /// Threads of connections already torn down, joined on close.
    retired: Vec<JoinHandle<()>>,
}

/// Handles of one live connection.
struct Session {
    stream: IpcStream,
    receiver: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl Session {
    fn retire(self, into: &mut Vec<JoinHandle<()>>) {
        let _ = self.stream.close();
        into.push(self.receiver);
        into.push(self.monitor);
    }
}

/// A connection that finished its handshake but is not yet in service.
struct Established {
    stream: IpcStream,
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
    handshake: HandshakeResult,
}

/// Wakes sleeping background threads on close.
#[derive(Default)]
struct ShutdownSignal {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    fn trigger(&self) {
        *lock(&self.triggered) = true;
        self.cond.notify_all();
    }

    /// Sleep up to `timeout`; returns `true` if shutdown was triggered.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.triggered);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

impl Connector {
    /// Create a disconnected connector. Fails if `config` is invalid.
    pub fn new(config: ConnectorConfig) -> Result<Self> {
        config.validate()?;
        let (deliveries, queue) = mpsc::channel();
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let dispatch: Weak<dyn Dispatch> = weak.clone();
            Shared {
                heartbeat: Mutex::new(HeartbeatMonitor::new(
                    config.heartbeat_interval,
                    config.heartbeat_missed_threshold,
                    Instant::now(),
                )),
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                lifecycle: Mutex::new(Lifecycle::default()),
                generation: AtomicU64::new(0),
                writer: Mutex::new(None),
                mux: Multiplexer::new(dispatch),
                subscriptions: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                protocol_errors: AtomicU32::new(0),
                handshake: Mutex::new(None),
                shutdown: ShutdownSignal::default(),
                closed: AtomicBool::new(false),
                deliveries: Mutex::new(Some(deliveries)),
            }
        });

        let weak = Arc::downgrade(&shared);
        let dispatcher = thread::Builder::new()
            .name("hostlink-dispatch".to_string())
            .spawn(move || Shared::dispatch_loop(weak, queue))
            .map_err(TransportError::Io)?;
        lock(&shared.lifecycle).dispatcher = Some(dispatcher);
        Ok(Self { shared })
    }

    /// Connect and handshake with the service at `endpoint`.
    ///
    /// Blocks until the connection is READY or the attempt failed. If a
    /// connection is already being made, in service, or being restored, this
    /// returns the current state without doing anything.
    pub fn connect(&self, endpoint: &str) -> Result<ConnectionState> {
        let endpoint = Endpoint::parse(endpoint)?;
        self.connect_endpoint(&endpoint)
    }

    pub fn connect_endpoint(&self, endpoint: &Endpoint) -> Result<ConnectionState> {
        let shared = &self.shared;
        let mut life = lock(&shared.lifecycle);
        if shared.is_closed() {
            return Err(ConnectorError::ConnectorClosed);
        }
        let current = shared.state();
        if current.is_active() {
            debug!(state = %current, "connect ignored; already active");
            return Ok(current);
        }

        life.endpoint = Some(endpoint.clone());
        shared.set_state(ConnectionState::Connecting);
        let established = match shared.establish(endpoint, true) {
            Ok(established) => established,
            Err(err) => {
                shared.set_state(ConnectionState::Disconnected);
                warn!(endpoint = %endpoint, error = %err, "connect failed");
                return Err(err);
            }
        };

        if shared.is_closed() {
            let _ = established.stream.close();
            return Err(ConnectorError::ConnectorClosed);
        }
        Shared::install(shared, &mut life, established)?;
        Ok(ConnectionState::Ready)
    }

    /// Tear the connection down for good.
    ///
    /// Outstanding calls fail with [`ConnectorError::ConnectorClosed`] and
    /// background threads are joined. Handlers and callbacks already queued
    /// still run before this returns; none run afterwards, and later calls
    /// to `connect` fail.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.shutdown.trigger();

        let (handles, dispatcher) = {
            let mut life = lock(&shared.lifecycle);
            shared.set_state(ConnectionState::Closing);
            shared.generation.fetch_add(1, Ordering::SeqCst);
            let mut handles = std::mem::take(&mut life.retired);
            if let Some(session) = life.session.take() {
                session.retire(&mut handles);
            }
            handles.extend(life.reconnector.take());
            (handles, life.dispatcher.take())
        };
        *lock(&shared.writer) = None;

        let failed = shared.mux.fail_all(|| ConnectorError::ConnectorClosed);
        if failed > 0 {
            debug!(failed, "failed outstanding calls on close");
        }

        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }

        // Dropping the queue lets the dispatch thread drain and exit.
        *lock(&shared.deliveries) = None;
        if let Some(handle) = dispatcher {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }

        shared.set_state(ConnectionState::Disconnected);
        info!("connector closed");
    }

    /// Send a REQUEST and wait up to `timeout` for its RESPONSE.
    ///
    /// On timeout the request is abandoned locally; the service is not told
    /// and a late response is discarded.
    pub fn call(&self, message: Message, timeout: Duration) -> Result<Message> {
        let shared = &self.shared;
        shared.ensure_ready()?;

        let (waiter, rx) = Waiter::channel();
        let id = shared.mux.register(waiter, None);
        if shared.is_closed() && shared.mux.cancel(id) {
            return Err(ConnectorError::ConnectorClosed);
        }
        if let Err(err) = shared.write(&Envelope::request(id, message)) {
            shared.mux.cancel(id);
            return Err(err);
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if shared.mux.cancel(id) {
                    debug!(correlation_id = id, ?timeout, "call timed out");
                    return Err(ConnectorError::CallTimeout(timeout));
                }
                // Already settled by another thread; its result is on the way.
                rx.recv().unwrap_or(Err(ConnectorError::CallTimeout(timeout)))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ConnectorError::ConnectorClosed),
        }
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub fn call_default(&self, message: Message) -> Result<Message> {
        self.call(message, self.shared.config.call_timeout_default)
    }

    /// Send a REQUEST and hand its outcome to `callback`.
    ///
    /// Returns the correlation id. `callback` runs exactly once, on the
    /// dispatch thread, unless this returns an error, in which case it never
    /// runs.
    pub fn call_with<F>(&self, message: Message, timeout: Duration, callback: F) -> Result<u64>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        let shared = &self.shared;
        shared.ensure_ready()?;

        let id = shared
            .mux
            .register(Waiter::Callback(Box::new(callback)), Some(timeout));
        if shared.is_closed() && shared.mux.cancel(id) {
            return Err(ConnectorError::ConnectorClosed);
        }
        if let Err(err) = shared.write(&Envelope::request(id, message)) {
            shared.mux.cancel(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Async form of [`call`](Self::call).
    ///
    /// The request is written synchronously; the wait does not block the
    /// executor.
    #[cfg(feature = "async")]
    pub async fn call_async(&self, message: Message, timeout: Duration) -> Result<Message> {
        let shared = &self.shared;
        shared.ensure_ready()?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = shared.mux.register(Waiter::Async(tx), Some(timeout));
        if shared.is_closed() && shared.mux.cancel(id) {
            return Err(ConnectorError::ConnectorClosed);
        }
        if let Err(err) = shared.write(&Envelope::request(id, message)) {
            shared.mux.cancel(id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::ConnectorClosed),
        }
    }

    /// Fire-and-forget NOTIFICATION.
    pub fn send(&self, message: Message) -> Result<()> {
        self.shared.ensure_ready()?;
        self.shared.write(&Envelope::notification(message))
    }

    /// Publish `message` on `topic`.
    pub fn notify(&self, topic: &str, message: Message) -> Result<()> {
        validate_topic(topic)?;
        self.send(with_topic(topic, message))
    }

    /// Route notifications on `topic` to `handler`, replacing any previous one.
    ///
    /// Handlers run one at a time on the dispatch thread, outside internal
    /// locks, in arrival order. A handler may block or use the connector.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        validate_topic(topic)?;
        let previous = lock(&self.shared.subscriptions).insert(topic.to_string(), Arc::new(handler));
        debug!(topic, replaced = previous.is_some(), "subscribed");
        Ok(())
    }

    /// Returns `false` if there was no subscription.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let removed = lock(&self.shared.subscriptions).remove(topic).is_some();
        debug!(topic, removed, "unsubscribed");
        removed
    }

    /// A new receiver for connection events.
    pub fn events(&self) -> mpsc::Receiver<ConnectorEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.listeners).push(tx);
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.mux.pending_count()
    }

    /// Service-assigned id of the current (or last) connection.
    pub fn peer_id(&self) -> Option<String> {
        lock(&self.shared.handshake)
            .as_ref()
            .map(|handshake| handshake.peer_id.clone())
    }

    pub fn handshake(&self) -> Option<HandshakeResult> {
        lock(&self.shared.handshake).clone()
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.shared.config
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        let previous = *state;
        if previous != next {
            info!(from = %previous, to = %next, "connection state");
            *state = next;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectorError::ConnectorClosed);
        }
        match self.state() {
            ConnectionState::Ready => Ok(()),
            other => Err(ConnectorError::NotConnected(other)),
        }
    }

    fn emit(&self, event: ConnectorEvent) {
        lock(&self.listeners).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Queue user code for the dispatch thread.
    ///
    /// Once the queue is gone a completion runs on the calling thread so the
    /// caller still hears about its call; a notification is dropped.
    fn deliver(&self, delivery: Delivery) {
        let rejected = match lock(&self.deliveries).as_ref() {
            Some(tx) => tx.send(delivery).err().map(|mpsc::SendError(d)| d),
            None => Some(delivery),
        };
        match rejected {
            Some(Delivery::Completion { callback, result }) => callback(result),
            Some(Delivery::Notification { topic, .. }) => {
                debug!(%topic, "dropping notification; connector closed");
            }
            None => {}
        }
    }

    fn dispatch_loop(shared: Weak<Self>, queue: mpsc::Receiver<Delivery>) {
        for delivery in queue {
            match delivery {
                Delivery::Completion { callback, result } => callback(result),
                Delivery::Notification {
                    topic,
                    handler,
                    message,
                } => {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    if shared.is_closed() {
                        continue;
                    }
                    handler(&message);
                    shared.emit(ConnectorEvent::NotificationReceived { topic, message });
                }
            }
        }
        debug!("dispatch loop stopped");
    }

    /// Serialize one envelope onto the stream.
    ///
    /// A transport failure degrades the connection; the caller still gets
    /// the error.
    fn write(self: &Arc<Self>, envelope: &Envelope) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let outcome = {
            let mut writer = lock(&self.writer);
            match writer.as_mut() {
                Some(writer) => writer.write_envelope(envelope),
                None => return Err(ConnectorError::NotConnected(self.state())),
            }
        };

        match outcome {
            Ok(()) => {
                trace!(
                    kind = %envelope.kind,
                    correlation_id = envelope.correlation_id,
                    "sent"
                );
                Ok(())
            }
            Err(err) if err.is_protocol() => Err(err.into()),
            Err(err) => {
                let reason = format!("write failed: {err}");
                Self::degrade(self, generation, reason);
                Err(err.into())
            }
        }
    }

    /// Connect the transport and run the client handshake.
    fn establish(&self, endpoint: &Endpoint, report_progress: bool) -> Result<Established> {
        let config = &self.config;
        let stream = hostlink_transport::connect(endpoint, config.connect_timeout)?;
        if report_progress {
            self.set_state(ConnectionState::Handshaking);
        }

        let handshake_frames = FrameConfig {
            limits: hostlink_frame::CodecLimits {
                max_message_size: config.handshake.max_handshake_payload,
                max_nesting_depth: config.max_nesting_depth,
            },
            read_timeout: Some(config.handshake.timeout),
            write_timeout: Some(config.handshake.timeout),
        };
        let mut reader = FrameReader::with_config_ipc(stream.try_clone()?, handshake_frames.clone())?;
        let mut writer = FrameWriter::with_config_ipc(stream.try_clone()?, handshake_frames)?;

        let handshake = match handshake_client(&mut reader, &mut writer, &config.handshake) {
            Ok(handshake) => handshake,
            Err(err) => {
                let _ = stream.close();
                return Err(err);
            }
        };

        // The handshake ran under a tighter pre-auth budget; switch to
        // runtime limits. The receive thread blocks until data or close.
        reader.set_limits(config.codec_limits());
        writer.set_limits(config.codec_limits());
        reader.set_read_timeout(None)?;

        info!(
            endpoint = %endpoint,
            peer_id = %handshake.peer_id,
            version = %handshake.protocol_version,
            "handshake complete"
        );
        Ok(Established {
            stream,
            reader,
            writer,
            handshake,
        })
    }

    /// Put an established connection into service and mark it READY.
    fn install(
        shared: &Arc<Self>,
        life: &mut Lifecycle,
        established: Established,
    ) -> Result<u64> {
        let Established {
            stream,
            reader,
            writer,
            handshake,
        } = established;

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&shared.writer) = Some(writer);
        *lock(&shared.handshake) = Some(handshake);
        *lock(&shared.heartbeat) = HeartbeatMonitor::new(
            shared.config.heartbeat_interval,
            shared.config.heartbeat_missed_threshold,
            Instant::now(),
        );
        shared.protocol_errors.store(0, Ordering::SeqCst);

        let spawned = Self::spawn_session_threads(shared, reader, generation);
        let (receiver, monitor) = match spawned {
            Ok(handles) => handles,
            Err(err) => {
                let _ = stream.close();
                *lock(&shared.writer) = None;
                shared.generation.fetch_add(1, Ordering::SeqCst);
                shared.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        life.session = Some(Session {
            stream,
            receiver,
            monitor,
        });
        shared.set_state(ConnectionState::Ready);
        Ok(generation)
    }

    fn spawn_session_threads(
        shared: &Arc<Self>,
        reader: FrameReader<IpcStream>,
        generation: u64,
    ) -> Result<(JoinHandle<()>, JoinHandle<()>)> {
        let recv_shared = Arc::clone(shared);
        let receiver = thread::Builder::new()
            .name("hostlink-recv".to_string())
            .spawn(move || Self::receive_loop(recv_shared, reader, generation))
            .map_err(TransportError::Io)?;

        let monitor_shared = Arc::clone(shared);
        let monitor = thread::Builder::new()
            .name("hostlink-monitor".to_string())
            .spawn(move || Self::monitor_loop(monitor_shared, generation))
            .map_err(TransportError::Io)?;

        Ok((receiver, monitor))
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.is_closed() && self.generation.load(Ordering::SeqCst) == generation
    }

    fn receive_loop(shared: Arc<Self>, mut reader: FrameReader<IpcStream>, generation: u64) {
        debug!(generation, "receive loop started");
        loop {
            let result = reader.read_envelope();
            if !shared.is_current(generation) {
                break;
            }

            match result {
                Ok(envelope) => {
                    shared.protocol_errors.store(0, Ordering::SeqCst);
                    lock(&shared.heartbeat).record_traffic(Instant::now());
                    trace!(
                        kind = %envelope.kind,
                        correlation_id = envelope.correlation_id,
                        "received"
                    );
                    shared.mux.demux(envelope);
                }
                Err(err) if err.is_protocol() => {
                    let count = shared.protocol_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(error = %err, consecutive = count, "discarding undecodable frame");
                    if count >= shared.config.max_consecutive_protocol_errors {
                        let reason =
                            format!("{count} consecutive undecodable frames; stream out of sync");
                        Self::teardown(&shared, generation, reason, false);
                        break;
                    }
                }
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    Self::degrade(&shared, generation, format!("receive failed: {err}"));
                    break;
                }
            }
        }
        debug!(generation, "receive loop stopped");
    }

    fn monitor_loop(shared: Arc<Self>, generation: u64) {
        let tick = if shared.config.heartbeats_enabled() {
            shared
                .config
                .heartbeat_interval
                .clamp(MIN_MONITOR_TICK, MAX_MONITOR_TICK)
        } else {
            MAX_MONITOR_TICK
        };

        loop {
            if shared.shutdown.wait(tick) || !shared.is_current(generation) {
                break;
            }

            let now = Instant::now();
            shared.mux.expire(now);

            if shared.state() != ConnectionState::Ready {
                continue;
            }
            let (overdue, probe) = {
                let mut hb = lock(&shared.heartbeat);
                if hb.is_overdue(now) {
                    (Some(hb.silence(now)), None)
                } else if hb.probe_due(now) {
                    (None, Some(hb.probe_sent(now)))
                } else {
                    (None, None)
                }
            };

            if let Some(silence) = overdue {
                warn!(?silence, "heartbeat deadline missed");
                Self::degrade(
                    &shared,
                    generation,
                    format!(
                        "no traffic from peer for {silence:?} (deadline {:?})",
                        shared.config.heartbeat_deadline()
                    ),
                );
                break;
            }
            if let Some(sequence) = probe {
                trace!(sequence, "heartbeat probe");
                let probe = Envelope::heartbeat(sequence, HeartbeatMarker::Probe.to_message());
                if shared.write(&probe).is_err() {
                    break;
                }
            }
        }
    }

    /// Transient failure: retire the connection and start reconnecting.
    fn degrade(shared: &Arc<Self>, generation: u64, reason: String) {
        Self::teardown(shared, generation, reason, true);
    }

    /// Retire the connection for `generation`, fail in-flight calls with
    /// `ConnectionLost`, then either reconnect or give up.
    fn teardown(shared: &Arc<Self>, generation: u64, reason: String, reconnect: bool) {
        let endpoint = {
            let mut life = lock(&shared.lifecycle);
            if !shared.is_current(generation) {
                return;
            }
            let next_generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            life.retired.retain(|handle| !handle.is_finished());
            if let Some(session) = life.session.take() {
                session.retire(&mut life.retired);
            }
            *lock(&shared.writer) = None;

            let retry = reconnect && shared.config.reconnect_backoff_max_attempts > 0;
            if retry {
                warn!(%reason, "connection degraded");
                shared.set_state(ConnectionState::Degraded);
            } else {
                error!(%reason, "connection lost");
                shared.set_state(ConnectionState::Disconnected);
            }
            life.endpoint.clone().filter(|_| retry).map(|ep| (ep, next_generation))
        };

        let failed = shared
            .mux
            .fail_all(|| ConnectorError::ConnectionLost(reason.clone()));
        if failed > 0 {
            debug!(failed, "failed in-flight calls");
        }

        match endpoint {
            Some((endpoint, next_generation)) => {
                Self::start_reconnect(shared, endpoint, next_generation)
            }
            None => shared.emit(ConnectorEvent::ConnectionLost { reason }),
        }
    }

    fn start_reconnect(shared: &Arc<Self>, endpoint: Endpoint, generation: u64) {
        let mut life = lock(&shared.lifecycle);
        if !shared.is_current(generation) {
            return;
        }

        let worker = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("hostlink-reconnect".to_string())
            .spawn(move || Self::reconnect_loop(worker, endpoint, generation));
        match spawned {
            Ok(handle) => {
                if let Some(previous) = life.reconnector.replace(handle) {
                    life.retired.push(previous);
                }
            }
            Err(err) => {
                drop(life);
                Self::give_up(shared, generation, format!("cannot start reconnect: {err}"));
            }
        }
    }

    fn reconnect_loop(shared: Arc<Self>, endpoint: Endpoint, generation: u64) {
        let mut backoff = Backoff::from_config(&shared.config);
        while let Some(delay) = backoff.next_delay() {
            if shared.shutdown.wait(delay) || !shared.is_current(generation) {
                return;
            }

            let attempt = backoff.attempts();
            warn!(attempt, ?delay, endpoint = %endpoint, "reconnecting");
            match shared.establish(&endpoint, false) {
                Ok(established) => {
                    let mut life = lock(&shared.lifecycle);
                    if !shared.is_current(generation) {
                        let _ = established.stream.close();
                        return;
                    }
                    match Self::install(&shared, &mut life, established) {
                        Ok(_) => {
                            drop(life);
                            info!(attempts = attempt, "reconnected");
                            shared.emit(ConnectorEvent::Reconnected { attempts: attempt });
                        }
                        Err(err) => {
                            drop(life);
                            error!(error = %err, "could not resume connection");
                            shared.emit(ConnectorEvent::ConnectionLost {
                                reason: err.to_string(),
                            });
                        }
                    }
                    return;
                }
                Err(err @ ConnectorError::IncompatiblePeer(_)) => {
                    Self::give_up(&shared, generation, err.to_string());
                    return;
                }
                Err(err) => debug!(attempt, error = %err, "reconnect attempt failed"),
            }
        }

        let attempts = backoff.attempts();
        Self::give_up(
            &shared,
            generation,
            format!("gave up after {attempts} reconnect attempts"),
        );
    }

    fn give_up(shared: &Arc<Self>, generation: u64, reason: String) {
        {
            let _life = lock(&shared.lifecycle);
            if !shared.is_current(generation) {
                return;
            }
            shared.generation.fetch_add(1, Ordering::SeqCst);
            error!(%reason, "connection lost");
            shared.set_state(ConnectionState::Disconnected);
        }
        shared.emit(ConnectorEvent::ConnectionLost { reason });
    }
}

impl Dispatch for Shared {
    fn notification(&self, message: Message) {
        let Some(topic) = topic_of(&message).map(str::to_string) else {
            trace!("dropping notification without topic");
            return;
        };
        let handler = lock(&self.subscriptions).get(&topic).cloned();
        let Some(handler) = handler else {
            trace!(%topic, "dropping notification; no subscriber");
            return;
        };
        if self.is_closed() {
            return;
        }
        self.deliver(Delivery::Notification {
            topic,
            handler,
            message,
        });
    }

    fn completion(&self, callback: Completion, result: Result<Message>) {
        self.deliver(Delivery::Completion { callback, result });
    }

    fn heartbeat(&self, sequence: u64, message: Message) {
        match HeartbeatMarker::from_message(&message) {
            HeartbeatMarker::Ack => trace!(sequence, "heartbeat ack"),
            HeartbeatMarker::Probe => {
                let ack = Envelope::heartbeat(sequence, HeartbeatMarker::Ack.to_message());
                let mut writer = lock(&self.writer);
                if let Some(writer) = writer.as_mut() {
                    if let Err(err) = writer.write_envelope(&ack) {
                        debug!(sequence, error = %err, "could not answer heartbeat probe");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("state", &self.shared.state())
            .field("pending_calls", &self.shared.mux.pending_count())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}
