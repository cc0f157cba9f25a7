//! [`ConnectionManager`] – owns the one live connection to the indicator.
//!
//! A connection goes through two phases:
//!
//! 1. **Attempt** – [`ConnectionManager::connect`] opens the transport and
//!    runs the protocol handshake under a single `connect_timeout`.  The
//!    attempt either ends `Connected` or `Error`; it never leaves a future
//!    pending.
//! 2. **Session** – a spawned task that owns the transport from then on.  It
//!    frames and decodes inbound data, normalises and publishes readings,
//!    polls the device on a timer (ADI `live_weight`, SCP `{FN}`) and
//!    watches liveness.  The task is stopped through its
//!    [`CancellationToken`].
//!
//! Every status change goes through the kernel's
//! [`ConnectionStateMachine`] and is published on the [`EventBus`] as a
//! `StatusChanged` event.  Per-reading bookkeeping (`last_response_raw`,
//! `last_reading_at`) updates the status silently.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scalelink_runtime::manager::{ConnectionManager, ManagerConfig};
//! use scalelink_transport::SystemTransports;
//! use scalelink_types::ConnectionConfig;
//!
//! # async fn demo() {
//! let config = ManagerConfig::default();
//! let transports = Arc::new(SystemTransports::new(config.connect_timeout));
//! let manager = Arc::new(ConnectionManager::new(config, transports));
//! let _readings = manager.on_reading(|r| println!("{} kg", r.weight));
//! if manager.connect(ConnectionConfig::default_adi()).await {
//!     println!("{:?}", manager.status());
//! }
//! manager.disconnect().await;
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use scalelink_kernel::{ConnectGate, ConnectionStateMachine, Liveness, LivenessMonitor};
use scalelink_middleware::{EventBus, Normalizer, NormalizerConfig, NormalizerStats, Subscription};
use scalelink_protocol::{AdiClient, Codec, Decoded, LineFramer, ScpCommand, codec_for};
use scalelink_transport::{Endpoint, Inbound, Transport, TransportFactory};
use scalelink_types::{
    ConnectionConfig, ConnectionState, ConnectionStatus, Event, EventPayload, ProtocolKind,
    RawReading, ScaleError, ScaleReading, TransportEndpoint, TransportError, TransportKind,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_SOURCE: &str = "scalelink-runtime::manager";

/// Raw writes queued for the session task.
const OUTBOUND_CAPACITY: usize = 16;

/// Longest ADI body kept as `last_response_raw`.
const RAW_EXCERPT_CHARS: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Timing and filtering knobs for [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Upper bound on one whole connect attempt, handshake included.
    pub connect_timeout: Duration,
    /// How long SCP waits for the `{VM}` identity reply.
    pub handshake_timeout: Duration,
    /// After an unanswered `{VM}`, how long any inbound reading still counts
    /// as proof of a live indicator.
    pub passive_wait: Duration,
    /// ADI `live_weight` / SCP `{FN}` polling period.
    pub poll_interval: Duration,
    pub liveness_check_interval: Duration,
    /// Quiet time before `Connected` becomes `Stale`.
    pub stale_after: Duration,
    /// Quiet time before the session is torn down with an error.
    pub expire_after: Duration,
    /// A repeated connect with the same config keeps the session when data
    /// arrived within this window.
    pub active_flow_window: Duration,
    /// Grace period for the session task to close the transport on stop.
    pub shutdown_timeout: Duration,
    pub dedupe_window: Duration,
    pub dedupe_tolerance_kg: f64,
    pub max_weight_kg: f64,
    pub require_identifier: bool,
    /// Session capture persists stable readings only.
    pub capture_stable_only: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            handshake_timeout: Duration::from_secs(2),
            passive_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(2500),
            liveness_check_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(5 * 60),
            expire_after: Duration::from_secs(15 * 60),
            active_flow_window: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(2),
            dedupe_window: Duration::from_secs(2),
            dedupe_tolerance_kg: 0.5,
            max_weight_kg: 10_000.0,
            require_identifier: false,
            capture_stable_only: false,
        }
    }
}

impl ManagerConfig {
    pub fn normalizer_config(&self) -> NormalizerConfig {
        NormalizerConfig {
            max_weight_kg: self.max_weight_kg,
            dedupe_window: self.dedupe_window,
            dedupe_tolerance_kg: self.dedupe_tolerance_kg,
            require_identifier: self.require_identifier,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

/// State read by consumers and written by both `connect` and the session
/// task.  Never held across an `.await`.
#[derive(Debug)]
struct Shared {
    machine: ConnectionStateMachine,
    status: ConnectionStatus,
    liveness: Option<LivenessMonitor>,
    normalizer: Normalizer,
}

impl Shared {
    /// Move to `to`, then apply `update`.  Returns the status to publish, or
    /// `None` when the step is illegal from the current state.
    fn advance(
        &mut self,
        to: ConnectionState,
        update: impl FnOnce(&mut ConnectionStatus),
    ) -> Option<ConnectionStatus> {
        if let Err(e) = self.machine.transition(to) {
            warn!(error = %e, "status update dropped");
            return None;
        }
        update(&mut self.status);
        self.status.state = to;
        self.status.connected = matches!(to, ConnectionState::Connected | ConnectionState::Stale);
        Some(self.status.clone())
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish_status(bus: &EventBus, status: ConnectionStatus) {
    // Best effort: nobody listening is fine.
    let _ = bus.publish(Event::new(EVENT_SOURCE, EventPayload::StatusChanged(status)));
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionManager
// ─────────────────────────────────────────────────────────────────────────────

/// The single owner of the indicator connection.  Share it behind an `Arc`.
pub struct ConnectionManager {
    config: ManagerConfig,
    factory: Arc<dyn TransportFactory>,
    bus: EventBus,
    gate: ConnectGate,
    shared: Arc<Mutex<Shared>>,
    session: tokio::sync::Mutex<Option<Session>>,
    /// Token of the newest attempt; it becomes the session's token on success.
    current: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let shared = Shared {
            machine: ConnectionStateMachine::new(),
            status: ConnectionStatus::idle(),
            liveness: None,
            normalizer: Normalizer::new(config.normalizer_config()),
        };
        Self {
            config,
            factory,
            bus: EventBus::default(),
            gate: ConnectGate::new(),
            shared: Arc::new(Mutex::new(shared)),
            session: tokio::sync::Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current status.  Subscribers that join late start from this; the bus
    /// does not replay.
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared).status.clone()
    }

    pub fn normalizer_stats(&self) -> NormalizerStats {
        lock(&self.shared).normalizer.stats()
    }

    /// `true` while a connect attempt is running.
    pub fn is_connecting(&self) -> bool {
        self.gate.is_busy()
    }

    pub fn on_reading<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ScaleReading) + Send + Sync + 'static,
    {
        self.bus.on_reading(callback)
    }

    pub fn on_status_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.bus.on_status_changed(callback)
    }

    /// Endpoints the operator could pick for `kind`.
    pub async fn list_endpoints(&self, kind: TransportKind) -> Result<Vec<Endpoint>, ScaleError> {
        Ok(self.factory.create(kind).list_available().await?)
    }

    // -------------------------------------------------------------------------
    // Connect / disconnect
    // -------------------------------------------------------------------------

    /// Connect to the indicator described by `config`.
    ///
    /// Returns `true` once the session is `Connected`.  Returns `false`
    /// straight away, without touching the status, while another attempt is
    /// in flight.  Every other failure is reported through the status
    /// (`Error` with a details string) as well as the return value.
    ///
    /// Connecting again with the same config while data is flowing keeps
    /// the current session and returns `true`.
    pub async fn connect(&self, config: ConnectionConfig) -> bool {
        let Some(_guard) = self.gate.try_acquire() else {
            warn!(%config, "connect rejected: another attempt is in progress");
            return false;
        };

        if let Err(e) = config.validate() {
            warn!(%config, error = %e, "connect rejected: invalid configuration");
            self.stop_session().await;
            self.fail(&config, e.to_string());
            return false;
        }

        if self.is_flowing(&config).await {
            info!(%config, "data already flowing on this connection; keeping session");
            return true;
        }

        self.stop_session().await;

        let cancel = CancellationToken::new();
        *self.current_token() = Some(cancel.clone());

        let connecting = {
            let mut shared = lock(&self.shared);
            shared.normalizer.reset();
            shared.liveness = None;
            shared.advance(ConnectionState::Connecting, |s| {
                *s = ConnectionStatus {
                    transport: Some(config.transport()),
                    protocol: Some(config.protocol),
                    ..ConnectionStatus::idle()
                };
            })
        };
        if let Some(status) = connecting {
            publish_status(&self.bus, status);
        }
        info!(%config, "connecting");

        let mut transport = match config.protocol {
            // ADI talks HTTP through its own client.
            ProtocolKind::Adi => None,
            _ => Some(self.factory.create(config.transport())),
        };

        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            self.establish(&config, &mut transport),
        );
        let outcome = tokio::select! {
            result = attempt => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(ScaleError::Transport(TransportError::Timeout)),
            },
            _ = cancel.cancelled() => {
                info!(%config, "connect attempt cancelled");
                close_quietly(&mut transport).await;
                return false;
            }
        };

        let established = match outcome {
            Ok(established) => established,
            Err(e) => {
                warn!(%config, error = %e, "connect failed");
                close_quietly(&mut transport).await;
                self.fail(&config, e.to_string());
                return false;
            }
        };

        let (outbound_tx, outbound_rx) = transport
            .as_ref()
            .map(|_| mpsc::channel(OUTBOUND_CAPACITY))
            .unzip();

        // Held until the session is stored, so a concurrent `disconnect`
        // either cancels before this check or finds the session to stop.
        let mut slot = self.session.lock().await;
        let connected = {
            let mut shared = lock(&self.shared);
            if cancel.is_cancelled() {
                None
            } else {
                shared.liveness = Some(LivenessMonitor::new(
                    self.config.stale_after,
                    self.config.expire_after,
                ));
                let raw = established.last_raw.clone();
                shared.advance(ConnectionState::Connected, |s| {
                    s.last_response_raw = raw;
                    s.error = None;
                })
            }
        };
        let Some(status) = connected else {
            drop(slot);
            info!(%config, "connect attempt cancelled");
            close_quietly(&mut transport).await;
            return false;
        };
        info!(%config, "connected");
        publish_status(&self.bus, status);

        let worker = SessionWorker {
            protocol: config.protocol,
            cancel: cancel.clone(),
            shared: Arc::clone(&self.shared),
            bus: self.bus.clone(),
            transport,
            inbound: established.inbound,
            outbound: outbound_rx,
            framer: established.framer,
            codec: established.codec,
            adi: established.adi,
            poll_interval: self.config.poll_interval,
            liveness_check_interval: self.config.liveness_check_interval,
        };
        let task = tokio::spawn(worker.run(established.early));

        *slot = Some(Session {
            config,
            cancel,
            task,
            outbound: outbound_tx,
        });
        true
    }

    /// Stop the session (or a running attempt) and return to `Idle`.
    ///
    /// Safe from any state and idempotent: when already idle nothing changes
    /// and nothing is published.
    pub async fn disconnect(&self) {
        self.stop_session().await;
        let idle = {
            let mut shared = lock(&self.shared);
            if shared.status.is_idle() {
                None
            } else {
                shared.machine.reset();
                shared.liveness = None;
                shared.status = ConnectionStatus::idle();
                Some(shared.status.clone())
            }
        };
        if let Some(status) = idle {
            info!("disconnected");
            publish_status(&self.bus, status);
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Queue raw bytes for the device on the open byte channel.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ScaleError> {
        let outbound = self
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.outbound.clone());
        let Some(tx) = outbound else {
            return Err(TransportError::Unavailable("no open byte channel".to_string()).into());
        };
        tx.send(bytes)
            .await
            .map_err(|_| ScaleError::from(TransportError::Unavailable("session ended".to_string())))
    }

    pub async fn send_command(&self, command: ScpCommand) -> Result<(), ScaleError> {
        debug!(%command, "queueing scp command");
        self.send_raw(command.encode()).await
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    fn current_token(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, config: &ConnectionConfig, details: String) {
        let failed = lock(&self.shared).advance(ConnectionState::Error, |s| {
            s.transport = Some(config.transport());
            s.protocol = Some(config.protocol);
            s.error = Some(details);
        });
        if let Some(status) = failed {
            publish_status(&self.bus, status);
        }
    }

    async fn is_flowing(&self, config: &ConnectionConfig) -> bool {
        let same_session = self
            .session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| &s.config == config && !s.task.is_finished());
        if !same_session {
            return false;
        }
        let shared = lock(&self.shared);
        shared.status.state == ConnectionState::Connected
            && shared
                .liveness
                .as_ref()
                .is_some_and(|l| l.flowing_within(self.config.active_flow_window))
    }

    /// Cancel the newest attempt and stop the running session, if any.
    async fn stop_session(&self) {
        let token = self.current_token().take();
        if let Some(token) = token {
            token.cancel();
        }
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.stop(self.config.shutdown_timeout).await;
        }
    }

    /// Open the link and run the protocol handshake.  The caller bounds this
    /// with `connect_timeout`.
    async fn establish(
        &self,
        config: &ConnectionConfig,
        transport: &mut Option<Box<dyn Transport>>,
    ) -> Result<Established, ScaleError> {
        let mut framer = LineFramer::for_protocol(config.protocol);
        let mut codec = codec_for(config.protocol);

        if config.protocol == ProtocolKind::Adi {
            let TransportEndpoint::Tcp { host, port } = &config.endpoint else {
                return Err(ScaleError::Config("ADI requires a tcp endpoint".to_string()));
            };
            let client = AdiClient::new(host, *port, self.config.connect_timeout)?;
            let reached = client.reach().await?;
            return Ok(Established {
                inbound: None,
                framer,
                codec,
                adi: Some(client),
                last_raw: Some(excerpt(&reached.body)),
                early: Vec::new(),
            });
        }

        let Some(link) = transport.as_mut() else {
            return Err(TransportError::Unavailable(format!("no adapter for {}", config.transport())).into());
        };
        let mut inbound = link.open(config).await?;
        let mut seen = Handshake::default();

        let handshake = codec.handshake();
        if !handshake.is_empty() {
            for command in &handshake {
                link.send(command).await?;
            }
            let identified = await_reply(
                &mut inbound,
                &mut framer,
                &mut *codec,
                self.config.handshake_timeout,
                Expect::Identity,
                &mut seen,
            )
            .await?;
            if !identified && seen.early.is_empty() {
                debug!("no identity reply; waiting passively for data");
                let heard = await_reply(
                    &mut inbound,
                    &mut framer,
                    &mut *codec,
                    self.config.passive_wait,
                    Expect::Reading,
                    &mut seen,
                )
                .await?;
                if !heard {
                    return Err(TransportError::Timeout.into());
                }
            }
        }

        Ok(Established {
            inbound: Some(inbound),
            framer,
            codec,
            adi: None,
            last_raw: seen.last_raw,
            early: seen.early,
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // The session task closes its transport once cancelled.
        if let Some(token) = self.current_token().take() {
            token.cancel();
        }
    }
}

async fn close_quietly(transport: &mut Option<Box<dyn Transport>>) {
    if let Some(link) = transport.as_mut()
        && let Err(e) = link.close().await
    {
        debug!(error = %e, "close after failed attempt");
    }
}

fn excerpt(body: &str) -> String {
    body.trim().chars().take(RAW_EXCERPT_CHARS).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the attempt hands over to the session task.
struct Established {
    inbound: Option<Inbound>,
    framer: LineFramer,
    codec: Box<dyn Codec>,
    adi: Option<AdiClient>,
    last_raw: Option<String>,
    /// Readings that arrived during the handshake.
    early: Vec<RawReading>,
}

#[derive(Debug, Default)]
struct Handshake {
    last_raw: Option<String>,
    early: Vec<RawReading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Identity,
    Reading,
}

/// Read inbound lines until `expect` shows up or `window` runs out.
///
/// `Ok(false)` is a quiet link; every line seen is recorded in `seen`.
async fn await_reply(
    inbound: &mut Inbound,
    framer: &mut LineFramer,
    codec: &mut dyn Codec,
    window: Duration,
    expect: Expect,
    seen: &mut Handshake,
) -> Result<bool, ScaleError> {
    let deadline = Instant::now() + window;
    loop {
        let chunk = match tokio::time::timeout_at(deadline, inbound.recv()).await {
            Err(_) => return Ok(false),
            Ok(None) => {
                return Err(
                    TransportError::Unavailable("link closed during handshake".to_string()).into(),
                );
            }
            Ok(Some(chunk)) => chunk?,
        };

        let mut matched = false;
        for line in framer.push(&chunk) {
            match codec.decode(&line)? {
                Decoded::Identity(model) => {
                    info!(%model, "indicator identified");
                    matched |= expect == Expect::Identity;
                }
                Decoded::Reading(raw) => {
                    seen.early.push(raw);
                    matched |= expect == Expect::Reading;
                }
                Decoded::Ack => debug!("command acknowledged"),
                Decoded::Unrecognized => debug!(%line, "unrecognised handshake line"),
            }
            seen.last_raw = Some(line);
        }
        if matched {
            return Ok(true);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct Session {
    config: ConnectionConfig,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// `None` for ADI, which has no raw byte channel.
    outbound: Option<mpsc::Sender<Vec<u8>>>,
}

impl Session {
    async fn stop(mut self, grace: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("session task did not stop in time; aborting");
            self.task.abort();
        }
    }
}

enum SessionEnd {
    Cancelled,
    Failed(String),
}

/// The per-connection task.  Only it writes to or closes the transport.
struct SessionWorker {
    protocol: ProtocolKind,
    cancel: CancellationToken,
    shared: Arc<Mutex<Shared>>,
    bus: EventBus,
    transport: Option<Box<dyn Transport>>,
    inbound: Option<Inbound>,
    outbound: Option<mpsc::Receiver<Vec<u8>>>,
    framer: LineFramer,
    codec: Box<dyn Codec>,
    adi: Option<AdiClient>,
    poll_interval: Duration,
    liveness_check_interval: Duration,
}

impl SessionWorker {
    async fn run(mut self, early: Vec<RawReading>) {
        for raw in early {
            self.accept(raw);
        }

        let end = self.pump().await;

        if let Some(link) = self.transport.as_mut()
            && let Err(e) = link.close().await
        {
            debug!(error = %e, "transport close failed");
        }

        if let SessionEnd::Failed(reason) = end
            && !self.cancel.is_cancelled()
        {
            warn!(%reason, "session ended");
            let failed = lock(&self.shared).advance(ConnectionState::Error, |s| {
                s.error = Some(reason);
            });
            if let Some(status) = failed {
                publish_status(&self.bus, status);
            }
        }
    }

    async fn pump(&mut self) -> SessionEnd {
        let polls = self.adi.is_some() || self.codec.poll_command().is_some();
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = tokio::time::interval(self.liveness_check_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First ticks complete immediately.
        poll.tick().await;
        watchdog.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                chunk = next_chunk(&mut self.inbound) => match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = self.on_bytes(&bytes) {
                            return SessionEnd::Failed(e.to_string());
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    None => return SessionEnd::Failed("link closed by device".to_string()),
                },
                Some(bytes) = next_outbound(&mut self.outbound) => {
                    if let Err(e) = self.write(&bytes).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                }
                _ = poll.tick(), if polls => {
                    if let Some(end) = self.poll().await {
                        return end;
                    }
                }
                _ = watchdog.tick() => {
                    if let Some(end) = self.check_liveness() {
                        return end;
                    }
                }
            }
        }
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Result<(), ScaleError> {
        self.heartbeat();
        for line in self.framer.push(bytes) {
            let decoded = self.codec.decode(&line)?;
            self.record_raw(&line);
            match decoded {
                Decoded::Reading(raw) => self.accept(raw),
                Decoded::Identity(model) => debug!(%model, "identity line"),
                Decoded::Ack => {}
                Decoded::Unrecognized => debug!(%line, "unrecognised line"),
            }
        }
        Ok(())
    }

    /// ADI asks its client for the live weight; byte protocols write the
    /// codec's poll command.
    async fn poll(&mut self) -> Option<SessionEnd> {
        let Some(client) = self.adi.clone() else {
            let command = self.codec.poll_command()?;
            return self
                .write(&command)
                .await
                .err()
                .map(|e| SessionEnd::Failed(e.to_string()));
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Some(SessionEnd::Cancelled),
            result = client.live_weight() => result,
        };
        match result {
            Ok(reading) => {
                self.heartbeat();
                if let Some(raw) = reading {
                    self.record_raw(&raw.source_raw);
                    self.accept(raw);
                }
                None
            }
            Err(ScaleError::Protocol(e)) if e.is_actionable() => {
                Some(SessionEnd::Failed(e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "adi poll failed");
                None
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ScaleError> {
        match self.transport.as_mut() {
            Some(link) => Ok(link.send(bytes).await?),
            None => Err(TransportError::Unavailable(format!(
                "{} has no raw byte channel",
                self.protocol
            ))
            .into()),
        }
    }

    /// Record a sign of life; revives a stale connection.
    fn heartbeat(&self) {
        let revived = {
            let mut shared = lock(&self.shared);
            if let Some(liveness) = shared.liveness.as_mut() {
                liveness.heartbeat();
            }
            if shared.status.state == ConnectionState::Stale {
                shared.advance(ConnectionState::Connected, |_| {})
            } else {
                None
            }
        };
        if let Some(status) = revived {
            info!("data resumed; connection live again");
            publish_status(&self.bus, status);
        }
    }

    fn record_raw(&self, line: &str) {
        lock(&self.shared).status.last_response_raw = Some(excerpt(line));
    }

    fn accept(&self, raw: RawReading) {
        let reading = {
            let mut shared = lock(&self.shared);
            let reading = shared.normalizer.ingest(raw);
            if let Some(r) = &reading {
                shared.status.last_reading_at = Some(r.timestamp);
            }
            reading
        };
        if let Some(reading) = reading {
            debug!(weight = reading.weight, stable = reading.stable, "reading accepted");
            // Best effort: nobody listening is fine.
            let _ = self
                .bus
                .publish(Event::new(EVENT_SOURCE, EventPayload::Reading(reading)));
        }
    }

    fn check_liveness(&self) -> Option<SessionEnd> {
        let stale = {
            let mut shared = lock(&self.shared);
            let (verdict, expire_after) = {
                let liveness = shared.liveness.as_ref()?;
                (liveness.assess(), liveness.expire_after())
            };
            match verdict {
                Liveness::Expired => {
                    return Some(SessionEnd::Failed(format!(
                        "no data received for {}s",
                        expire_after.as_secs()
                    )));
                }
                Liveness::Stale if shared.status.state == ConnectionState::Connected => {
                    shared.advance(ConnectionState::Stale, |_| {})
                }
                _ => None,
            }
        };
        if let Some(status) = stale {
            warn!("no data within the liveness window; connection stale");
            publish_status(&self.bus, status);
        }
        None
    }
}

async fn next_chunk(inbound: &mut Option<Inbound>) -> Option<Result<Vec<u8>, TransportError>> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_outbound(outbound: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scalelink_middleware::Topic;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, PartialEq)]
    enum OpenBehavior {
        Ready,
        Hang,
        Refuse,
    }

    type WireSender = mpsc::Sender<Result<Vec<u8>, TransportError>>;

    /// Scripted indicator shared by every transport the factory hands out.
    #[derive(Clone)]
    struct Device {
        behavior: OpenBehavior,
        replies: Vec<(&'static str, &'static str)>,
        sent: Arc<Mutex<Vec<String>>>,
        wire: Arc<Mutex<Option<WireSender>>>,
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl Device {
        fn new(behavior: OpenBehavior) -> Self {
            Self {
                behavior,
                replies: Vec::new(),
                sent: Arc::new(Mutex::new(Vec::new())),
                wire: Arc::new(Mutex::new(None)),
                opens: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn replying(mut self, trigger: &'static str, reply: &'static str) -> Self {
            self.replies.push((trigger, reply));
            self
        }

        /// Send `text` as if the indicator had written it.
        fn emit(&self, text: &str) -> bool {
            let tx = self.wire.lock().expect("wire").clone();
            tx.is_some_and(|tx| tx.try_send(Ok(text.as_bytes().to_vec())).is_ok())
        }

        fn hang_up(&self) {
            self.wire.lock().expect("wire").take();
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().expect("sent").clone()
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct MockTransport {
        kind: TransportKind,
        device: Device,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn list_available(&self) -> Result<Vec<Endpoint>, TransportError> {
            Ok(vec![Endpoint::new(self.kind, "mock0", "Mock indicator")])
        }

        async fn open(&mut self, _config: &ConnectionConfig) -> Result<Inbound, TransportError> {
            self.device.opens.fetch_add(1, Ordering::SeqCst);
            match self.device.behavior {
                OpenBehavior::Refuse => Err(TransportError::Refused("mock refused".into())),
                OpenBehavior::Hang => std::future::pending().await,
                OpenBehavior::Ready => {
                    let (tx, rx) = mpsc::channel(64);
                    *self.device.wire.lock().expect("wire") = Some(tx);
                    Ok(rx)
                }
            }
        }

        async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            let text = String::from_utf8_lossy(bytes).into_owned();
            self.device.sent.lock().expect("sent").push(text.clone());
            for (trigger, reply) in &self.device.replies {
                if text.contains(trigger) {
                    self.device.emit(reply);
                }
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.device.closes.fetch_add(1, Ordering::SeqCst);
            self.device.hang_up();
            Ok(())
        }
    }

    struct MockFactory {
        device: Device,
    }

    impl TransportFactory for MockFactory {
        fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
            Box::new(MockTransport {
                kind,
                device: self.device.clone(),
            })
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(100),
            passive_wait: Duration::from_millis(100),
            poll_interval: Duration::from_secs(60),
            liveness_check_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_millis(200),
            ..ManagerConfig::default()
        }
    }

    fn manager_with(device: &Device, config: ManagerConfig) -> Arc<ConnectionManager> {
        let factory = Arc::new(MockFactory {
            device: device.clone(),
        });
        Arc::new(ConnectionManager::new(config, factory))
    }

    fn scp() -> ConnectionConfig {
        ConnectionConfig::serial("/dev/ttyMOCK", 9600, ProtocolKind::Scp)
    }

    fn ascii() -> ConnectionConfig {
        ConnectionConfig::serial("/dev/ttyMOCK", 9600, ProtocolKind::Ascii)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn disconnect_when_idle_changes_nothing() {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        let mut status_rx = manager.bus().subscribe_to(Topic::Status);

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.status(), ConnectionStatus::idle());
        let quiet = tokio::time::timeout(Duration::from_millis(50), status_rx.recv()).await;
        assert!(quiet.is_err(), "idle disconnect must not publish");
    }

    #[tokio::test]
    async fn scp_identity_reply_connects() {
        let device = Device::new(OpenBehavior::Ready).replying("{VM}", "[XR5000 v2.1]\r\n");
        let manager = manager_with(&device, fast_config());

        assert!(manager.connect(scp()).await);
        let status = manager.status();
        assert!(status.connected);
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.protocol, Some(ProtocolKind::Scp));
        assert_eq!(status.last_response_raw.as_deref(), Some("[XR5000 v2.1]"));
        assert!(status.error.is_none());
        assert_eq!(device.sent(), vec!["{ZA1}\r\n", "{VM}\r\n"]);
    }

    #[tokio::test]
    async fn scp_passive_reading_counts_as_alive() {
        let device = Device::new(OpenBehavior::Ready).replying("{ZA1}", "[U87.3]\r\n");
        let manager = manager_with(&device, fast_config());
        assert!(manager.connect(scp()).await);
        assert_eq!(manager.status().last_response_raw.as_deref(), Some("[U87.3]"));
    }

    #[tokio::test]
    async fn silent_scp_device_fails_after_passive_wait() {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        assert!(!manager.connect(scp()).await);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(!status.connected);
        assert_eq!(status.error.as_deref(), Some("timeout"));
        assert_eq!(device.closes(), 1);
    }

    #[tokio::test]
    async fn attempt_exceeding_timeout_reports_timeout() {
        let device = Device::new(OpenBehavior::Hang);
        let config = ManagerConfig {
            connect_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let manager = manager_with(&device, config);

        let started = std::time::Instant::now();
        assert!(!manager.connect(ascii()).await);
        assert!(started.elapsed() < Duration::from_secs(2));

        let status = manager.status();
        assert!(!status.connected);
        assert_eq!(status.error.as_deref(), Some("timeout"));
        assert!(!manager.is_connecting());
    }

    #[tokio::test]
    async fn refused_open_reports_transport_error() {
        let device = Device::new(OpenBehavior::Refuse);
        let manager = manager_with(&device, fast_config());
        assert!(!manager.connect(ascii()).await);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.unwrap_or_default().contains("refused"));
    }

    #[tokio::test]
    async fn overlapping_connect_is_rejected() {
        let device = Device::new(OpenBehavior::Hang);
        let manager = manager_with(&device, fast_config());

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect(ascii()).await })
        };
        assert!(eventually(|| manager.is_connecting()).await);

        assert!(!manager.connect(ascii()).await);
        assert_eq!(manager.status().state, ConnectionState::Connecting);
        assert!(!first.await.expect("join"));
    }

    #[tokio::test]
    async fn disconnect_during_attempt_cancels_it() {
        let device = Device::new(OpenBehavior::Hang);
        let manager = manager_with(&device, fast_config());

        let attempt = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect(ascii()).await })
        };
        assert!(eventually(|| manager.is_connecting()).await);

        manager.disconnect().await;
        assert!(!attempt.await.expect("join"));
        assert_eq!(manager.status(), ConnectionStatus::idle());
        assert!(manager.session.lock().await.is_none());
        assert!(!manager.is_connecting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_racing_connected_never_leaves_a_session() {
        for _ in 0..20 {
            let device = Device::new(OpenBehavior::Ready);
            let manager = manager_with(&device, fast_config());
            let mut status_rx = manager.bus().subscribe_to(Topic::Status);

            // Disconnect the moment `Connected` is published.
            let racer = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    while let Ok(event) = status_rx.recv().await {
                        if let EventPayload::StatusChanged(s) = event.payload
                            && s.state == ConnectionState::Connected
                        {
                            manager.disconnect().await;
                            return;
                        }
                    }
                })
            };

            assert!(manager.connect(ascii()).await);
            racer.await.expect("join");

            assert_eq!(manager.status(), ConnectionStatus::idle());
            assert!(manager.session.lock().await.is_none());
            assert_eq!(device.closes(), 1);
            assert!(manager.send_raw(b"x".to_vec()).await.is_err());
        }
    }

    #[tokio::test]
    async fn invalid_config_moves_to_error() {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        let adi_over_serial = ConnectionConfig::serial("/dev/ttyMOCK", 9600, ProtocolKind::Adi);

        assert!(!manager.connect(adi_over_serial).await);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.unwrap_or_default().contains("requires tcp"));
        assert_eq!(device.opens(), 0);
    }

    #[tokio::test]
    async fn readings_are_normalised_and_published() {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = manager.on_reading(move |r| sink.lock().expect("seen").push(r));

        assert!(manager.connect(ascii()).await);
        assert!(device.emit("Weight:450,ID:BR1234,Stable:1\r\n"));
        assert!(device.emit("Weight:450.2,ID:BR1234,Stable:1\r\n"));
        assert!(device.emit("Weight:0,ID:BR1234,Stable:1\r\n"));
        assert!(device.emit("Weight:512,ID:BR1235,Stable:1\r\n"));

        assert!(eventually(|| seen.lock().expect("seen").len() == 2).await);
        let readings = seen.lock().expect("seen").clone();
        assert_eq!(readings[0].weight, 450.0);
        assert_eq!(readings[0].animal_id(), Some("BR1234"));
        assert_eq!(readings[1].visual_id.as_deref(), Some("BR1235"));

        let status = manager.status();
        assert!(status.last_reading_at.is_some());
        assert_eq!(manager.normalizer_stats().duplicates, 1);
        assert_eq!(manager.normalizer_stats().rejected, 1);
    }

    #[tokio::test]
    async fn repeated_connect_keeps_flowing_session() {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        assert!(manager.connect(ascii()).await);
        assert!(device.emit("310.5\r\n"));
        assert!(eventually(|| manager.status().last_response_raw.is_some()).await);

        assert!(manager.connect(ascii()).await);
        assert_eq!(device.opens(), 1);
        assert_eq!(device.closes(), 0);
    }

    #[tokio::test]
    async fn connect_without_recent_data_reconnects() {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        assert!(manager.connect(ascii()).await);
        assert!(manager.connect(ascii()).await);
        assert_eq!(device.opens(), 2);
        assert_eq!(device.closes(), 1);
    }

    #[tokio::test]
    async fn disconnect_closes_link_and_publishes_idle() {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        assert!(manager.connect(ascii()).await);

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let _sub = manager.on_status_changed(move |s| sink.lock().expect("states").push(s.state));

        manager.disconnect().await;
        assert_eq!(device.closes(), 1);
        assert_eq!(manager.status(), ConnectionStatus::idle());
        assert!(eventually(|| *states.lock().expect("states") == vec![ConnectionState::Idle]).await);
    }

    #[tokio::test]
    async fn quiet_link_goes_stale_and_recovers() {
        let device = Device::new(OpenBehavior::Ready);
        let config = ManagerConfig {
            stale_after: Duration::from_millis(80),
            expire_after: Duration::from_secs(30),
            ..fast_config()
        };
        let manager = manager_with(&device, config);
        assert!(manager.connect(ascii()).await);

        assert!(eventually(|| manager.status().state == ConnectionState::Stale).await);
        assert!(manager.status().connected);

        assert!(device.emit("Weight:300,ID:A1,Stable:1\r\n"));
        assert!(eventually(|| manager.status().state == ConnectionState::Connected).await);
    }

    #[tokio::test]
    async fn expired_link_is_torn_down_with_error() {
        let device = Device::new(OpenBehavior::Ready);
        let config = ManagerConfig {
            stale_after: Duration::from_millis(40),
            expire_after: Duration::from_millis(120),
            ..fast_config()
        };
        let manager = manager_with(&device, config);
        assert!(manager.connect(ascii()).await);

        assert!(eventually(|| manager.status().state == ConnectionState::Error).await);
        let status = manager.status();
        assert!(!status.connected);
        assert!(status.error.unwrap_or_default().contains("no data"));
        assert!(eventually(|| device.closes() == 1).await);
    }

    #[tokio::test]
    async fn device_hang_up_moves_to_error() {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        assert!(manager.connect(ascii()).await);

        device.hang_up();
        assert!(eventually(|| manager.status().state == ConnectionState::Error).await);
        assert_eq!(
            manager.status().error.as_deref(),
            Some("link closed by device")
        );
    }

    #[tokio::test]
    async fn scp_session_polls_for_records() {
        let device = Device::new(OpenBehavior::Ready).replying("{VM}", "[XR5000]\r\n");
        let config = ManagerConfig {
            poll_interval: Duration::from_millis(30),
            ..fast_config()
        };
        let manager = manager_with(&device, config);
        assert!(manager.connect(scp()).await);
        assert!(eventually(|| device.sent().iter().any(|s| s == "{FN}\r\n")).await);
    }

    #[tokio::test]
    async fn send_raw_reaches_the_device() -> Result<(), Box<dyn std::error::Error>> {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());

        assert!(manager.send_raw(b"{VM}\r\n".to_vec()).await.is_err());

        assert!(manager.connect(ascii()).await);
        manager.send_command(ScpCommand::VersionModel).await?;
        assert!(eventually(|| device.sent().contains(&"{VM}\r\n".to_string())).await);
        Ok(())
    }

    #[tokio::test]
    async fn adi_against_closed_port_fails_within_timeout() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        let started = std::time::Instant::now();
        assert!(!manager.connect(ConnectionConfig::tcp("127.0.0.1", port, ProtocolKind::Adi)).await);
        assert!(started.elapsed() < Duration::from_secs(2));

        let status = manager.status();
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.is_some());
        assert_eq!(device.opens(), 0);
    }

    #[tokio::test]
    async fn list_endpoints_uses_the_factory() -> Result<(), Box<dyn std::error::Error>> {
        let device = Device::new(OpenBehavior::Ready);
        let manager = manager_with(&device, fast_config());
        let endpoints = manager.list_endpoints(TransportKind::Serial).await?;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].kind, TransportKind::Serial);
        Ok(())
    }
}
