//! Credential presentation engine (§4.4) — the state machine that sequences
//! transport and codec calls, enforces timeouts, verifies the reader's
//! nonce echo, and surfaces a terminal result.
//!
//! Shape: a cheaply-`Clone`-able handle (`PresentationEngine`) in front of a
//! single background task (`Worker`) that owns all mutable session state —
//! the crate's version of the teacher's `CircuitBreaker` (`Arc<RwLock<Inner>>`
//! handle, single write-lock critical section per transition) combined with
//! the interval-loop/shared-snapshot-publish pattern from
//! `connectivity/monitor.rs`. Putting the hot state machine on one task
//! rather than behind a shared mutex is what gives us the "single ordering
//! domain" §5 requires for free: only the *published* observable snapshot
//! needs a lock, because only one task ever reads or writes session state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{self, CodecError, PresentationResult};
use crate::config::EngineConfig;
use crate::transport::{
    CharacteristicHandle, PeripheralHandle, PowerState, ServiceHandle, Transport, TransportError,
    TransportEvent,
};

/// Session state (§3). `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribing,
    Authenticating,
    SendingCredential,
    Complete(PresentationResult),
    Failed(String),
}

impl SessionState {
    fn is_terminal_or_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::Complete(_) | Self::Failed(_))
    }
}

/// Observable state (§6) — for observers only, never used for control flow.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObservableState {
    pub state: SessionState,
    pub connected_peripheral_name: Option<String>,
    pub discovered_service_uuid: Option<Uuid>,
    pub discovered_characteristic_uuid: Option<Uuid>,
    pub last_result: Option<PresentationResult>,
}

impl Default for ObservableState {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            connected_peripheral_name: None,
            discovered_service_uuid: None,
            discovered_characteristic_uuid: None,
            last_result: None,
        }
    }
}

/// Command sent to the worker task over its single command channel.
enum EngineCommand {
    Present,
    Cancel,
}

/// What the engine is waiting for after a `write_without_response` (§4.4
/// exactly-once response gating).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Scan,
    Connect,
    Response,
    SubscribeDelay,
    RetryBackoff,
}

/// Ephemeral per-attempt state (§3), cleared on every cleanup.
#[derive(Default)]
struct EphemeralState {
    peripheral: Option<PeripheralHandle>,
    characteristic: Option<CharacteristicHandle>,
    nonce_m: Option<[u8; codec::NONCE_LEN]>,
}

impl EphemeralState {
    fn clear(&mut self) {
        // Nonce_M must never be reused; dropping it here (rather than
        // carrying it forward) is what "discarded on transition out of
        // Authenticating" means in practice.
        *self = Self::default();
    }
}

/// A cheaply-cloneable handle to a running presentation engine. All clones
/// share the same worker task and observable state.
#[derive(Clone)]
pub struct PresentationEngine {
    cmd_tx: mpsc::Sender<EngineCommand>,
    observable: Arc<RwLock<ObservableState>>,
}

impl PresentationEngine {
    /// Spawns the worker task and returns a handle to it. `on_complete` is
    /// invoked exactly once per terminal transition (§6 Completion
    /// callback).
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        on_complete: impl Fn(PresentationResult) + Send + Sync + 'static,
    ) -> Self {
        let observable = Arc::new(RwLock::new(ObservableState::default()));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let events_rx = transport.take_events();

        let worker = Worker {
            config: Arc::new(config),
            transport,
            observable: observable.clone(),
            on_complete: Arc::new(on_complete),
            cmd_rx,
            events_rx,
            state: SessionState::Idle,
            ephemeral: EphemeralState::default(),
            pending_start: false,
            attempt: 1,
            timer: None,
        };
        tokio::spawn(worker.run());

        Self { cmd_tx, observable }
    }

    /// Arms the engine for one presentation attempt cycle (up to
    /// `retry_max` attempts). Ignored with a log if an attempt is already
    /// in flight (§7 Caller errors).
    pub async fn present_credential(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Present).await;
    }

    /// Idempotent, legal from any state (§4.4 Cancel).
    pub async fn cancel(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Cancel).await;
    }

    pub async fn observe(&self) -> ObservableState {
        self.observable.read().await.clone()
    }
}

struct Worker {
    config: Arc<EngineConfig>,
    transport: Arc<dyn Transport>,
    observable: Arc<RwLock<ObservableState>>,
    on_complete: Arc<dyn Fn(PresentationResult) + Send + Sync>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    events_rx: mpsc::Receiver<TransportEvent>,

    state: SessionState,
    ephemeral: EphemeralState,
    pending_start: bool,
    attempt: u32,
    timer: Option<(TimerKind, Instant)>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let deadline = self.timer.map(|(_, d)| d);
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Present) => self.handle_present().await,
                        Some(EngineCommand::Cancel) => self.handle_cancel().await,
                        None => break,
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(ev) => self.handle_event(ev).await,
                        None => debug!("transport event stream closed"),
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    self.handle_timer_fire().await;
                }
            }
        }
    }

    // ── Commands ──────────────────────────────────────────────────────

    async fn handle_present(&mut self) {
        if !self.state.is_terminal_or_idle() {
            warn!(state = ?self.state, "present_credential ignored: attempt already in progress");
            return;
        }
        self.attempt = 1;
        self.begin_attempt_cycle().await;
    }

    async fn handle_cancel(&mut self) {
        info!("cancel requested");
        self.cleanup_attempt().await;
        self.pending_start = false;
        self.set_state(SessionState::Idle).await;
    }

    /// §4.4 "Idle --presentCredential--> [power_on?]": only the very first
    /// entry into an attempt cycle checks power state; retries call
    /// `start_scanning` directly since the radio was already on a moment
    /// ago.
    async fn begin_attempt_cycle(&mut self) {
        match self.transport.power_state().await {
            PowerState::PoweredOn => {
                self.pending_start = false;
                self.start_scanning().await;
            }
            other => {
                info!(power_state = ?other, "radio not powered on yet — deferring scan");
                self.pending_start = true;
                self.set_state(SessionState::Idle).await;
            }
        }
    }

    // ── State entry points ───────────────────────────────────────────

    async fn start_scanning(&mut self) {
        self.ephemeral.clear();
        self.set_state(SessionState::Scanning).await;
        match self.transport.scan(self.config.service_uuid).await {
            Ok(()) => self.arm_timer(TimerKind::Scan, self.config.scan_timeout),
            Err(e) => self.on_attempt_failure(transport_error_message(e)).await,
        }
    }

    async fn start_connecting(&mut self, peripheral: PeripheralHandle) {
        self.cancel_timer();
        self.ephemeral.peripheral = Some(peripheral.clone());
        self.set_state(SessionState::Connecting).await;
        match self.transport.connect(&peripheral).await {
            Ok(()) => self.arm_timer(TimerKind::Connect, self.config.connection_timeout),
            Err(e) => self.on_attempt_failure(transport_error_message(e)).await,
        }
    }

    async fn start_discovering_services(&mut self, peripheral: PeripheralHandle) {
        self.cancel_timer();
        {
            let mut obs = self.observable.write().await;
            obs.connected_peripheral_name = peripheral.name.clone();
        }
        self.set_state(SessionState::DiscoveringServices).await;
        match self
            .transport
            .discover_services(&peripheral, self.config.service_uuid)
            .await
        {
            Ok(()) => self.arm_timer(TimerKind::Connect, self.config.connection_timeout),
            Err(e) => self.on_attempt_failure(transport_error_message(e)).await,
        }
    }

    async fn start_discovering_characteristics(&mut self, service: ServiceHandle) {
        self.cancel_timer();
        {
            let mut obs = self.observable.write().await;
            obs.discovered_service_uuid = Some(service.uuid);
        }
        self.set_state(SessionState::DiscoveringCharacteristics).await;
        match self
            .transport
            .discover_characteristics(&service, self.config.characteristic_uuid)
            .await
        {
            Ok(()) => self.arm_timer(TimerKind::Connect, self.config.connection_timeout),
            Err(e) => self.on_attempt_failure(transport_error_message(e)).await,
        }
    }

    async fn start_subscribing(&mut self, characteristic: CharacteristicHandle) {
        self.cancel_timer();
        {
            let mut obs = self.observable.write().await;
            obs.discovered_characteristic_uuid = Some(characteristic.uuid);
        }
        self.ephemeral.characteristic = Some(characteristic.clone());
        self.set_state(SessionState::Subscribing).await;
        match self.transport.subscribe(&characteristic).await {
            Ok(()) => self.arm_timer(TimerKind::Connect, self.config.connection_timeout),
            Err(e) => self.on_attempt_failure(transport_error_message(e)).await,
        }
    }

    /// §4.4 Subscribe delay: ~100ms between subscribe-confirmed and sending
    /// AUTH_REQUEST, considered part of the state machine.
    async fn on_subscribed(&mut self) {
        self.cancel_timer();
        self.arm_timer(TimerKind::SubscribeDelay, Duration::from_millis(100));
        // state stays Subscribing during the delay.
    }

    async fn send_auth_request(&mut self) {
        let characteristic = match self.ephemeral.characteristic.clone() {
            Some(c) => c,
            None => {
                self.on_attempt_failure("no characteristic selected".to_string()).await;
                return;
            }
        };
        match codec::build_auth_request(
            self.config.device_id.expose(),
            self.config.device_key.expose(),
        ) {
            Ok((frame, nonce_m)) => {
                self.ephemeral.nonce_m = Some(nonce_m);
                self.set_state(SessionState::Authenticating).await;
                self.transport.write_without_response(&characteristic, frame).await;
                self.arm_timer(TimerKind::Response, self.config.response_timeout);
            }
            Err(e) => self.on_attempt_failure(format!("failed to build AUTH_REQUEST: {e}")).await,
        }
    }

    async fn send_credential(&mut self) {
        let characteristic = match self.ephemeral.characteristic.clone() {
            Some(c) => c,
            None => {
                self.on_attempt_failure("no characteristic selected".to_string()).await;
                return;
            }
        };
        match codec::build_credential(self.config.device_key.expose(), self.config.credential.expose()) {
            Ok(frame) => {
                self.set_state(SessionState::SendingCredential).await;
                self.transport.write_without_response(&characteristic, frame).await;
                self.arm_timer(TimerKind::Response, self.config.response_timeout);
            }
            Err(e) => self.on_attempt_failure(format!("failed to build CREDENTIAL: {e}")).await,
        }
    }

    // ── Transport events ─────────────────────────────────────────────

    async fn handle_event(&mut self, event: TransportEvent) {
        match (self.state.clone(), event) {
            (SessionState::Scanning, TransportEvent::PeripheralDiscovered(p)) => {
                self.start_connecting(p).await;
            }
            (SessionState::Connecting, TransportEvent::Connected(p)) => {
                self.start_discovering_services(p).await;
            }
            (SessionState::DiscoveringServices, TransportEvent::ServicesDiscovered(s)) => {
                self.start_discovering_characteristics(s).await;
            }
            (SessionState::DiscoveringCharacteristics, TransportEvent::CharacteristicsDiscovered(c)) => {
                self.start_subscribing(c).await;
            }
            (SessionState::Subscribing, TransportEvent::Subscribed(_)) => {
                self.on_subscribed().await;
            }
            (SessionState::Authenticating, TransportEvent::Notification(bytes)) => {
                if bytes.is_empty() {
                    return; // keepalive — ignored, awaiter stays armed
                }
                // `nonce_m` is cleared by `cleanup_attempt` the moment an
                // attempt fails into retry backoff, but `self.state` stays
                // `Authenticating` until `start_scanning` runs again — a
                // reader's delayed or retransmitted response arriving in
                // that window must be dropped as stale, not treated as
                // belonging to the new attempt.
                let Some(nonce_m) = self.ephemeral.nonce_m else {
                    debug!("dropping stale AUTH_RESPONSE — no attempt awaiting one");
                    return;
                };
                self.cancel_timer();
                match codec::parse_auth_response(&bytes, self.config.device_key.expose(), &nonce_m) {
                    Ok(_nonce_r) => self.send_credential().await,
                    Err(CodecError::NonceMismatch) => self.on_nonce_mismatch().await,
                    Err(e) => self.on_attempt_failure(e.terminal_message()).await,
                }
            }
            (SessionState::SendingCredential, TransportEvent::Notification(bytes)) => {
                if bytes.is_empty() {
                    return;
                }
                self.cancel_timer();
                match codec::parse_credential_response(&bytes) {
                    // §9 Open Question: reader-policy rejections (REJECTED,
                    // EXPIRED, ...) still complete the protocol — no retry.
                    Ok(result) => self.complete(result).await,
                    Err(e) => self.on_attempt_failure(e.terminal_message()).await,
                }
            }
            (state, TransportEvent::Disconnected { reason, .. }) if !state.is_terminal_or_idle() => {
                self.on_attempt_failure(format!("unexpected disconnect: {reason}")).await;
            }
            (SessionState::Idle, TransportEvent::PowerStateChanged(PowerState::PoweredOn))
                if self.pending_start =>
            {
                self.pending_start = false;
                self.attempt = 1;
                self.start_scanning().await;
            }
            (state, TransportEvent::PowerStateChanged(p))
                if !state.is_terminal_or_idle()
                    && matches!(
                        p,
                        PowerState::PoweredOff
                            | PowerState::Unauthorized
                            | PowerState::Unsupported
                            | PowerState::Resetting
                    ) =>
            {
                self.on_attempt_failure(format!("radio unavailable: {p:?}")).await;
            }
            _ => {
                // Stale or out-of-order event for the current state — the
                // single-slot awaiter has already resolved or this event
                // belongs to a prior attempt. Dropped per §4.4.
                debug!(state = ?self.state, "dropping event not applicable to current state");
            }
        }
    }

    async fn on_nonce_mismatch(&mut self) {
        // Security-fatal (§4.4): disconnect immediately, never retry.
        warn!("Nonce_M echo mismatch — treating as key mismatch or active MitM");
        self.cleanup_attempt().await;
        self.pending_start = false;
        self.complete_failed("reader verification failed".to_string()).await;
    }

    // ── Timers ────────────────────────────────────────────────────────

    fn arm_timer(&mut self, kind: TimerKind, duration: Duration) {
        self.timer = Some((kind, Instant::now() + duration));
    }

    fn cancel_timer(&mut self) {
        self.timer = None;
    }

    async fn handle_timer_fire(&mut self) {
        let Some((kind, _)) = self.timer.take() else {
            return;
        };
        // Late-fire protection (§5): the timer we just popped must still
        // match what the current state expects, otherwise this is a stale
        // fire racing a resolution that already happened this tick.
        match (kind, self.state.clone()) {
            (TimerKind::Scan, SessionState::Scanning) => {
                self.on_attempt_failure("No reader found".to_string()).await;
            }
            (TimerKind::Connect, state)
                if matches!(
                    state,
                    SessionState::Connecting
                        | SessionState::DiscoveringServices
                        | SessionState::DiscoveringCharacteristics
                        | SessionState::Subscribing
                ) =>
            {
                self.on_attempt_failure("connection timed out".to_string()).await;
            }
            (TimerKind::Response, SessionState::Authenticating) => {
                self.on_attempt_failure("reader did not respond to authentication".to_string())
                    .await;
            }
            (TimerKind::Response, SessionState::SendingCredential) => {
                self.on_attempt_failure("reader did not respond with credential result".to_string())
                    .await;
            }
            (TimerKind::SubscribeDelay, SessionState::Subscribing) => {
                self.send_auth_request().await;
            }
            (TimerKind::RetryBackoff, _) => {
                self.start_scanning().await;
            }
            (kind, state) => {
                debug!(?kind, ?state, "late timer fire ignored (state already moved on)");
            }
        }
    }

    // ── Terminal transitions & retry ────────────────────────────────

    async fn on_attempt_failure(&mut self, message: String) {
        warn!(attempt = self.attempt, retry_max = self.config.retry_max, error = %message, "presentation attempt failed");
        self.cleanup_attempt().await;

        if self.attempt < self.config.retry_max {
            self.attempt += 1;
            self.arm_timer(TimerKind::RetryBackoff, self.config.retry_backoff);
        } else {
            self.pending_start = false;
            self.complete_failed(message).await;
        }
    }

    async fn complete(&mut self, result: PresentationResult) {
        self.cleanup_attempt().await;
        self.pending_start = false;
        {
            let mut obs = self.observable.write().await;
            obs.last_result = Some(result.clone());
        }
        self.set_state(SessionState::Complete(result.clone())).await;
        (self.on_complete)(result);
    }

    async fn complete_failed(&mut self, message: String) {
        let result = PresentationResult {
            success: false,
            message: message.clone(),
        };
        {
            let mut obs = self.observable.write().await;
            obs.last_result = Some(result.clone());
        }
        self.set_state(SessionState::Failed(message)).await;
        (self.on_complete)(result);
    }

    /// §4.4 Cleanup: cancel both timers, unsubscribe best-effort, request
    /// disconnect, zero ephemeral state including Nonce_M.
    async fn cleanup_attempt(&mut self) {
        self.cancel_timer();
        if let Some(characteristic) = self.ephemeral.characteristic.clone() {
            self.transport.unsubscribe(&characteristic).await;
        }
        if let Some(peripheral) = self.ephemeral.peripheral.clone() {
            self.transport.disconnect(&peripheral).await;
        }
        self.ephemeral.clear();
    }

    async fn set_state(&mut self, state: SessionState) {
        self.state = state.clone();
        let mut obs = self.observable.write().await;
        obs.state = state;
    }
}

fn transport_error_message(e: TransportError) -> String {
    e.to_string()
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
