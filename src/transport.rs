//! GATT transport abstraction (§4.3) — the capability surface the
//! presentation engine consumes. The physical radio driver and the reader
//! peripheral are out of scope (§1); this module only defines the trait
//! boundary and a scriptable in-memory double for tests and the demo CLI.
//!
//! Modeled on the teacher's `Runner` trait (`session/runner.rs`): a
//! `#[async_trait] pub trait ...: Send + Sync` that an orchestrator holds as
//! `Arc<dyn Trait>`, with results surfaced back asynchronously rather than
//! as direct call returns.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bluetooth radio is powered off")]
    PoweredOff,
    #[error("bluetooth radio is unauthorized")]
    Unauthorized,
    #[error("bluetooth radio is unsupported on this platform")]
    Unsupported,
    #[error("bluetooth radio is resetting")]
    Resetting,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("service discovery failed: {0}")]
    ServiceDiscoveryFailed(String),
    #[error("characteristic discovery failed: {0}")]
    CharacteristicDiscoveryFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

/// Radio power state (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Opaque handle to a peripheral discovered by [`Transport::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: String,
    pub name: Option<String>,
}

/// Opaque handle to a discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub id: String,
    pub uuid: Uuid,
}

/// Opaque handle to a discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub id: String,
    pub uuid: Uuid,
}

/// Serialized event stream the transport delivers to the engine's single
/// ordering domain (§4.3, §5). The engine never polls the transport
/// directly for completion — it reacts to these.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeripheralDiscovered(PeripheralHandle),
    Connected(PeripheralHandle),
    Disconnected { peripheral: PeripheralHandle, reason: String },
    ServicesDiscovered(ServiceHandle),
    CharacteristicsDiscovered(CharacteristicHandle),
    Subscribed(CharacteristicHandle),
    /// An empty `Vec` is a keepalive/no-op notification and must be ignored
    /// by the engine (§4.4 exactly-once response gating).
    Notification(Vec<u8>),
    PowerStateChanged(PowerState),
}

/// The capability the presentation engine consumes (§4.3). Every method is
/// async; completion and discovery results arrive as [`TransportEvent`]s on
/// the channel returned by [`Transport::take_events`], not as the method's
/// return value — the return value only reports whether the *request* was
/// accepted (e.g. "radio is on, scan started") or rejected outright.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn power_state(&self) -> PowerState;

    async fn scan(&self, service_uuid: Uuid) -> Result<(), TransportError>;

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
        service_uuid: Uuid,
    ) -> Result<(), TransportError>;

    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
        characteristic_uuid: Uuid,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<(), TransportError>;

    /// Fire-and-forget write — no acknowledgement is awaited (§4.3).
    async fn write_without_response(&self, characteristic: &CharacteristicHandle, bytes: Vec<u8>);

    /// Best-effort unsubscribe, used by cleanup (§4.4). Not itself listed
    /// among the §4.3 primitives, but required by the Cleanup algorithm —
    /// see DESIGN.md for this addition's grounding.
    async fn unsubscribe(&self, characteristic: &CharacteristicHandle);

    async fn disconnect(&self, peripheral: &PeripheralHandle);

    /// Re-bind to a platform-restored in-flight session (§9 "Background
    /// wake continuity"). Absent platform support the engine begins from
    /// Idle — the default here always does, since the physical radio stack
    /// is out of scope.
    async fn restore(&self, _restore_identifier: &str) -> Option<PeripheralHandle> {
        None
    }

    /// Take ownership of this transport's event stream. Must be called
    /// exactly once per transport instance; the engine holds the receiver
    /// for its lifetime.
    fn take_events(&self) -> mpsc::Receiver<TransportEvent>;
}

/// A scriptable in-memory [`Transport`] double used by tests and the CLI
/// demo harness (§6 "CLI demo harness"). Every request method succeeds
/// immediately and pushes the corresponding [`TransportEvent`] onto its own
/// channel — callers drive scenarios by calling the `push_*`/`fail_*`
/// helpers from outside, the same "scripted double" shape the teacher uses
/// for its `FakeRunner` test doubles in `session/runner.rs` tests.
pub struct MockTransport {
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    power_state: std::sync::Mutex<PowerState>,
    scan_result: std::sync::Mutex<Result<(), TransportError>>,
    connect_result: std::sync::Mutex<Result<(), TransportError>>,
    discover_services_result: std::sync::Mutex<Result<(), TransportError>>,
    discover_characteristics_result: std::sync::Mutex<Result<(), TransportError>>,
    subscribe_result: std::sync::Mutex<Result<(), TransportError>>,
    pub written: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            power_state: std::sync::Mutex::new(PowerState::PoweredOn),
            scan_result: std::sync::Mutex::new(Ok(())),
            connect_result: std::sync::Mutex::new(Ok(())),
            discover_services_result: std::sync::Mutex::new(Ok(())),
            discover_characteristics_result: std::sync::Mutex::new(Ok(())),
            subscribe_result: std::sync::Mutex::new(Ok(())),
            written: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<TransportEvent> {
        self.events_tx.clone()
    }

    pub fn set_power_state(&self, state: PowerState) {
        *self.power_state.lock().unwrap() = state;
    }

    pub fn fail_scan(&self, err: TransportError) {
        *self.scan_result.lock().unwrap() = Err(err);
    }

    pub fn fail_connect(&self, err: TransportError) {
        *self.connect_result.lock().unwrap() = Err(err);
    }

    pub async fn push(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn power_state(&self) -> PowerState {
        *self.power_state.lock().unwrap()
    }

    async fn scan(&self, _service_uuid: Uuid) -> Result<(), TransportError> {
        self.scan_result.lock().unwrap().clone()
    }

    async fn connect(&self, _peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        self.connect_result.lock().unwrap().clone()
    }

    async fn discover_services(
        &self,
        _peripheral: &PeripheralHandle,
        _service_uuid: Uuid,
    ) -> Result<(), TransportError> {
        self.discover_services_result.lock().unwrap().clone()
    }

    async fn discover_characteristics(
        &self,
        _service: &ServiceHandle,
        _characteristic_uuid: Uuid,
    ) -> Result<(), TransportError> {
        self.discover_characteristics_result.lock().unwrap().clone()
    }

    async fn subscribe(&self, _characteristic: &CharacteristicHandle) -> Result<(), TransportError> {
        self.subscribe_result.lock().unwrap().clone()
    }

    async fn write_without_response(&self, _characteristic: &CharacteristicHandle, bytes: Vec<u8>) {
        self.written.lock().unwrap().push(bytes);
    }

    async fn unsubscribe(&self, _characteristic: &CharacteristicHandle) {}

    async fn disconnect(&self, _peripheral: &PeripheralHandle) {}

    fn take_events(&self) -> mpsc::Receiver<TransportEvent> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("MockTransport::take_events called more than once")
    }
}
