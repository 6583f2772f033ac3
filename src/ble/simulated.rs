//! In-process simulated peripheral
//!
//! [`SimPeripheral`] implements [`GattTransport`] against an in-memory GATT
//! table, so sessions can be driven end to end without BLE hardware. A
//! [`SimController`] sharing the same state scripts the peripheral's
//! behavior from the test side: failed connects, rejected characteristics,
//! held completions, link loss and notifications.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::gatt::{CharacteristicId, ServiceCatalog, WriteMode};
use super::transport::{DeviceIdentity, EventSink, GattTransport, PlatformEvent};
use crate::error::PlatformError;

/// Generic GATT failure status used by Android stacks.
pub const GATT_ERROR: i32 = 133;

/// How the peripheral answers the next connect attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehavior {
    Accept,
    /// Accept the primitive, then report `ConnectFailed`.
    Fail(PlatformError),
    /// Refuse the primitive outright.
    Refuse(PlatformError),
    /// Accept the primitive and never answer.
    Ignore,
}

/// How the peripheral answers the next discovery request.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryBehavior {
    Accept,
    Fail(PlatformError),
    Ignore,
}

/// A primitive as the peripheral saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Connect,
    Discover,
    Read(CharacteristicId),
    Write {
        characteristic: CharacteristicId,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    SetNotify {
        characteristic: CharacteristicId,
        enabled: bool,
    },
    Disconnect,
}

impl Primitive {
    /// Whether this primitive is a GATT operation (as opposed to link control).
    pub fn is_operation(&self) -> bool {
        !matches!(self, Primitive::Connect | Primitive::Disconnect)
    }
}

struct SimState {
    catalog: ServiceCatalog,
    values: HashMap<CharacteristicId, Vec<u8>>,
    rejects: HashMap<CharacteristicId, i32>,
    connect_script: VecDeque<ConnectBehavior>,
    discovery_script: VecDeque<DiscoveryBehavior>,
    link_up: bool,
    /// Bumped whenever the link drops; stale delayed completions are discarded.
    generation: u64,
    notifying: BTreeSet<CharacteristicId>,
    hold: bool,
    held: VecDeque<PlatformEvent>,
    issued: Vec<Primitive>,
    outstanding: usize,
    max_outstanding: usize,
    sink: Option<EventSink>,
}

impl SimState {
    fn emit(&self, event: PlatformEvent) {
        match &self.sink {
            Some(sink) => {
                if !sink.emit(event) {
                    log::debug!("Simulated peripheral: session gone, event dropped");
                }
            }
            None => log::warn!("Simulated peripheral not attached; dropping {:?}", event),
        }
    }

    /// Deliver an operation completion.
    fn deliver(&mut self, event: PlatformEvent) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.emit(event);
    }

    fn begin_operation(&mut self) {
        self.outstanding += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding);
    }

    fn drop_link(&mut self) {
        self.link_up = false;
        self.generation += 1;
        self.notifying.clear();
        self.held.clear();
        self.outstanding = 0;
    }

    fn link_down_error() -> PlatformError {
        PlatformError::new(GATT_ERROR, "not connected")
    }
}

struct Shared {
    state: Mutex<SimState>,
    issued: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, state: &mut SimState, primitive: Primitive) {
        log::trace!("Simulated peripheral received {:?}", primitive);
        state.issued.push(primitive);
        self.issued.notify_waiters();
    }
}

/// A simulated GATT server reachable through [`GattTransport`].
pub struct SimPeripheral {
    shared: Arc<Shared>,
    /// Delay before each operation completion is reported.
    /// Uses tokio virtual time, so paused clocks advance instantly in tests.
    latency: Duration,
}

impl SimPeripheral {
    pub fn new(catalog: ServiceCatalog) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    catalog,
                    values: HashMap::new(),
                    rejects: HashMap::new(),
                    connect_script: VecDeque::new(),
                    discovery_script: VecDeque::new(),
                    link_up: false,
                    generation: 0,
                    notifying: BTreeSet::new(),
                    hold: false,
                    held: VecDeque::new(),
                    issued: Vec::new(),
                    outstanding: 0,
                    max_outstanding: 0,
                    sink: None,
                }),
                issued: Notify::new(),
            }),
            latency: Duration::ZERO,
        }
    }

    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// A handle for scripting this peripheral from the outside.
    pub fn controller(&self) -> SimController {
        SimController {
            shared: Arc::clone(&self.shared),
        }
    }

    fn finish(&self, state: &mut SimState, event: PlatformEvent) {
        if state.hold {
            state.held.push_back(event);
            return;
        }
        if self.latency.is_zero() {
            state.deliver(event);
            return;
        }
        let shared = Arc::clone(&self.shared);
        let generation = state.generation;
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let mut state = shared.lock();
            if state.generation == generation {
                state.deliver(event);
            }
        });
    }
}

#[async_trait]
impl GattTransport for SimPeripheral {
    fn attach(&mut self, events: EventSink) {
        self.shared.lock().sink = Some(events);
    }

    async fn connect(&mut self, device: &DeviceIdentity) -> Result<(), PlatformError> {
        let mut state = self.shared.lock();
        self.shared.record(&mut state, Primitive::Connect);
        let behavior = state
            .connect_script
            .pop_front()
            .unwrap_or(ConnectBehavior::Accept);
        log::debug!("Simulated connect from {}: {:?}", device, behavior);
        match behavior {
            ConnectBehavior::Accept => {
                state.link_up = true;
                state.emit(PlatformEvent::Connected);
            }
            ConnectBehavior::Fail(err) => state.emit(PlatformEvent::ConnectFailed(err)),
            ConnectBehavior::Refuse(err) => return Err(err),
            ConnectBehavior::Ignore => {}
        }
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<(), PlatformError> {
        let mut state = self.shared.lock();
        self.shared.record(&mut state, Primitive::Discover);
        if !state.link_up {
            return Err(SimState::link_down_error());
        }
        let behavior = state
            .discovery_script
            .pop_front()
            .unwrap_or(DiscoveryBehavior::Accept);
        match behavior {
            DiscoveryBehavior::Accept => {
                state.begin_operation();
                let catalog = state.catalog.clone();
                self.finish(&mut state, PlatformEvent::ServicesDiscovered(catalog));
            }
            DiscoveryBehavior::Fail(err) => {
                state.begin_operation();
                self.finish(&mut state, PlatformEvent::DiscoveryFailed(err));
            }
            DiscoveryBehavior::Ignore => {}
        }
        Ok(())
    }

    async fn read_characteristic(
        &mut self,
        characteristic: CharacteristicId,
    ) -> Result<(), PlatformError> {
        let mut state = self.shared.lock();
        self.shared.record(&mut state, Primitive::Read(characteristic));
        if !state.link_up {
            return Err(SimState::link_down_error());
        }
        state.begin_operation();
        let result = match state.rejects.get(&characteristic) {
            Some(&code) => Err(PlatformError::new(code, "read rejected")),
            None => Ok(state.values.get(&characteristic).cloned().unwrap_or_default()),
        };
        self.finish(
            &mut state,
            PlatformEvent::ReadCompleted {
                characteristic,
                result,
            },
        );
        Ok(())
    }

    async fn write_characteristic(
        &mut self,
        characteristic: CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), PlatformError> {
        let mut state = self.shared.lock();
        self.shared.record(
            &mut state,
            Primitive::Write {
                characteristic,
                payload: payload.to_vec(),
                mode,
            },
        );
        if !state.link_up {
            return Err(SimState::link_down_error());
        }
        let result = match state.rejects.get(&characteristic) {
            Some(&code) => Err(PlatformError::new(code, "write rejected")),
            None => {
                state.values.insert(characteristic, payload.to_vec());
                Ok(())
            }
        };
        if mode.expects_ack() {
            state.begin_operation();
            self.finish(
                &mut state,
                PlatformEvent::WriteCompleted {
                    characteristic,
                    result,
                },
            );
        }
        Ok(())
    }

    async fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<(), PlatformError> {
        let mut state = self.shared.lock();
        self.shared.record(
            &mut state,
            Primitive::SetNotify {
                characteristic,
                enabled,
            },
        );
        if !state.link_up {
            return Err(SimState::link_down_error());
        }
        state.begin_operation();
        let result = match state.rejects.get(&characteristic) {
            Some(&code) => Err(PlatformError::new(code, "descriptor write rejected")),
            None => {
                if enabled {
                    state.notifying.insert(characteristic);
                } else {
                    state.notifying.remove(&characteristic);
                }
                Ok(())
            }
        };
        self.finish(
            &mut state,
            PlatformEvent::NotifyCompleted {
                characteristic,
                enabled,
                result,
            },
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), PlatformError> {
        let mut state = self.shared.lock();
        self.shared.record(&mut state, Primitive::Disconnect);
        if state.link_up {
            state.drop_link();
            state.emit(PlatformEvent::Disconnected(None));
        } else {
            // Abort a connect still in progress.
            state.generation += 1;
            state.held.clear();
            state.outstanding = 0;
        }
        Ok(())
    }
}

/// Test-side handle onto a [`SimPeripheral`].
#[derive(Clone)]
pub struct SimController {
    shared: Arc<Shared>,
}

impl SimController {
    /// Queue the behavior of an upcoming connect attempt. Unscripted
    /// attempts are accepted.
    pub fn script_connect(&self, behavior: ConnectBehavior) {
        self.shared.lock().connect_script.push_back(behavior);
    }

    pub fn script_discovery(&self, behavior: DiscoveryBehavior) {
        self.shared.lock().discovery_script.push_back(behavior);
    }

    /// Make every operation on `characteristic` complete with `code`.
    pub fn reject(&self, characteristic: CharacteristicId, code: i32) {
        self.shared.lock().rejects.insert(characteristic, code);
    }

    pub fn set_value(&self, characteristic: CharacteristicId, value: impl Into<Vec<u8>>) {
        self.shared.lock().values.insert(characteristic, value.into());
    }

    pub fn value(&self, characteristic: CharacteristicId) -> Option<Vec<u8>> {
        self.shared.lock().values.get(&characteristic).cloned()
    }

    /// While held, operation completions queue up until released.
    pub fn hold_completions(&self, hold: bool) {
        self.shared.lock().hold = hold;
    }

    pub fn held(&self) -> usize {
        self.shared.lock().held.len()
    }

    /// Deliver the oldest held completion. Returns false if none was held.
    pub fn release_next(&self) -> bool {
        let mut state = self.shared.lock();
        match state.held.pop_front() {
            Some(event) => {
                state.deliver(event);
                true
            }
            None => false,
        }
    }

    /// Drop the link from the peripheral side.
    pub fn drop_link(&self, reason: Option<PlatformError>) {
        let mut state = self.shared.lock();
        if !state.link_up {
            return;
        }
        log::debug!("Simulated peripheral dropping link");
        state.drop_link();
        state.emit(PlatformEvent::Disconnected(reason));
    }

    /// Report an unrecoverable stack failure.
    pub fn fail_fatally(&self, err: PlatformError) {
        let mut state = self.shared.lock();
        state.drop_link();
        state.emit(PlatformEvent::Fatal(err));
    }

    /// Push a value change. Only delivered on characteristics with
    /// notifications enabled.
    pub fn notify(&self, characteristic: CharacteristicId, value: impl Into<Vec<u8>>) -> bool {
        let mut state = self.shared.lock();
        let value = value.into();
        if !state.link_up || !state.notifying.contains(&characteristic) {
            return false;
        }
        state.values.insert(characteristic, value.clone());
        state.emit(PlatformEvent::CharacteristicChanged {
            characteristic,
            value,
        });
        true
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().link_up
    }

    pub fn is_notifying(&self, characteristic: CharacteristicId) -> bool {
        self.shared.lock().notifying.contains(&characteristic)
    }

    pub fn issued(&self) -> Vec<Primitive> {
        self.shared.lock().issued.clone()
    }

    /// Issued GATT operations, link control excluded.
    pub fn operations(&self) -> Vec<Primitive> {
        self.shared
            .lock()
            .issued
            .iter()
            .filter(|p| p.is_operation())
            .cloned()
            .collect()
    }

    pub fn clear_issued(&self) {
        self.shared.lock().issued.clear();
    }

    /// Highest number of operations ever awaiting completion at once.
    pub fn max_outstanding(&self) -> usize {
        self.shared.lock().max_outstanding
    }

    /// Wait until at least `count` primitives have been issued.
    pub async fn wait_for_issued(&self, count: usize) {
        loop {
            let notified = self.shared.issued.notified();
            if self.shared.lock().issued.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::ServiceId;
    use crate::ble::transport::BleAddress;
    use tokio::sync::mpsc;

    fn ffe1() -> CharacteristicId {
        CharacteristicId::from_short(0xffe1)
    }

    fn device() -> DeviceIdentity {
        DeviceIdentity::new(BleAddress::Real([0x38, 0xAB, 0x41, 0x3C, 0xD4, 0x34]), "HM-10")
    }

    fn attached() -> (SimPeripheral, SimController, mpsc::UnboundedReceiver<PlatformEvent>) {
        let catalog = ServiceCatalog::new().with_service(ServiceId::from_short(0xffe0), [ffe1()]);
        let mut sim = SimPeripheral::new(catalog);
        let (tx, rx) = mpsc::unbounded_channel();
        sim.attach(EventSink::new(tx));
        let controller = sim.controller();
        (sim, controller, rx)
    }

    #[tokio::test]
    async fn test_connect_and_discover() {
        let (mut sim, controller, mut rx) = attached();

        sim.connect(&device()).await.unwrap();
        assert_eq!(rx.recv().await, Some(PlatformEvent::Connected));
        assert!(controller.is_connected());

        sim.discover_services().await.unwrap();
        match rx.recv().await {
            Some(PlatformEvent::ServicesDiscovered(catalog)) => assert!(catalog.contains(&ffe1())),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let (mut sim, controller, mut rx) = attached();
        controller.script_connect(ConnectBehavior::Fail(PlatformError::new(GATT_ERROR, "busy")));
        controller.script_connect(ConnectBehavior::Refuse(PlatformError::terminal(
            8,
            "not authorized",
        )));

        sim.connect(&device()).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(PlatformEvent::ConnectFailed(PlatformError { code: GATT_ERROR, .. }))
        ));

        let refused = sim.connect(&device()).await;
        assert!(matches!(refused, Err(PlatformError { code: 8, terminal: true, .. })));

        // Script exhausted, back to accepting
        sim.connect(&device()).await.unwrap();
        assert_eq!(rx.recv().await, Some(PlatformEvent::Connected));
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let (mut sim, controller, mut rx) = attached();
        sim.connect(&device()).await.unwrap();
        rx.recv().await;

        sim.write_characteristic(ffe1(), b"Test", WriteMode::Signed)
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(PlatformEvent::WriteCompleted {
                characteristic: ffe1(),
                result: Ok(())
            })
        );
        assert_eq!(controller.value(ffe1()), Some(b"Test".to_vec()));

        sim.read_characteristic(ffe1()).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(PlatformEvent::ReadCompleted {
                characteristic: ffe1(),
                result: Ok(b"Test".to_vec())
            })
        );
    }

    #[tokio::test]
    async fn test_write_without_response_has_no_completion() {
        let (mut sim, controller, mut rx) = attached();
        sim.connect(&device()).await.unwrap();
        rx.recv().await;

        sim.write_characteristic(ffe1(), &[0x01], WriteMode::WithoutResponse)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(controller.max_outstanding(), 0);
    }

    #[tokio::test]
    async fn test_rejected_characteristic() {
        let (mut sim, controller, mut rx) = attached();
        controller.reject(ffe1(), 3);
        sim.connect(&device()).await.unwrap();
        rx.recv().await;

        sim.write_characteristic(ffe1(), &[0x01], WriteMode::WithResponse)
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(PlatformEvent::WriteCompleted {
                result: Err(PlatformError { code: 3, .. }),
                ..
            })
        ));
        assert_eq!(controller.value(ffe1()), None);
    }

    #[tokio::test]
    async fn test_primitives_refused_without_link() {
        let (mut sim, _controller, _rx) = attached();
        assert!(sim.read_characteristic(ffe1()).await.is_err());
        assert!(sim.set_notify(ffe1(), true).await.is_err());
    }

    #[tokio::test]
    async fn test_held_completions_and_overlap_tracking() {
        let (mut sim, controller, mut rx) = attached();
        sim.connect(&device()).await.unwrap();
        rx.recv().await;

        controller.hold_completions(true);
        sim.read_characteristic(ffe1()).await.unwrap();
        sim.read_characteristic(ffe1()).await.unwrap();
        assert_eq!(controller.held(), 2);
        assert_eq!(controller.max_outstanding(), 2);
        assert!(rx.try_recv().is_err());

        assert!(controller.release_next());
        assert!(matches!(rx.recv().await, Some(PlatformEvent::ReadCompleted { .. })));
        assert_eq!(controller.held(), 1);
    }

    #[tokio::test]
    async fn test_notifications_require_subscription() {
        let (mut sim, controller, mut rx) = attached();
        sim.connect(&device()).await.unwrap();
        rx.recv().await;

        assert!(!controller.notify(ffe1(), vec![0x42]));

        sim.set_notify(ffe1(), true).await.unwrap();
        rx.recv().await;
        assert!(controller.notify(ffe1(), vec![0x42]));
        assert_eq!(
            rx.recv().await,
            Some(PlatformEvent::CharacteristicChanged {
                characteristic: ffe1(),
                value: vec![0x42]
            })
        );
    }

    #[tokio::test]
    async fn test_drop_link_discards_held_completions() {
        let (mut sim, controller, mut rx) = attached();
        sim.connect(&device()).await.unwrap();
        rx.recv().await;

        controller.hold_completions(true);
        sim.read_characteristic(ffe1()).await.unwrap();
        controller.drop_link(Some(PlatformError::new(8, "supervision timeout")));

        assert!(matches!(
            rx.recv().await,
            Some(PlatformEvent::Disconnected(Some(PlatformError { code: 8, .. })))
        ));
        assert!(!controller.release_next());
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_local_disconnect_reports_once() {
        let (mut sim, controller, mut rx) = attached();
        sim.connect(&device()).await.unwrap();
        rx.recv().await;

        sim.disconnect().await.unwrap();
        assert_eq!(rx.recv().await, Some(PlatformEvent::Disconnected(None)));

        // Already down: no second event
        sim.disconnect().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(
            controller.issued(),
            vec![Primitive::Connect, Primitive::Disconnect, Primitive::Disconnect]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_completion() {
        let (mut sim, _controller, mut rx) = attached();
        sim.set_latency(Duration::from_millis(100));
        sim.connect(&device()).await.unwrap();
        rx.recv().await;

        let before = tokio::time::Instant::now();
        sim.read_characteristic(ffe1()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(PlatformEvent::ReadCompleted { .. })));

        // Virtual time should have advanced by the configured latency.
        assert!(before.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_for_issued() {
        let (mut sim, controller, _rx) = attached();
        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.wait_for_issued(1).await }
        });
        tokio::task::yield_now().await;
        sim.connect(&device()).await.unwrap();
        waiter.await.unwrap();
        assert_eq!(controller.issued(), vec![Primitive::Connect]);
    }
}
