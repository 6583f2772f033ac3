//! GATT client session
//!
//! A [`GattSession`] owns one connection to one peripheral. All mutable state
//! lives in a single spawned task; callers talk to it through a command
//! channel and the platform through an [`EventSink`], so caller requests and
//! platform completions are serialized at one point.

pub mod operation;
pub mod queue;
pub mod retry;
pub mod state;

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::ble::gatt::{CharacteristicId, ServiceCatalog, WriteMode};
use crate::ble::transport::{DeviceIdentity, EventSink, GattTransport, PlatformEvent};
use crate::config::SessionConfig;
use crate::error::GattError;

use operation::{
    GattOperation, OperationHandle, OperationId, OperationOptions, OperationOutcome,
    PendingOperation, Responder,
};
use queue::{CancelOutcome, OperationQueue};
use state::{
    Action, ConnectionState, ConnectionStateMachine, PhaseTimeouts, StatusEvent, StatusPublisher,
};

/// A value pushed by the peripheral on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub characteristic: CharacteristicId,
    pub value: Vec<u8>,
}

/// Point-in-time view of a session, taken inside the owner task.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub device: Option<DeviceIdentity>,
    /// Operations waiting behind the in-flight slot.
    pub queued: usize,
    pub in_flight: Option<OperationId>,
    pub catalog: ServiceCatalog,
    pub subscriptions: BTreeSet<CharacteristicId>,
    pub retry_attempts: u32,
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        id: OperationId,
        device: DeviceIdentity,
        responder: Responder,
    },
    Disconnect {
        responder: Responder,
    },
    Submit(PendingOperation),
    Cancel(OperationId),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Public facade over one BLE connection.
///
/// Cheap to clone; every clone drives the same underlying session. The owner
/// task exits, tearing the link down, once every clone and every outstanding
/// [`OperationHandle`] has been dropped. Handles keep a command sender for
/// [`cancel`](OperationHandle::cancel).
#[derive(Clone)]
pub struct GattSession {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    status: broadcast::Sender<StatusEvent>,
    notifications: broadcast::Sender<Notification>,
    state: watch::Receiver<ConnectionState>,
}

impl GattSession {
    /// Start a session over `transport`. Must be called inside a tokio runtime.
    pub fn new<T>(mut transport: T, config: SessionConfig) -> Self
    where
        T: GattTransport + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        transport.attach(EventSink::new(event_tx));

        let publisher = StatusPublisher::new(config.event_capacity);
        let status = publisher.sender();
        let state = publisher.watch_state();
        let (notifications, _) = broadcast::channel(config.event_capacity);

        let machine = ConnectionStateMachine::new(
            config.retry.clone(),
            PhaseTimeouts {
                connect: config.connect_timeout,
                discovery: config.discovery_timeout,
                disconnect: config.disconnect_timeout,
            },
            config.auto_reconnect,
            publisher,
        );

        let driver = SessionDriver {
            machine,
            queue: OperationQueue::new(config.operation_timeout),
            transport: Box::new(transport),
            subscriptions: BTreeSet::new(),
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            notifications: notifications.clone(),
        };
        tokio::spawn(driver.run(command_rx, event_rx));

        Self {
            commands: command_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            status,
            notifications,
            state,
        }
    }

    /// Connect to `device`. Resolves once services are discovered and the
    /// session is `Ready`, or with the error that ended the attempt.
    pub fn connect(&self, device: DeviceIdentity) -> OperationHandle<()> {
        let (id, responder, handle) = self.handle();
        log::debug!("connect {} -> {}", device, id);
        self.send(Command::Connect {
            id,
            device,
            responder,
        });
        handle
    }

    /// Disconnect. Resolves once the session is `Disconnected`.
    pub fn disconnect(&self) -> OperationHandle<()> {
        let (_, responder, handle) = self.handle();
        self.send(Command::Disconnect { responder });
        handle
    }

    pub fn read(&self, characteristic: CharacteristicId) -> OperationHandle<Vec<u8>> {
        self.read_with(characteristic, OperationOptions::default())
    }

    pub fn read_with(
        &self,
        characteristic: CharacteristicId,
        options: OperationOptions,
    ) -> OperationHandle<Vec<u8>> {
        self.submit(GattOperation::Read { characteristic }, options)
    }

    /// Write `payload`. `WithoutResponse` resolves as soon as the platform
    /// accepts the command; the other modes wait for the acknowledgement.
    pub fn write(
        &self,
        characteristic: CharacteristicId,
        payload: impl Into<Vec<u8>>,
        mode: WriteMode,
    ) -> OperationHandle<()> {
        self.write_with(characteristic, payload, mode, OperationOptions::default())
    }

    pub fn write_with(
        &self,
        characteristic: CharacteristicId,
        payload: impl Into<Vec<u8>>,
        mode: WriteMode,
        options: OperationOptions,
    ) -> OperationHandle<()> {
        self.submit(
            GattOperation::Write {
                characteristic,
                payload: payload.into(),
                mode,
            },
            options,
        )
    }

    /// Enable notifications. Values arrive on [`notifications`](Self::notifications).
    pub fn subscribe(&self, characteristic: CharacteristicId) -> OperationHandle<()> {
        self.subscribe_with(characteristic, OperationOptions::default())
    }

    pub fn subscribe_with(
        &self,
        characteristic: CharacteristicId,
        options: OperationOptions,
    ) -> OperationHandle<()> {
        self.submit(GattOperation::Subscribe { characteristic }, options)
    }

    pub fn unsubscribe(&self, characteristic: CharacteristicId) -> OperationHandle<()> {
        self.submit(
            GattOperation::Unsubscribe { characteristic },
            OperationOptions::default(),
        )
    }

    /// Re-run service discovery; resolves with the refreshed catalog.
    pub fn discover(&self) -> OperationHandle<ServiceCatalog> {
        self.submit(GattOperation::Discover, OperationOptions::default())
    }

    /// Connection state transitions, retries and operation progress.
    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Values from `characteristic_changed` platform events.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, GattError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx));
        rx.await.map_err(|_| GattError::SessionClosed)
    }

    fn submit<T: operation::FromOutcome>(
        &self,
        op: GattOperation,
        options: OperationOptions,
    ) -> OperationHandle<T> {
        let (id, responder, handle) = self.handle();
        self.send(Command::Submit(PendingOperation {
            id,
            op,
            options,
            responder,
        }));
        handle
    }

    fn handle<T: operation::FromOutcome>(&self) -> (OperationId, Responder, OperationHandle<T>) {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let handle = OperationHandle::new(id, rx, self.commands.clone());
        (id, Responder::new(tx), handle)
    }

    fn send(&self, command: Command) {
        // If the task is gone the responder inside `command` is dropped and
        // the caller's handle resolves with `SessionClosed`.
        let _ = self.commands.send(command);
    }
}

struct SessionDriver {
    machine: ConnectionStateMachine,
    queue: OperationQueue,
    transport: Box<dyn GattTransport>,
    /// Characteristics with notifications enabled, restored after reconnect.
    subscriptions: BTreeSet<CharacteristicId>,
    connect_waiters: Vec<(OperationId, Responder)>,
    disconnect_waiters: Vec<Responder>,
    notifications: broadcast::Sender<Notification>,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<PlatformEvent>,
    ) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                // Platform events first so completions and link changes that
                // are already queued are seen before any timer fires.
                biased;
                Some(event) = events.recv() => self.handle_event(event).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = sleep_until(deadline) => self.handle_deadlines().await,
            }
        }

        log::debug!("Session handle dropped; shutting down");
        if !matches!(self.machine.state(), ConnectionState::Disconnected) {
            let _ = self.transport.disconnect().await;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.machine.next_deadline(), self.queue.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Connect {
                id,
                device,
                responder,
            } => {
                match self.machine.request_connect(device, now) {
                    Ok(actions) => {
                        self.connect_waiters.push((id, responder));
                        self.apply(actions).await;
                    }
                    Err(err) => responder.resolve(Err(err)),
                }
            }
            Command::Disconnect { responder } => {
                self.disconnect_waiters.push(responder);
                self.subscriptions.clear();
                let actions = self.machine.request_disconnect(now);
                self.apply(actions).await;
            }
            Command::Submit(pending) => self.submit(pending).await,
            Command::Cancel(id) => {
                if let Some(pos) = self.connect_waiters.iter().position(|(w, _)| *w == id) {
                    let (_, responder) = self.connect_waiters.remove(pos);
                    responder.resolve(Err(GattError::Cancelled));
                    return;
                }
                match self.queue.cancel(id) {
                    CancelOutcome::Removed => log::debug!("{} cancelled before dispatch", id),
                    CancelOutcome::Requested => {
                        log::debug!("{} cancel requested; awaiting platform", id)
                    }
                    CancelOutcome::Unknown => log::debug!("{} already resolved", id),
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(SessionSnapshot {
                    state: self.machine.state().clone(),
                    device: self.machine.device().cloned(),
                    queued: self.queue.len(),
                    in_flight: self.queue.in_flight(),
                    catalog: self.machine.catalog().clone(),
                    subscriptions: self.subscriptions.clone(),
                    retry_attempts: self.machine.retry_attempts(),
                });
            }
        }
    }

    async fn submit(&mut self, pending: PendingOperation) {
        let state = self.machine.state();
        if !state.accepts_operations() {
            log::debug!("Refusing {} {} in state {}", pending.op.name(), pending.id, state);
            pending.resolve(Err(GattError::NotConnected));
            return;
        }
        if state.is_ready() {
            if let Some(characteristic) = pending.op.characteristic() {
                if !self.machine.catalog().contains(&characteristic) {
                    pending.resolve(Err(GattError::CharacteristicNotFound(
                        characteristic.to_string(),
                    )));
                    return;
                }
            }
        }
        self.queue.enqueue(pending);
        self.dispatch().await;
    }

    async fn handle_event(&mut self, event: PlatformEvent) {
        let now = Instant::now();
        match event {
            PlatformEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                log::debug!("{} changed ({} bytes)", characteristic, value.len());
                let _ = self.notifications.send(Notification {
                    characteristic,
                    value,
                });
            }
            PlatformEvent::ReadCompleted { .. }
            | PlatformEvent::WriteCompleted { .. }
            | PlatformEvent::NotifyCompleted { .. } => self.complete(&event).await,
            PlatformEvent::ServicesDiscovered(_) | PlatformEvent::DiscoveryFailed(_)
                if self.machine.state().is_ready() =>
            {
                self.complete(&event).await
            }
            other => {
                let actions = self.machine.on_platform_event(other, now);
                self.apply(actions).await;
            }
        }
    }

    async fn complete(&mut self, event: &PlatformEvent) {
        let Some((id, result)) = self.queue.completion_for(event) else {
            log::warn!("Dropping completion with no matching operation: {:?}", event);
            return;
        };
        if let Ok(OperationOutcome::Discovered(catalog)) = &result {
            self.machine.replace_catalog(catalog.clone());
        }
        if let Some(done) = self
            .queue
            .on_operation_completed(id, result, self.machine.status())
        {
            if done.applied {
                match done.op {
                    GattOperation::Subscribe { characteristic } => {
                        self.subscriptions.insert(characteristic);
                    }
                    GattOperation::Unsubscribe { characteristic } => {
                        self.subscriptions.remove(&characteristic);
                    }
                    _ => {}
                }
            }
        }
        self.dispatch().await;
    }

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();
        if self.queue.expire(now, self.machine.status()).is_some() {
            self.dispatch().await;
        }
        let actions = self.machine.on_deadline(now);
        self.apply(actions).await;
    }

    async fn dispatch(&mut self) {
        self.queue
            .try_dispatch_next(
                self.machine.state(),
                self.machine.catalog(),
                self.transport.as_mut(),
                self.machine.status(),
                Instant::now(),
            )
            .await;
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut work: VecDeque<Action> = actions.into();
        while let Some(action) = work.pop_front() {
            match action {
                Action::Connect(device) => {
                    if let Err(err) = self.transport.connect(&device).await {
                        log::warn!("Connect to {} refused: {}", device, err);
                        let follow_up = self
                            .machine
                            .on_platform_event(PlatformEvent::ConnectFailed(err), Instant::now());
                        prepend(&mut work, follow_up);
                    }
                }
                Action::DiscoverServices => {
                    if let Err(err) = self.transport.discover_services().await {
                        log::warn!("Discovery refused: {}", err);
                        let follow_up = self
                            .machine
                            .on_platform_event(PlatformEvent::DiscoveryFailed(err), Instant::now());
                        prepend(&mut work, follow_up);
                    }
                }
                Action::Teardown => {
                    if let Err(err) = self.transport.disconnect().await {
                        log::warn!("Teardown failed: {}", err);
                    }
                }
                Action::AbandonOperations => self.queue.abandon(self.machine.status()),
                Action::DrainOperations(err) => {
                    self.queue.drain(err, self.machine.status());
                    if matches!(self.machine.state(), ConnectionState::Disconnected) {
                        self.subscriptions.clear();
                    }
                }
                Action::ResolveConnect(result) => {
                    for (_, responder) in self.connect_waiters.drain(..) {
                        responder.resolve(result.clone().map(|()| OperationOutcome::Done));
                    }
                }
                Action::ResolveDisconnect => {
                    for responder in self.disconnect_waiters.drain(..) {
                        responder.resolve(Ok(OperationOutcome::Done));
                    }
                }
                Action::Ready { restored } => {
                    if restored {
                        self.restore_subscriptions();
                    }
                    self.dispatch().await;
                }
            }
        }
    }

    /// Re-enable notifications lost with the previous link. Queued ahead of
    /// retained caller operations.
    fn restore_subscriptions(&mut self) {
        let queued: Vec<_> = self
            .subscriptions
            .iter()
            .copied()
            .filter(|c| self.machine.catalog().contains(c))
            .collect();
        if queued.is_empty() {
            return;
        }
        log::info!("Restoring {} subscriptions", queued.len());
        for characteristic in queued.into_iter().rev() {
            self.queue.enqueue_front(PendingOperation {
                id: OperationId(0),
                op: GattOperation::Subscribe { characteristic },
                options: OperationOptions::default(),
                responder: Responder::detached(),
            });
        }
    }
}

fn prepend(work: &mut VecDeque<Action>, actions: Vec<Action>) {
    for action in actions.into_iter().rev() {
        work.push_front(action);
    }
}

/// Longest wait ever scheduled. Anything later is treated as this.
const MAX_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// `now + after`, clamped so caller-supplied durations cannot overflow.
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(MAX_WAIT)).unwrap_or(now)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
