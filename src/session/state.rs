//! Connection lifecycle state machine
//!
//! The machine owns the connection state, the discovered catalog and the
//! retry budget. It never performs I/O: every transition returns the
//! [`Action`]s the session task must carry out, in order.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::operation::OperationId;
use super::retry::{RetryBudget, RetryDecision, RetryPolicy};
use super::deadline_after;
use crate::ble::gatt::ServiceCatalog;
use crate::ble::transport::{DeviceIdentity, PlatformEvent};
use crate::error::{GattError, PlatformError};

/// Why a connection attempt or link failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub message: String,
    pub code: Option<i32>,
    /// Terminal failures skip the retry policy entirely.
    pub terminal: bool,
}

impl FailureReason {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            terminal: false,
        }
    }

    pub fn terminal(code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            terminal: true,
        }
    }

    pub fn timeout() -> Self {
        Self::transient("timeout")
    }

    /// Error reported to callers when this failure ends the connection.
    fn caller_error(&self) -> GattError {
        GattError::PlatformRejected(self.code.unwrap_or(-1))
    }
}

impl From<PlatformError> for FailureReason {
    fn from(err: PlatformError) -> Self {
        Self {
            message: err.message,
            code: Some(err.code),
            terminal: err.terminal,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Lifecycle of the single connection owned by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
    Disconnecting,
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// States in which new operations are queued rather than refused.
    pub fn accepts_operations(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::DiscoveringServices
                | ConnectionState::Ready
        )
    }

    /// Allowed edges of the lifecycle graph.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Disconnecting) => true,
            (Connected, DiscoveringServices) => true,
            (Connected, Disconnecting) => true,
            (DiscoveringServices, Ready) => true,
            (DiscoveringServices, Disconnecting) => true,
            (Ready, Disconnecting) => true,
            (Disconnecting, Disconnected) => true,
            // Link lost with auto-reconnect enabled
            (Disconnecting, Failed(_)) => true,
            (Failed(_), Connecting) => true,
            (Failed(_), Disconnected) => true,
            // Fatal errors and timeouts can strike anywhere a handle is live
            (Connecting | Connected | DiscoveringServices | Ready, Failed(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::DiscoveringServices => write!(f, "discovering services"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// What happened, for logging and UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusKind {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    RetryScheduled {
        attempt: u32,
        #[serde(with = "crate::config::millis")]
        delay: Duration,
    },
    RetryExhausted {
        attempts: u32,
    },
    OperationDispatched {
        id: OperationId,
        operation: String,
    },
    OperationCompleted {
        id: OperationId,
        success: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: StatusKind,
}

/// Push-only fan-out of status events and the current state.
#[derive(Debug)]
pub struct StatusPublisher {
    events: broadcast::Sender<StatusEvent>,
    state: watch::Sender<ConnectionState>,
}

impl StatusPublisher {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { events, state }
    }

    pub fn publish(&self, kind: StatusKind) {
        // No subscribers is fine.
        let _ = self.events.send(StatusEvent {
            at: Utc::now(),
            kind,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<StatusEvent> {
        self.events.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: &ConnectionState) {
        self.state.send_replace(state.clone());
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Issue the platform connect primitive.
    Connect(DeviceIdentity),
    /// Issue the platform discovery primitive.
    DiscoverServices,
    /// Tear down the platform connection handle.
    Teardown,
    /// In-flight operation fails with `ConnectionLost`; queued operations fail
    /// with `NotReady` unless retained across reconnect.
    AbandonOperations,
    /// In-flight operation fails with `ConnectionLost`; every queued operation
    /// fails with the given error.
    DrainOperations(GattError),
    /// Resolve every pending connect request.
    ResolveConnect(Result<(), GattError>),
    /// Resolve every pending disconnect request.
    ResolveDisconnect,
    /// Entered `Ready`; `restored` is true when this follows an automatic
    /// reconnect.
    Ready { restored: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Connect,
    Discovery,
    Disconnect,
    /// Waiting for the platform to confirm the old link is gone before
    /// starting the backoff.
    Teardown { retry_in: Duration },
    Reconnect,
}

/// Per-phase timeouts.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimeouts {
    pub connect: Duration,
    pub discovery: Duration,
    pub disconnect: Duration,
}

pub struct ConnectionStateMachine {
    state: ConnectionState,
    device: Option<DeviceIdentity>,
    catalog: ServiceCatalog,
    budget: RetryBudget,
    timeouts: PhaseTimeouts,
    auto_reconnect: bool,
    deadline: Option<(Instant, Deadline)>,
    /// Current connect cycle was started by the machine, not the caller.
    restoring: bool,
    /// A live link was torn down and its `Disconnected` has not arrived yet.
    /// That event belongs to the old handle and must not fail a new attempt.
    teardown_pending: bool,
    status: StatusPublisher,
}

impl ConnectionStateMachine {
    pub fn new(
        policy: RetryPolicy,
        timeouts: PhaseTimeouts,
        auto_reconnect: bool,
        status: StatusPublisher,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device: None,
            catalog: ServiceCatalog::new(),
            budget: RetryBudget::new(policy),
            timeouts,
            auto_reconnect,
            deadline: None,
            restoring: false,
            teardown_pending: false,
            status,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    pub fn retry_attempts(&self) -> u32 {
        self.budget.attempts()
    }

    /// When [`on_deadline`](Self::on_deadline) next needs to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    /// Replace the catalog after a rediscovery while `Ready`.
    pub fn replace_catalog(&mut self, catalog: ServiceCatalog) {
        self.catalog = catalog;
    }

    pub fn request_connect(
        &mut self,
        device: DeviceIdentity,
        now: Instant,
    ) -> Result<Vec<Action>, GattError> {
        let state = self.state.clone();
        match state {
            ConnectionState::Disconnected => {
                log::info!("Connecting to {}", device);
                self.budget.reset();
                self.restoring = false;
                self.device = Some(device.clone());
                self.transition(ConnectionState::Connecting);
                self.deadline = Some((deadline_after(now, self.timeouts.connect), Deadline::Connect));
                Ok(vec![Action::Connect(device)])
            }
            ConnectionState::Disconnecting => Err(GattError::Busy),
            _ if self.device.as_ref() != Some(&device) => Err(GattError::Busy),
            ConnectionState::Ready => Ok(vec![Action::ResolveConnect(Ok(()))]),
            // Already on its way; the caller joins the pending request.
            _ => Ok(Vec::new()),
        }
    }

    pub fn request_disconnect(&mut self, now: Instant) -> Vec<Action> {
        let state = self.state.clone();
        match state {
            ConnectionState::Disconnected => vec![Action::ResolveDisconnect],
            ConnectionState::Disconnecting => Vec::new(),
            ConnectionState::Failed(_) => {
                // Handle already torn down while waiting out the backoff.
                self.enter_disconnected(GattError::NotReady, GattError::Cancelled)
            }
            _ => {
                log::info!("Disconnect requested in state {}", self.state);
                self.catalog.clear();
                self.transition(ConnectionState::Disconnecting);
                self.deadline = Some((deadline_after(now, self.timeouts.disconnect), Deadline::Disconnect));
                vec![
                    Action::DrainOperations(GattError::NotReady),
                    Action::ResolveConnect(Err(GattError::Cancelled)),
                    Action::Teardown,
                ]
            }
        }
    }

    /// Consume a connection-level platform event. Operation completions and
    /// notifications are routed elsewhere and ignored here.
    pub fn on_platform_event(&mut self, event: PlatformEvent, now: Instant) -> Vec<Action> {
        let state = self.state.clone();
        match (event, &state) {
            (PlatformEvent::Connected, ConnectionState::Connecting) => {
                // The platform reports the new link only after the old one.
                self.teardown_pending = false;
                self.transition(ConnectionState::Connected);
                self.transition(ConnectionState::DiscoveringServices);
                self.deadline = Some((
                    deadline_after(now, self.timeouts.discovery),
                    Deadline::Discovery,
                ));
                vec![Action::DiscoverServices]
            }
            (PlatformEvent::ConnectFailed(err), ConnectionState::Connecting) => {
                self.fail(err.into(), false, now)
            }
            (PlatformEvent::ServicesDiscovered(catalog), ConnectionState::DiscoveringServices) => {
                self.catalog = catalog;
                self.budget.reset();
                self.deadline = None;
                let restored = std::mem::replace(&mut self.restoring, false);
                self.transition(ConnectionState::Ready);
                vec![Action::ResolveConnect(Ok(())), Action::Ready { restored }]
            }
            (PlatformEvent::DiscoveryFailed(err), ConnectionState::DiscoveringServices) => {
                self.fail(err.into(), true, now)
            }
            (PlatformEvent::Fatal(err), _) => self.on_fatal(err, now),
            (PlatformEvent::Disconnected(_), _) if self.teardown_pending => {
                self.on_teardown_confirmed(now)
            }
            (PlatformEvent::Disconnected(_), ConnectionState::Disconnecting) => {
                self.enter_disconnected(GattError::NotReady, GattError::Cancelled)
            }
            (PlatformEvent::Disconnected(reason), ConnectionState::Ready) => {
                let reason = reason
                    .map(FailureReason::from)
                    .unwrap_or_else(|| FailureReason::transient("link lost"));
                log::warn!("Link to {} lost: {}", self.device_label(), reason);
                self.catalog.clear();
                self.transition(ConnectionState::Disconnecting);
                if self.auto_reconnect || reason.terminal {
                    return self.fail(reason, false, now);
                }
                let mut actions = vec![Action::AbandonOperations, Action::Teardown];
                actions.extend(
                    self.enter_disconnected(GattError::NotReady, GattError::ConnectionLost),
                );
                actions
            }
            (
                PlatformEvent::Disconnected(reason),
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::DiscoveringServices,
            ) => {
                let reason = reason
                    .map(FailureReason::from)
                    .unwrap_or_else(|| FailureReason::transient("disconnected during setup"));
                self.fail(reason, false, now)
            }
            (event, state) => {
                log::debug!("Ignoring {:?} in state {}", event, state);
                Vec::new()
            }
        }
    }

    /// A fatal error from the platform outside any operation.
    pub fn on_fatal(&mut self, err: PlatformError, now: Instant) -> Vec<Action> {
        if matches!(self.state, ConnectionState::Disconnected) {
            return Vec::new();
        }
        // The stack has already dropped every link; no disconnect follows.
        let mut reason = FailureReason::from(err);
        reason.terminal = true;
        self.fail(reason, false, now)
    }

    pub fn on_deadline(&mut self, now: Instant) -> Vec<Action> {
        let Some((at, kind)) = self.deadline else {
            return Vec::new();
        };
        if now < at {
            return Vec::new();
        }
        self.deadline = None;
        match kind {
            Deadline::Connect => {
                log::warn!("Connect deadline expired for {}", self.device_label());
                self.fail(FailureReason::timeout(), false, now)
            }
            Deadline::Discovery => {
                log::warn!("Discovery deadline expired for {}", self.device_label());
                self.fail(FailureReason::timeout(), true, now)
            }
            Deadline::Disconnect => {
                log::warn!("Platform never confirmed disconnect; forcing teardown");
                self.enter_disconnected(GattError::NotReady, GattError::Cancelled)
            }
            Deadline::Teardown { retry_in } => {
                // Still pending: a late `Disconnected` is swallowed until the
                // next link comes up.
                log::warn!("Platform never confirmed teardown; starting backoff anyway");
                self.deadline = Some((deadline_after(now, retry_in), Deadline::Reconnect));
                Vec::new()
            }
            Deadline::Reconnect => match self.device.clone() {
                Some(device) => {
                    log::info!(
                        "Reconnecting to {} (attempt {})",
                        device,
                        self.budget.attempts()
                    );
                    self.transition(ConnectionState::Connecting);
                    self.deadline = Some((deadline_after(now, self.timeouts.connect), Deadline::Connect));
                    vec![Action::Connect(device)]
                }
                None => self.enter_disconnected(GattError::NotReady, GattError::NotConnected),
            },
        }
    }

    /// `link_up` is true when the platform still holds a live link, so the
    /// teardown will be answered with a `Disconnected` for the old handle.
    fn fail(&mut self, reason: FailureReason, link_up: bool, now: Instant) -> Vec<Action> {
        self.catalog.clear();
        self.deadline = None;
        self.teardown_pending |= link_up;
        self.transition(ConnectionState::Failed(reason.clone()));
        let mut actions = vec![Action::Teardown, Action::AbandonOperations];

        if reason.terminal {
            log::warn!("Terminal failure for {}: {}", self.device_label(), reason);
            let err = reason.caller_error();
            actions.extend(self.enter_disconnected(err.clone(), err));
            return actions;
        }

        match self.budget.consume(&reason) {
            RetryDecision::After(delay) => {
                let attempt = self.budget.attempts();
                log::info!(
                    "Retry {} for {} in {:?} after: {}",
                    attempt,
                    self.device_label(),
                    delay,
                    reason
                );
                self.restoring = true;
                self.deadline = Some(if self.teardown_pending {
                    (
                        deadline_after(now, self.timeouts.disconnect),
                        Deadline::Teardown { retry_in: delay },
                    )
                } else {
                    (deadline_after(now, delay), Deadline::Reconnect)
                });
                self.status.publish(StatusKind::RetryScheduled { attempt, delay });
            }
            RetryDecision::No => {
                let attempts = self.budget.attempts();
                log::warn!(
                    "Giving up on {} after {} retries: {}",
                    self.device_label(),
                    attempts,
                    reason
                );
                self.status.publish(StatusKind::RetryExhausted { attempts });
                actions.extend(
                    self.enter_disconnected(GattError::RetryExhausted, GattError::RetryExhausted),
                );
            }
        }
        actions
    }

    fn on_teardown_confirmed(&mut self, now: Instant) -> Vec<Action> {
        self.teardown_pending = false;
        match self.deadline {
            Some((_, Deadline::Teardown { retry_in })) => {
                log::debug!("Old link torn down; reconnecting in {:?}", retry_in);
                self.deadline = Some((deadline_after(now, retry_in), Deadline::Reconnect));
            }
            _ => log::debug!("Ignoring disconnect of the previous link in state {}", self.state),
        }
        Vec::new()
    }

    fn enter_disconnected(&mut self, queue_err: GattError, connect_err: GattError) -> Vec<Action> {
        self.catalog.clear();
        self.deadline = None;
        self.restoring = false;
        self.device = None;
        self.transition(ConnectionState::Disconnected);
        vec![
            Action::DrainOperations(queue_err),
            Action::ResolveConnect(Err(connect_err)),
            Action::ResolveDisconnect,
        ]
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(&next) {
            log::warn!("Unexpected transition {} -> {}", self.state, next);
        }
        let from = std::mem::replace(&mut self.state, next);
        log::debug!("State {} -> {}", from, self.state);
        self.status.set_state(&self.state);
        self.status.publish(StatusKind::StateChanged {
            from,
            to: self.state.clone(),
        });
    }

    fn device_label(&self) -> String {
        self.device
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "<none>".into())
    }
}
