//! GATT operations and their completion handles

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::Command;
use crate::ble::gatt::{CharacteristicId, ServiceCatalog, WriteMode};
use crate::error::GattError;

/// Unique, monotonically increasing id of an operation within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A queued unit of GATT work.
#[derive(Debug, Clone, PartialEq)]
pub enum GattOperation {
    Read {
        characteristic: CharacteristicId,
    },
    Write {
        characteristic: CharacteristicId,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    Subscribe {
        characteristic: CharacteristicId,
    },
    Unsubscribe {
        characteristic: CharacteristicId,
    },
    Discover,
}

impl GattOperation {
    /// The characteristic this operation targets, if any.
    pub fn characteristic(&self) -> Option<CharacteristicId> {
        match self {
            GattOperation::Read { characteristic }
            | GattOperation::Write { characteristic, .. }
            | GattOperation::Subscribe { characteristic }
            | GattOperation::Unsubscribe { characteristic } => Some(*characteristic),
            GattOperation::Discover => None,
        }
    }

    /// Whether the platform will deliver a completion event for this operation.
    pub fn expects_completion(&self) -> bool {
        match self {
            GattOperation::Write { mode, .. } => mode.expects_ack(),
            _ => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GattOperation::Read { .. } => "read",
            GattOperation::Write { .. } => "write",
            GattOperation::Subscribe { .. } => "subscribe",
            GattOperation::Unsubscribe { .. } => "unsubscribe",
            GattOperation::Discover => "discover",
        }
    }
}

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Value(Vec<u8>),
    Written,
    NotifyChanged { enabled: bool },
    Discovered(ServiceCatalog),
    /// Connection-level requests (connect, disconnect).
    Done,
}

pub type OperationResult = Result<OperationOutcome, GattError>;

/// Per-operation knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationOptions {
    /// Keep the operation queued across an automatic reconnect instead of
    /// failing it with `NotReady` when the link drops.
    pub retain_across_reconnect: bool,
    /// Overrides the session's operation timeout.
    pub timeout: Option<Duration>,
}

impl OperationOptions {
    pub fn retained() -> Self {
        Self {
            retain_across_reconnect: true,
            ..Self::default()
        }
    }
}

/// Resolves a caller's handle exactly once. Internal operations (automatic
/// resubscription) carry no caller and resolve into the void.
#[derive(Debug)]
pub(crate) struct Responder(Option<oneshot::Sender<OperationResult>>);

impl Responder {
    pub(crate) fn new(tx: oneshot::Sender<OperationResult>) -> Self {
        Self(Some(tx))
    }

    pub(crate) fn detached() -> Self {
        Self(None)
    }

    pub(crate) fn resolve(mut self, result: OperationResult) {
        if let Some(tx) = self.0.take() {
            // Receiver gone means the caller stopped waiting.
            let _ = tx.send(result);
        }
    }
}

/// An operation waiting in (or dispatched from) the queue.
#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub id: OperationId,
    pub op: GattOperation,
    pub options: OperationOptions,
    pub responder: Responder,
}

impl PendingOperation {
    pub(crate) fn resolve(self, result: OperationResult) {
        self.responder.resolve(result);
    }
}

/// Conversion from the untyped outcome into a handle's output type.
pub trait FromOutcome: Sized {
    fn from_outcome(outcome: OperationOutcome) -> Result<Self, GattError>;
}

impl FromOutcome for () {
    fn from_outcome(_: OperationOutcome) -> Result<Self, GattError> {
        Ok(())
    }
}

impl FromOutcome for Vec<u8> {
    fn from_outcome(outcome: OperationOutcome) -> Result<Self, GattError> {
        match outcome {
            OperationOutcome::Value(value) => Ok(value),
            other => Err(GattError::UnexpectedOutcome(format!("{:?}", other))),
        }
    }
}

impl FromOutcome for ServiceCatalog {
    fn from_outcome(outcome: OperationOutcome) -> Result<Self, GattError> {
        match outcome {
            OperationOutcome::Discovered(catalog) => Ok(catalog),
            other => Err(GattError::UnexpectedOutcome(format!("{:?}", other))),
        }
    }
}

/// Caller side of an operation. Resolves exactly once.
#[derive(Debug)]
pub struct OperationHandle<T> {
    id: OperationId,
    rx: oneshot::Receiver<OperationResult>,
    /// Used by `cancel`. Keeps the session task alive while the handle is.
    commands: mpsc::UnboundedSender<Command>,
    _output: PhantomData<fn() -> T>,
}

impl<T: FromOutcome> OperationHandle<T> {
    pub(crate) fn new(
        id: OperationId,
        rx: oneshot::Receiver<OperationResult>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            rx,
            commands,
            _output: PhantomData,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Ask the session to cancel this operation.
    ///
    /// A still-queued operation resolves with `Cancelled` and is never sent
    /// to the platform. A dispatched one resolves with `Cancelled` once the
    /// platform replies or its timeout fires.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel(self.id));
    }

    /// Wait for the operation to resolve.
    pub async fn wait(self) -> Result<T, GattError> {
        let outcome = self.rx.await.map_err(|_| GattError::SessionClosed)??;
        T::from_outcome(outcome)
    }
}
