//! Serialized GATT operation queue
//!
//! GATT transports allow a single outstanding request per connection. The
//! queue holds pending operations in FIFO order plus one in-flight slot, and
//! only issues the next primitive once the slot is clear.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::operation::{
    GattOperation, OperationId, OperationOutcome, OperationResult, PendingOperation,
};
use super::state::{ConnectionState, StatusKind, StatusPublisher};
use super::deadline_after;
use crate::ble::gatt::ServiceCatalog;
use crate::ble::transport::{GattTransport, PlatformEvent};
use crate::error::{GattError, PlatformError};

#[derive(Debug)]
struct InFlight {
    pending: PendingOperation,
    deadline: Instant,
    cancel_requested: bool,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue and resolved with `Cancelled`.
    Removed,
    /// In flight; resolves with `Cancelled` when the platform replies.
    Requested,
    /// Not queued here (already resolved, or never existed).
    Unknown,
}

/// An operation that left the in-flight slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub id: OperationId,
    pub op: GattOperation,
    /// Whether the platform carried the operation out, regardless of what
    /// the caller was told (a cancelled subscribe may still have succeeded).
    pub applied: bool,
}

#[derive(Debug)]
pub struct OperationQueue {
    pending: VecDeque<PendingOperation>,
    in_flight: Option<InFlight>,
    default_timeout: Duration,
}

impl OperationQueue {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            default_timeout,
        }
    }

    /// Operations waiting behind the in-flight slot.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is queued and nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    pub fn in_flight(&self) -> Option<OperationId> {
        self.in_flight.as_ref().map(|f| f.pending.id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    /// Append an operation. Never blocks; dispatch is a separate step.
    pub(crate) fn enqueue(&mut self, pending: PendingOperation) {
        log::debug!("Queued {} {}", pending.op.name(), pending.id);
        self.pending.push_back(pending);
    }

    /// Put an operation at the head of the queue.
    pub(crate) fn enqueue_front(&mut self, pending: PendingOperation) {
        log::debug!("Queued {} {} at head", pending.op.name(), pending.id);
        self.pending.push_front(pending);
    }

    /// Dispatch queued operations until one is outstanding or the queue runs dry.
    ///
    /// Operations whose characteristic is missing from `catalog` resolve with
    /// `CharacteristicNotFound` without touching the platform. Writes without
    /// response resolve as soon as the platform accepts them.
    pub async fn try_dispatch_next(
        &mut self,
        state: &ConnectionState,
        catalog: &ServiceCatalog,
        transport: &mut dyn GattTransport,
        status: &StatusPublisher,
        now: Instant,
    ) {
        while self.in_flight.is_none() && state.is_ready() {
            let Some(pending) = self.pending.pop_front() else {
                break;
            };

            if let Some(characteristic) = pending.op.characteristic() {
                if !catalog.contains(&characteristic) {
                    log::debug!("{} targets unknown characteristic {}", pending.id, characteristic);
                    let id = pending.id;
                    pending.resolve(Err(GattError::CharacteristicNotFound(
                        characteristic.to_string(),
                    )));
                    status.publish(StatusKind::OperationCompleted { id, success: false });
                    continue;
                }
            }

            let id = pending.id;
            let op = pending.op.clone();
            let timeout = pending.options.timeout.unwrap_or(self.default_timeout);
            self.in_flight = Some(InFlight {
                pending,
                deadline: deadline_after(now, timeout),
                cancel_requested: false,
            });

            log::debug!("Dispatching {} {}", op.name(), id);
            status.publish(StatusKind::OperationDispatched {
                id,
                operation: op.name().to_string(),
            });

            match issue(transport, &op).await {
                Err(err) => {
                    log::warn!("Platform refused {} {}: {}", op.name(), id, err);
                    self.resolve_in_flight(Err(err.into()), status);
                }
                Ok(()) if !op.expects_completion() => {
                    self.resolve_in_flight(Ok(OperationOutcome::Written), status);
                }
                Ok(()) => {}
            }
        }
    }

    /// Match a platform completion event against the in-flight operation.
    pub fn completion_for(&self, event: &PlatformEvent) -> Option<(OperationId, OperationResult)> {
        let in_flight = self.in_flight.as_ref()?;
        let id = in_flight.pending.id;
        let result = match (&in_flight.pending.op, event) {
            (
                GattOperation::Read { characteristic },
                PlatformEvent::ReadCompleted {
                    characteristic: done,
                    result,
                },
            ) if characteristic == done => result
                .clone()
                .map(OperationOutcome::Value)
                .map_err(GattError::from),
            (
                GattOperation::Write { characteristic, .. },
                PlatformEvent::WriteCompleted {
                    characteristic: done,
                    result,
                },
            ) if characteristic == done => done_or_rejected(result, OperationOutcome::Written),
            (
                GattOperation::Subscribe { characteristic },
                PlatformEvent::NotifyCompleted {
                    characteristic: done,
                    enabled: true,
                    result,
                },
            )
            | (
                GattOperation::Unsubscribe { characteristic },
                PlatformEvent::NotifyCompleted {
                    characteristic: done,
                    enabled: false,
                    result,
                },
            ) if characteristic == done => {
                let enabled = matches!(in_flight.pending.op, GattOperation::Subscribe { .. });
                done_or_rejected(result, OperationOutcome::NotifyChanged { enabled })
            }
            (GattOperation::Discover, PlatformEvent::ServicesDiscovered(catalog)) => {
                Ok(OperationOutcome::Discovered(catalog.clone()))
            }
            (GattOperation::Discover, PlatformEvent::DiscoveryFailed(err)) => {
                Err(GattError::from(err.clone()))
            }
            _ => return None,
        };
        Some((id, result))
    }

    /// Resolve the in-flight operation if `id` names it, clearing the slot.
    pub fn on_operation_completed(
        &mut self,
        id: OperationId,
        result: OperationResult,
        status: &StatusPublisher,
    ) -> Option<Completed> {
        if self.in_flight() != Some(id) {
            log::warn!("Completion for {} does not match the in-flight operation", id);
            return None;
        }
        self.resolve_in_flight(result, status)
    }

    /// Cancel an operation by id.
    pub fn cancel(&mut self, id: OperationId) -> CancelOutcome {
        if let Some(pos) = self.pending.iter().position(|p| p.id == id) {
            if let Some(pending) = self.pending.remove(pos) {
                log::debug!("Cancelled queued {} {}", pending.op.name(), id);
                pending.resolve(Err(GattError::Cancelled));
            }
            return CancelOutcome::Removed;
        }
        match self.in_flight.as_mut() {
            Some(in_flight) if in_flight.pending.id == id => {
                in_flight.cancel_requested = true;
                CancelOutcome::Requested
            }
            _ => CancelOutcome::Unknown,
        }
    }

    /// Fail the in-flight operation if its deadline has passed.
    pub fn expire(&mut self, now: Instant, status: &StatusPublisher) -> Option<Completed> {
        match &self.in_flight {
            Some(in_flight) if in_flight.deadline <= now => {
                log::warn!(
                    "{} {} timed out",
                    in_flight.pending.op.name(),
                    in_flight.pending.id
                );
                let mut done = self.resolve_in_flight(Err(GattError::Timeout), status)?;
                done.applied = false;
                Some(done)
            }
            _ => None,
        }
    }

    /// The connection left `Ready`: the in-flight operation fails with
    /// `ConnectionLost`, queued ones with `NotReady` unless they asked to be
    /// retained across a reconnect.
    pub fn abandon(&mut self, status: &StatusPublisher) {
        self.fail_in_flight(status);
        let mut retained = VecDeque::new();
        for pending in self.pending.drain(..) {
            if pending.options.retain_across_reconnect {
                retained.push_back(pending);
            } else {
                let id = pending.id;
                pending.resolve(Err(GattError::NotReady));
                status.publish(StatusKind::OperationCompleted { id, success: false });
            }
        }
        if !retained.is_empty() {
            log::info!("Retaining {} operations across reconnect", retained.len());
        }
        self.pending = retained;
    }

    /// Fail everything, retained operations included.
    pub fn drain(&mut self, err: GattError, status: &StatusPublisher) {
        self.fail_in_flight(status);
        for pending in self.pending.drain(..) {
            let id = pending.id;
            pending.resolve(Err(err.clone()));
            status.publish(StatusKind::OperationCompleted { id, success: false });
        }
    }

    fn fail_in_flight(&mut self, status: &StatusPublisher) {
        if self.in_flight.is_some() {
            // Cancel requests are honored here too: the platform will never reply.
            let cancelled = self.in_flight.as_ref().map_or(false, |f| f.cancel_requested);
            let err = if cancelled {
                GattError::Cancelled
            } else {
                GattError::ConnectionLost
            };
            self.resolve_in_flight(Err(err), status);
        }
    }

    fn resolve_in_flight(
        &mut self,
        result: OperationResult,
        status: &StatusPublisher,
    ) -> Option<Completed> {
        let InFlight {
            pending,
            cancel_requested,
            ..
        } = self.in_flight.take()?;
        let id = pending.id;
        let op = pending.op.clone();
        let applied = result.is_ok();
        let result = if cancel_requested {
            Err(GattError::Cancelled)
        } else {
            result
        };
        status.publish(StatusKind::OperationCompleted {
            id,
            success: result.is_ok(),
        });
        pending.resolve(result);
        Some(Completed { id, op, applied })
    }
}

fn done_or_rejected(
    result: &Result<(), PlatformError>,
    outcome: OperationOutcome,
) -> OperationResult {
    match result {
        Ok(()) => Ok(outcome),
        Err(err) => Err(GattError::from(err.clone())),
    }
}

async fn issue(transport: &mut dyn GattTransport, op: &GattOperation) -> Result<(), PlatformError> {
    match op {
        GattOperation::Read { characteristic } => {
            transport.read_characteristic(*characteristic).await
        }
        GattOperation::Write {
            characteristic,
            payload,
            mode,
        } => {
            transport
                .write_characteristic(*characteristic, payload, *mode)
                .await
        }
        GattOperation::Subscribe { characteristic } => {
            transport.set_notify(*characteristic, true).await
        }
        GattOperation::Unsubscribe { characteristic } => {
            transport.set_notify(*characteristic, false).await
        }
        GattOperation::Discover => transport.discover_services().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{CharacteristicId, ServiceId, WriteMode};
    use crate::ble::transport::{DeviceIdentity, EventSink};
    use crate::session::operation::{OperationOptions, Responder};
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    /// Records issued primitives; refuses those listed in `refuse`.
    #[derive(Default)]
    struct RecordingTransport {
        issued: Vec<String>,
        refuse: Option<CharacteristicId>,
    }

    impl RecordingTransport {
        fn check(&self, characteristic: CharacteristicId) -> Result<(), PlatformError> {
            if self.refuse == Some(characteristic) {
                return Err(PlatformError::new(3, "write not permitted"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl GattTransport for RecordingTransport {
        fn attach(&mut self, _events: EventSink) {}

        async fn connect(&mut self, _device: &DeviceIdentity) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn discover_services(&mut self) -> Result<(), PlatformError> {
            self.issued.push("discover".into());
            Ok(())
        }

        async fn read_characteristic(
            &mut self,
            characteristic: CharacteristicId,
        ) -> Result<(), PlatformError> {
            self.issued.push(format!("read {}", characteristic));
            self.check(characteristic)
        }

        async fn write_characteristic(
            &mut self,
            characteristic: CharacteristicId,
            payload: &[u8],
            _mode: WriteMode,
        ) -> Result<(), PlatformError> {
            self.issued.push(format!("write {:?}", payload));
            self.check(characteristic)
        }

        async fn set_notify(
            &mut self,
            characteristic: CharacteristicId,
            enabled: bool,
        ) -> Result<(), PlatformError> {
            self.issued.push(format!("notify {}", enabled));
            self.check(characteristic)
        }

        async fn disconnect(&mut self) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn char_x() -> CharacteristicId {
        CharacteristicId::from_short(0xffe1)
    }

    fn catalog() -> ServiceCatalog {
        ServiceCatalog::new().with_service(ServiceId::from_short(0xffe0), [char_x()])
    }

    fn pending(
        id: u64,
        op: GattOperation,
        options: OperationOptions,
    ) -> (PendingOperation, oneshot::Receiver<OperationResult>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingOperation {
            id: OperationId(id),
            op,
            options,
            responder: Responder::new(tx),
        };
        (pending, rx)
    }

    fn write(id: u64, byte: u8, mode: WriteMode) -> (PendingOperation, oneshot::Receiver<OperationResult>) {
        pending(
            id,
            GattOperation::Write {
                characteristic: char_x(),
                payload: vec![byte],
                mode,
            },
            OperationOptions::default(),
        )
    }

    fn ack(byte_id: u64) -> (OperationId, OperationResult) {
        (OperationId(byte_id), Ok(OperationOutcome::Written))
    }

    #[tokio::test]
    async fn test_single_in_flight_and_fifo() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let now = Instant::now();

        let mut receivers = Vec::new();
        for i in 1..=3 {
            let (p, rx) = write(i, i as u8, WriteMode::WithResponse);
            queue.enqueue(p);
            receivers.push(rx);
        }

        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, now)
            .await;
        assert_eq!(transport.issued, vec!["write [1]"]);
        assert_eq!(queue.in_flight(), Some(OperationId(1)));
        assert_eq!(queue.len(), 2);

        // A second dispatch attempt issues nothing while the slot is occupied.
        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, now)
            .await;
        assert_eq!(transport.issued.len(), 1);

        for expected in 1..=3u64 {
            let (id, result) = ack(expected);
            let done = queue.on_operation_completed(id, result, &status).unwrap();
            assert!(done.applied);
            queue
                .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, now)
                .await;
        }
        assert_eq!(transport.issued, vec!["write [1]", "write [2]", "write [3]"]);
        assert!(queue.is_empty());

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Ok(OperationOutcome::Written));
        }
    }

    #[tokio::test]
    async fn test_no_dispatch_unless_ready() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let (p, _rx) = write(1, 0, WriteMode::WithResponse);
        queue.enqueue(p);

        queue
            .try_dispatch_next(
                &ConnectionState::DiscoveringServices,
                &catalog(),
                &mut transport,
                &status,
                Instant::now(),
            )
            .await;
        assert!(transport.issued.is_empty());
        assert_eq!(queue.in_flight(), None);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_write_without_response_resolves_on_submission() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let (p1, rx1) = write(1, 0xA, WriteMode::WithoutResponse);
        let (p2, rx2) = write(2, 0xB, WriteMode::Signed);
        queue.enqueue(p1);
        queue.enqueue(p2);

        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, Instant::now())
            .await;

        // The command went out and resolved; the signed write now occupies the slot.
        assert_eq!(rx1.await.unwrap(), Ok(OperationOutcome::Written));
        assert_eq!(queue.in_flight(), Some(OperationId(2)));
        assert_eq!(transport.issued, vec!["write [10]", "write [11]"]);

        let mut rx2 = rx2;
        assert!(rx2.try_recv().is_err(), "signed write must wait for the ack");
    }

    #[tokio::test]
    async fn test_unknown_characteristic_never_dispatched() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let char_y = CharacteristicId::from_short(0x2a37);
        let (p, rx) = pending(
            1,
            GattOperation::Read { characteristic: char_y },
            OperationOptions::default(),
        );
        queue.enqueue(p);

        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, Instant::now())
            .await;
        assert!(transport.issued.is_empty());
        assert!(matches!(
            rx.await.unwrap(),
            Err(GattError::CharacteristicNotFound(_))
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_platform_refusal_moves_on() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport {
            refuse: Some(char_x()),
            ..Default::default()
        };
        let status = StatusPublisher::new(16);
        let (p, rx) = write(1, 1, WriteMode::WithResponse);
        queue.enqueue(p);

        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, Instant::now())
            .await;
        assert_eq!(rx.await.unwrap(), Err(GattError::PlatformRejected(3)));
        assert_eq!(queue.in_flight(), None);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_in_flight() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let (p1, rx1) = write(1, 1, WriteMode::WithResponse);
        let (p2, rx2) = write(2, 2, WriteMode::WithResponse);
        queue.enqueue(p1);
        queue.enqueue(p2);
        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, Instant::now())
            .await;

        assert_eq!(queue.cancel(OperationId(2)), CancelOutcome::Removed);
        assert_eq!(rx2.await.unwrap(), Err(GattError::Cancelled));

        assert_eq!(queue.cancel(OperationId(1)), CancelOutcome::Requested);
        assert_eq!(queue.in_flight(), Some(OperationId(1)));
        let done = queue
            .on_operation_completed(OperationId(1), Ok(OperationOutcome::Written), &status)
            .unwrap();
        assert!(done.applied);
        assert_eq!(rx1.await.unwrap(), Err(GattError::Cancelled));

        assert_eq!(queue.cancel(OperationId(9)), CancelOutcome::Unknown);
        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, Instant::now())
            .await;
        assert_eq!(transport.issued, vec!["write [1]"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_timeout() {
        let mut queue = OperationQueue::new(Duration::from_millis(500));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let now = Instant::now();
        let (p, rx) = write(1, 1, WriteMode::WithResponse);
        queue.enqueue(p);
        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, now)
            .await;
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(500)));

        assert!(queue.expire(now + Duration::from_millis(499), &status).is_none());
        let done = queue.expire(now + Duration::from_millis(500), &status).unwrap();
        assert!(!done.applied);
        assert_eq!(rx.await.unwrap(), Err(GattError::Timeout));
        assert_eq!(queue.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_is_clamped() {
        let mut queue = OperationQueue::new(Duration::from_millis(500));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let now = Instant::now();
        let (p, _rx) = pending(
            1,
            GattOperation::Read { characteristic: char_x() },
            OperationOptions {
                timeout: Some(Duration::MAX),
                ..OperationOptions::default()
            },
        );
        queue.enqueue(p);
        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, now)
            .await;

        let deadline = queue.next_deadline().unwrap();
        assert!(deadline > now + Duration::from_secs(60 * 60 * 24));
        assert!(queue.expire(now + Duration::from_secs(60 * 60 * 24), &status).is_none());
        assert_eq!(queue.in_flight(), Some(OperationId(1)));
    }

    #[tokio::test]
    async fn test_abandon_respects_retention() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let (p1, rx1) = write(1, 1, WriteMode::WithResponse);
        let (p2, rx2) = write(2, 2, WriteMode::WithResponse);
        let (p3, mut rx3) = pending(
            3,
            GattOperation::Read { characteristic: char_x() },
            OperationOptions::retained(),
        );
        queue.enqueue(p1);
        queue.enqueue(p2);
        queue.enqueue(p3);
        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, Instant::now())
            .await;

        queue.abandon(&status);
        assert_eq!(rx1.await.unwrap(), Err(GattError::ConnectionLost));
        assert_eq!(rx2.await.unwrap(), Err(GattError::NotReady));
        assert!(rx3.try_recv().is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), None);

        queue.drain(GattError::RetryExhausted, &status);
        assert_eq!(rx3.await.unwrap(), Err(GattError::RetryExhausted));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_completion_matching() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let (p, _rx) = pending(
            1,
            GattOperation::Read { characteristic: char_x() },
            OperationOptions::default(),
        );
        queue.enqueue(p);
        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, Instant::now())
            .await;

        let wrong_char = PlatformEvent::ReadCompleted {
            characteristic: CharacteristicId::from_short(0x0001),
            result: Ok(vec![0]),
        };
        assert!(queue.completion_for(&wrong_char).is_none());

        let wrong_kind = PlatformEvent::WriteCompleted {
            characteristic: char_x(),
            result: Ok(()),
        };
        assert!(queue.completion_for(&wrong_kind).is_none());

        let value = PlatformEvent::ReadCompleted {
            characteristic: char_x(),
            result: Ok(vec![0x01]),
        };
        assert_eq!(
            queue.completion_for(&value),
            Some((OperationId(1), Ok(OperationOutcome::Value(vec![0x01]))))
        );

        let failed = PlatformEvent::ReadCompleted {
            characteristic: char_x(),
            result: Err(PlatformError::new(2, "read not permitted")),
        };
        assert_eq!(
            queue.completion_for(&failed),
            Some((OperationId(1), Err(GattError::PlatformRejected(2))))
        );
    }

    #[tokio::test]
    async fn test_notify_completion_distinguishes_direction() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let mut transport = RecordingTransport::default();
        let status = StatusPublisher::new(16);
        let (p, _rx) = pending(
            1,
            GattOperation::Subscribe { characteristic: char_x() },
            OperationOptions::default(),
        );
        queue.enqueue(p);
        queue
            .try_dispatch_next(&ConnectionState::Ready, &catalog(), &mut transport, &status, Instant::now())
            .await;

        let disabled = PlatformEvent::NotifyCompleted {
            characteristic: char_x(),
            enabled: false,
            result: Ok(()),
        };
        assert!(queue.completion_for(&disabled).is_none());

        let enabled = PlatformEvent::NotifyCompleted {
            characteristic: char_x(),
            enabled: true,
            result: Ok(()),
        };
        assert_eq!(
            queue.completion_for(&enabled),
            Some((
                OperationId(1),
                Ok(OperationOutcome::NotifyChanged { enabled: true })
            ))
        );
    }

    #[tokio::test]
    async fn test_stale_completion_ignored() {
        let mut queue = OperationQueue::new(Duration::from_secs(5));
        let status = StatusPublisher::new(16);
        assert!(queue
            .on_operation_completed(OperationId(4), Ok(OperationOutcome::Written), &status)
            .is_none());
    }
}
