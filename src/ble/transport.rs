//! Platform BLE stack abstraction
//!
//! The session never talks to a radio directly. It issues primitives through
//! [`GattTransport`]; the platform answers later by pushing [`PlatformEvent`]s
//! into an [`EventSink`], which feeds the session's single owner task.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::gatt::{CharacteristicId, ServiceCatalog, WriteMode};
use crate::error::PlatformError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address, most significant byte first.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl FromStr for BleAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(format!("expected 6 colon-separated octets in {:?}", s));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(format!("bad octet {:?} in {:?}", part, s));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| format!("bad octet {:?} in {:?}", part, s))?;
        }
        Ok(BleAddress::Real(bytes))
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            BleAddress::Simulated(id) => write!(f, "sim:{}", id),
        }
    }
}

/// The peripheral a session connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    address: BleAddress,
    label: String,
}

impl DeviceIdentity {
    pub fn new(address: BleAddress, label: impl Into<String>) -> Self {
        Self {
            address,
            label: label.into(),
        }
    }

    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.address)
    }
}

/// Everything the platform stack can report back to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Connected,
    ConnectFailed(PlatformError),
    ServicesDiscovered(ServiceCatalog),
    DiscoveryFailed(PlatformError),
    ReadCompleted {
        characteristic: CharacteristicId,
        result: Result<Vec<u8>, PlatformError>,
    },
    /// Never delivered for [`WriteMode::WithoutResponse`].
    WriteCompleted {
        characteristic: CharacteristicId,
        result: Result<(), PlatformError>,
    },
    NotifyCompleted {
        characteristic: CharacteristicId,
        enabled: bool,
        result: Result<(), PlatformError>,
    },
    /// The link went down, solicited or not. `None` means a clean local teardown.
    Disconnected(Option<PlatformError>),
    CharacteristicChanged {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    /// Unrecoverable stack error (adapter gone, device unknown). Never retried.
    Fatal(PlatformError),
}

/// Sending half handed to a transport. Cloneable, usable from any thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<PlatformEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event. Returns false once the owning session has shut down.
    pub fn emit(&self, event: PlatformEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Primitives of a platform BLE stack for one physical connection.
///
/// Each call only *issues* the primitive. `Ok(())` means the stack accepted
/// it; the outcome arrives later through the [`EventSink`] given to
/// [`GattTransport::attach`]. `Err` means the stack refused it outright and
/// no completion event will follow.
#[async_trait]
pub trait GattTransport: Send {
    /// Called once by the session before any primitive is issued.
    fn attach(&mut self, events: EventSink);

    async fn connect(&mut self, device: &DeviceIdentity) -> Result<(), PlatformError>;

    async fn discover_services(&mut self) -> Result<(), PlatformError>;

    async fn read_characteristic(
        &mut self,
        characteristic: CharacteristicId,
    ) -> Result<(), PlatformError>;

    async fn write_characteristic(
        &mut self,
        characteristic: CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), PlatformError>;

    async fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<(), PlatformError>;

    /// Tear down the connection handle. Safe to call when already down.
    async fn disconnect(&mut self) -> Result<(), PlatformError>;
}
