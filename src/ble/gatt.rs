//! GATT identifiers and the discovered service catalog
//!
//! Services and characteristics are addressed by 128-bit UUIDs. Assigned
//! 16-bit numbers (e.g. `ffe0`) expand onto the Bluetooth base UUID.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `0000xxxx-0000-1000-8000-00805f9b34fb`, with the short id in bits 96..112.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

fn expand_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

fn parse_gatt_uuid(s: &str) -> Result<Uuid, uuid::Error> {
    let trimmed = s.trim();
    let hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if hex.len() == 4 {
        if let Ok(short) = u16::from_str_radix(hex, 16) {
            return Ok(expand_short(short));
        }
    }
    Uuid::parse_str(trimmed)
}

macro_rules! gatt_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Expand a 16-bit assigned number using the Bluetooth base UUID.
            pub fn from_short(short: u16) -> Self {
                Self(expand_short(short))
            }

            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_gatt_uuid(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

gatt_id!(
    /// Identifier of a primary GATT service.
    ServiceId
);

gatt_id!(
    /// Identifier of a GATT characteristic.
    CharacteristicId
);

/// Acknowledgement semantics of a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Write request; the peripheral acknowledges.
    WithResponse,
    /// Write command; no acknowledgement is ever delivered.
    WithoutResponse,
    /// Authenticated write; acknowledged like `WithResponse`.
    Signed,
}

impl WriteMode {
    pub fn expects_ack(&self) -> bool {
        !matches!(self, WriteMode::WithoutResponse)
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "with-response" | "with_response" | "response" => Ok(WriteMode::WithResponse),
            "without-response" | "without_response" | "command" => Ok(WriteMode::WithoutResponse),
            "signed" => Ok(WriteMode::Signed),
            other => Err(format!("unknown write mode: {}", other)),
        }
    }
}

/// Services and characteristics found by one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCatalog {
    services: BTreeMap<ServiceId, BTreeSet<CharacteristicId>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, handy when describing a peripheral.
    pub fn with_service(
        mut self,
        service: ServiceId,
        characteristics: impl IntoIterator<Item = CharacteristicId>,
    ) -> Self {
        self.insert_service(service, characteristics);
        self
    }

    pub fn insert_service(
        &mut self,
        service: ServiceId,
        characteristics: impl IntoIterator<Item = CharacteristicId>,
    ) {
        self.services
            .entry(service)
            .or_default()
            .extend(characteristics);
    }

    pub fn contains(&self, characteristic: &CharacteristicId) -> bool {
        self.services.values().any(|chars| chars.contains(characteristic))
    }

    /// The service that exposes `characteristic`, if any.
    pub fn service_of(&self, characteristic: &CharacteristicId) -> Option<ServiceId> {
        self.services
            .iter()
            .find(|(_, chars)| chars.contains(characteristic))
            .map(|(service, _)| *service)
    }

    pub fn characteristics(&self, service: &ServiceId) -> Option<&BTreeSet<CharacteristicId>> {
        self.services.get(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceId> {
        self.services.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }
}
