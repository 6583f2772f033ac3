// gatt-session - BLE GATT client session with serialized operation queuing

pub mod ble;
pub mod config;
pub mod error;
pub mod session;

pub use ble::gatt::{CharacteristicId, ServiceCatalog, ServiceId, WriteMode};
pub use ble::transport::{BleAddress, DeviceIdentity, EventSink, GattTransport, PlatformEvent};
pub use config::{ConfigError, SessionConfig};
pub use error::{GattError, PlatformError};
pub use session::operation::{OperationHandle, OperationId, OperationOptions};
pub use session::retry::{RetryDecision, RetryPolicy};
pub use session::state::{ConnectionState, FailureReason, StatusEvent, StatusKind};
pub use session::{GattSession, Notification, SessionSnapshot};
