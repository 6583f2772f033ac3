//! BLE platform layer
//!
//! GATT identifiers and the service catalog, the transport trait a platform
//! stack implements, and an in-process simulated peripheral for tests.

pub mod gatt;
pub mod simulated;
pub mod transport;
