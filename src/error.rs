use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the platform BLE stack when it refuses a primitive or
/// completes one unsuccessfully.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("platform error {code}: {message}")]
pub struct PlatformError {
    /// Stack-specific status code (GATT status, errno, HRESULT, ...).
    pub code: i32,
    pub message: String,
    /// Terminal errors (device unknown, authorization refused) are never retried.
    pub terminal: bool,
}

impl PlatformError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            terminal: false,
        }
    }

    pub fn terminal(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            terminal: true,
        }
    }
}

/// Errors surfaced to callers through operation handles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection not ready, operation dropped")]
    NotReady,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Connection lost while operation was in flight")]
    ConnectionLost,

    #[error("Platform rejected operation (code {0})")]
    PlatformRejected(i32),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Retry budget exhausted")]
    RetryExhausted,

    #[error("Session is busy with another device")]
    Busy,

    #[error("Session task has shut down")]
    SessionClosed,

    #[error("Unexpected operation outcome: {0}")]
    UnexpectedOutcome(String),
}

impl From<PlatformError> for GattError {
    fn from(err: PlatformError) -> Self {
        GattError::PlatformRejected(err.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gatt_error_display() {
        assert_eq!(GattError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            GattError::PlatformRejected(133).to_string(),
            "Platform rejected operation (code 133)"
        );
        assert_eq!(
            GattError::CharacteristicNotFound("0000ffe1".into()).to_string(),
            "Characteristic not found: 0000ffe1"
        );
    }

    #[test]
    fn test_platform_error_converts_to_rejected() {
        let err = PlatformError::terminal(8, "insufficient authorization");
        assert!(err.terminal);
        assert_eq!(err.to_string(), "platform error 8: insufficient authorization");
        assert_eq!(GattError::from(err), GattError::PlatformRejected(8));
    }
}
