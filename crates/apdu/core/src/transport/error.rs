//! Error types specific to transports

use thiserror::Error;

/// Transport error type
///
/// Every variant is recoverable by releasing the transport and reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection error
    #[error("Failed to connect to device: {0}")]
    Connection(String),

    /// Low-level read or write failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Cancelled operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The device went away while in use
    #[error("Security key disconnected")]
    Disconnected,

    /// The transport was released by its owner
    #[error("Transport released")]
    Released,

    /// Bytes received from the device could not be decoded
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The transport cannot perform this operation
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Secure messaging could not protect or verify a message
    #[error("Secure messaging failed: {0}")]
    SecureMessaging(String),
}

impl TransportError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io(message.into())
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection(message.into())
    }

    /// Create a new malformed response error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::Malformed(message.into())
    }

    /// Whether the device is gone for good
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Released)
    }
}
