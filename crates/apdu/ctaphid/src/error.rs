//! CTAPHID error types

use hwkey_apdu_core::TransportError;
use thiserror::Error;

/// Errors raised by the CTAPHID framing and link layers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CtapHidError {
    /// A packet arrived on a different channel than the one in use
    #[error("Channel changed during transaction, {expected:#010x} to {actual:#010x}")]
    ChangedChannel {
        /// Channel we expected
        expected: u32,
        /// Channel found in the packet
        actual: u32,
    },

    /// The response answers a different command
    #[error("Command mismatch: expected {expected:#04x}, got {actual:#04x}")]
    CommandMismatch {
        /// Command we expected
        expected: u8,
        /// Command found in the packet
        actual: u8,
    },

    /// A continuation packet arrived out of order
    #[error("Out of sequence packet: sequence {actual}, expected {expected}")]
    SequenceMismatch {
        /// Sequence number we expected
        expected: u8,
        /// Sequence number found in the packet
        actual: u8,
    },

    /// The frame is shorter or longer than its header announces
    #[error("Payload not finished ({actual}/{expected} bytes)")]
    BadFrameLength {
        /// Bytes received
        actual: usize,
        /// Bytes announced by the header
        expected: usize,
    },

    /// The payload exceeds what one message can carry
    #[error("Payload too large, CTAPHID maximum is {max} bytes (got {len})")]
    PayloadTooLarge {
        /// Requested payload length
        len: usize,
        /// Protocol maximum
        max: usize,
    },

    /// The command byte lacks the initialization bit
    #[error("Invalid command {0:#04x} (expected bit 7 to be set)")]
    InvalidCommand(u8),

    /// The sequence number has the initialization bit set
    #[error("Invalid sequence identifier {0:#04x} (expected bit 7 to be unset)")]
    InvalidSequence(u8),

    /// The INIT response is malformed or answers another nonce
    #[error("Invalid channel initialization")]
    InvalidInitResponse,

    /// The device answered with a CTAPHID error frame
    #[error("Device reported CTAPHID error {0:#04x}")]
    Device(u8),

    /// The operation did not finish before its deadline
    #[error("Timed out transmitting data")]
    Timeout,

    /// The operation was cancelled between two packets
    #[error("Operation interrupted")]
    Interrupted,

    /// The underlying HID link failed
    #[error("HID link error: {0}")]
    Link(String),
}

impl CtapHidError {
    /// Create a new link error
    pub fn link<S: Into<String>>(message: S) -> Self {
        Self::Link(message.into())
    }
}

impl From<CtapHidError> for TransportError {
    fn from(error: CtapHidError) -> Self {
        match error {
            CtapHidError::Timeout => Self::Timeout,
            CtapHidError::Interrupted => Self::Cancelled,
            CtapHidError::Link(message) => Self::Io(message),
            other => Self::Malformed(other.to_string()),
        }
    }
}
