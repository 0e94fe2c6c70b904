//! Error type for applet operations
//!
//! Non-success status words are mapped to named variants by each applet, so
//! callers can match on the condition instead of inspecting raw status words.

use hwkey_apdu_core::{StatusWord, TransportError};
use iso7816_tlv::TlvError;

/// Result type for applet operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for applet operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// PIN verification failed
    #[error("Wrong PIN, {retries_left} attempts left")]
    WrongPin {
        /// Remaining attempts before the PIN is blocked
        retries_left: u8,
    },

    /// The PIN is blocked
    #[error("Security key is locked")]
    Locked,

    /// The PIN was rejected for its length
    #[error("PIN too short")]
    PinTooShort,

    /// The applet or data object does not exist
    #[error("File not found")]
    FileNotFound,

    /// The class byte is not supported
    #[error("Class not supported")]
    ClassNotSupported,

    /// The instruction is not supported
    #[error("Instruction not supported")]
    InstructionNotSupported,

    /// Conditions of use not satisfied
    #[error("Conditions of use not satisfied")]
    ConditionsNotSatisfied,

    /// The selected file is in termination state
    #[error("Selected file in termination state")]
    FileInTerminationState,

    /// Any other status word
    #[error("Unknown status word: {0}")]
    Unknown(StatusWord),

    /// None of the candidate applets could be selected
    #[error("No {applet} applet found on security key")]
    SelectApplet {
        /// Applet name
        applet: &'static str,
    },

    /// The applet is terminated and could not be reactivated
    #[error("Security key has been terminated")]
    SecurityKeyTerminated,

    /// The applet reported a version this crate does not speak
    #[error("Unsupported applet version: {0}")]
    UnsupportedVersion(String),

    /// The user has to touch the security key
    #[error("User presence required")]
    PresenceRequired,

    /// The key handle was not created by this security key
    #[error("Wrong key handle")]
    WrongKeyHandle,

    /// The request had the wrong length
    #[error("Wrong request length")]
    WrongRequestLength,

    /// The applet connection is not established
    #[error("Not connected")]
    NotConnected,

    /// Malformed response data
    #[error("Invalid data: {0}")]
    InvalidData(&'static str),

    /// Malformed TLV data
    #[error("TlvError: {0}")]
    TlvError(TlvError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Failure in the APDU request path
    #[error(transparent)]
    Apdu(#[from] hwkey_apdu_core::Error),
}

impl From<TlvError> for Error {
    fn from(error: TlvError) -> Self {
        Self::TlvError(error)
    }
}

impl Error {
    /// The transport error at the root of this error, if any
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Apdu(e) => e.transport_error(),
            _ => None,
        }
    }

    /// Whether the security key went away
    pub fn is_disconnected(&self) -> bool {
        self.transport_error()
            .is_some_and(|e| matches!(e, TransportError::Disconnected | TransportError::Released))
    }
}
