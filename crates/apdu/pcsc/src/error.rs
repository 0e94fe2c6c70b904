//! Error types for the PC/SC transport

use hwkey_apdu_core::TransportError;
use thiserror::Error;

/// PC/SC-specific errors
#[derive(Debug, Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// Reader name cannot be passed to PC/SC
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// Card was removed
    #[error("Card was removed")]
    CardRemoved,

    /// Watcher thread could not be started
    #[error("Failed to start reader watcher: {0}")]
    Watcher(String),
}

impl From<PcscError> for TransportError {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::CardRemoved | PcscError::Pcsc(pcsc::Error::RemovedCard) => {
                Self::Disconnected
            }
            PcscError::NoCard(reader) => Self::connection(format!("No card present in {reader}")),
            PcscError::ReaderNotFound(reader) => {
                Self::connection(format!("Reader not found: {reader}"))
            }
            PcscError::Pcsc(pcsc::Error::Timeout) => Self::Timeout,
            PcscError::Pcsc(pcsc::Error::Cancelled) => Self::Cancelled,
            other => Self::io(other.to_string()),
        }
    }
}
