//! Transport traits for APDU communication with security keys
//!
//! This module provides abstractions for exchanging APDUs with a physical
//! device through different link types (USB CCID, USB CTAPHID, NFC).

pub mod error;
mod release;

use std::{fmt, sync::Arc};

use derive_more::Display;
pub use error::TransportError;
pub use release::ReleaseState;
use tracing::{debug, trace};

use crate::{Command, Response};

/// Physical link a transport talks over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TransportKind {
    /// USB smart card reader class (CCID)
    #[display("USB CCID")]
    UsbCcid,
    /// USB HID with the CTAPHID framing
    #[display("USB CTAPHID")]
    UsbCtapHid,
    /// Contactless (ISO 14443-4)
    #[display("NFC")]
    Nfc,
}

impl TransportKind {
    /// All transport kinds
    pub const ALL: [Self; 3] = [Self::UsbCcid, Self::UsbCtapHid, Self::Nfc];

    /// Whether the transport is a USB link
    pub const fn is_usb(self) -> bool {
        matches!(self, Self::UsbCcid | Self::UsbCtapHid)
    }

    /// Whether the transport is a contactless link
    pub const fn is_nfc(self) -> bool {
        matches!(self, Self::Nfc)
    }
}

/// Callback invoked once when a transport is released
pub type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

/// A transport shared between the dispatcher and the security key it ends up in
pub type SharedTransport = Arc<dyn Transport>;

/// Trait for security key transports
///
/// A transport is responsible for moving one command to the device and one
/// response back. It has no knowledge of chaining, continuation or secure
/// messaging. All methods take `&self` so a transport can be shared between
/// the thread that discovered it and the one that ends up using it.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send a command to the device and return its response
    fn transceive(&self, command: &Command) -> Result<Response, TransportError> {
        trace!(kind = %self.kind(), command = %command, "Transmitting command");
        let result = self.do_transceive(command);
        match &result {
            Ok(response) => {
                trace!(
                    response = ?hex::encode(response.data()),
                    status = %response.status(),
                    "Received response"
                );
            }
            Err(e) => {
                debug!(error = ?e, "Transport error during transmission");
            }
        }
        result
    }

    /// Internal implementation of transceive
    /// This is the method that concrete implementations should override
    fn do_transceive(&self, command: &Command) -> Result<Response, TransportError>;

    /// Open the link to the device
    fn connect(&self) -> Result<(), TransportError>;

    /// Release the link; further transceives fail
    fn release(&self);

    /// Check if the transport is connected and not released
    fn is_connected(&self) -> bool;

    /// Check if the transport was released
    fn is_released(&self) -> bool;

    /// Check that the device still answers
    fn ping(&self) -> bool;

    /// Physical link kind
    fn kind(&self) -> TransportKind;

    /// Whether the link survives between operations without rediscovery
    fn is_persistent_connection_allowed(&self) -> bool;

    /// Whether the link carries extended length APDUs natively
    fn is_extended_length_supported(&self) -> bool;

    /// Install the callback fired on the first release
    fn set_release_callback(&self, callback: ReleaseCallback);
}
