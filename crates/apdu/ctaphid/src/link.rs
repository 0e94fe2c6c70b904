//! Abstract HID link to one authenticator
//!
//! Platform code implements [`HidLink`] for its USB stack. Every blocking
//! exchange opens a [`LinkRequest`]; dropping the request gives it back to the
//! platform, which is how a cancelled or timed-out exchange releases it.

use std::{fmt, time::Duration};

use crate::{constants::HID_PACKET_SIZE, error::CtapHidError};

/// One HID report
pub type Packet = [u8; HID_PACKET_SIZE];

/// An open request on the HID interrupt endpoints
///
/// Implementations release the underlying platform request in `Drop`.
pub trait LinkRequest: Send {
    /// Write one packet, blocking until the device acknowledged it
    fn write_packet(&mut self, packet: &Packet) -> Result<(), CtapHidError>;

    /// Wait up to `poll` for one packet; `None` means nothing arrived yet
    fn read_packet(&mut self, poll: Duration) -> Result<Option<Packet>, CtapHidError>;
}

/// A HID interface that speaks CTAPHID
pub trait HidLink: Send + Sync + fmt::Debug {
    /// Open a request for one exchange
    fn open_request(&self) -> Result<Box<dyn LinkRequest>, CtapHidError>;

    /// Whether the device is still attached
    fn is_device_present(&self) -> bool {
        true
    }

    /// Give the interface back to the platform
    fn close(&self) {}
}
