//! USB HID transport for security keys speaking CTAPHID
//!
//! This crate frames APDUs and CTAP2 CBOR messages into 64 byte HID reports,
//! negotiates a private channel with the authenticator and bounds every link
//! operation with a hard timeout. The platform USB stack is reached through
//! the [`HidLink`] trait.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod constants;
pub mod error;
pub mod frame;
pub mod init;
pub mod link;
pub mod protocol;
mod runner;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::CtapHidError;
pub use init::{InitNonce, InitResponse};
pub use link::{HidLink, LinkRequest, Packet};
pub use protocol::{CtapHidProtocol, CtapHidTimeouts};
pub use transport::UsbCtapHidTransport;
