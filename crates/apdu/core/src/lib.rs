//! Core traits and types for APDU (Application Protocol Data Unit) exchanges
//!
//! This crate provides the foundational types and traits for talking to
//! security keys with ISO/IEC 7816-4 commands and responses.
//!
//! ## Overview
//!
//! - [`Command`] and [`Response`] value types with short and extended length encodings
//! - The [`Transport`] trait every physical link implements
//! - [`ApduProcessor`], which adds command chaining, extended length fallback
//!   and GET RESPONSE continuation on top of any transport
//! - A [`SecureMessaging`] seam for applets that wrap their traffic
//! - [`Secret`] buffers that are zeroed when dropped
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

// Main modules
pub mod command;
pub mod processor;
pub mod response;
pub mod secret;
pub mod secure_channel;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Core error types
mod error;
pub use error::{Error, Result, ResultExt};

// Re-exports for common types
pub use command::Command;
pub use processor::{ApduProcessor, ChainingPolicy};
pub use response::{Response, status::StatusWord};
pub use secret::Secret;
pub use secure_channel::SecureMessaging;
pub use transport::{SharedTransport, Transport, TransportError, TransportKind};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        ApduProcessor, Bytes, BytesMut, ChainingPolicy, Command, Error, Response, Result,
        ResultExt, Secret, SecureMessaging, SharedTransport, StatusWord, Transport,
        TransportError, TransportKind, response::status::common,
        transport::{ReleaseCallback, ReleaseState},
    };
}
