//! Secure messaging seam
//!
//! Applets that advertise secure messaging wrap every command and unwrap every
//! response through an established session. The key agreement itself lives
//! outside this crate; this trait is the hook the request path calls into.

use std::fmt;

use crate::{Command, Response, transport::TransportError};

/// An established secure messaging session
pub trait SecureMessaging: Send + fmt::Debug {
    /// Encrypt and MAC a command before it goes on the wire
    fn encrypt_and_sign(&mut self, command: Command) -> Result<Command, TransportError>;

    /// Verify and decrypt a response as it comes off the wire
    fn verify_and_decrypt(&mut self, response: Response) -> Result<Response, TransportError>;

    /// Whether the session keys are in place
    fn is_established(&self) -> bool;

    /// Drop the session keys
    fn clear_session(&mut self);
}
