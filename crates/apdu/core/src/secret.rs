//! Secret byte buffers that are wiped from memory when no longer needed

use std::fmt;

use bytes::Bytes;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Command;

/// A PIN, PUK or other secret, zeroed on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    /// Wrap secret bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the secret bytes
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Length of the secret
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {}])", self.0.len())
    }
}

/// Zero the data field of a command that carried secret material
///
/// Only the last handle to the buffer can be wiped; other holders keep theirs.
pub fn wipe_command(command: Command) {
    wipe_bytes(command.into_data());
}

/// Zero a buffer such as an encoded APDU, if this is its last handle
pub fn wipe_bytes(bytes: Bytes) {
    if let Ok(mut buffer) = bytes.try_into_mut() {
        buffer.as_mut().zeroize();
    }
}
