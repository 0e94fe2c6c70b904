//! Core error type for APDU exchanges
//!
//! This module provides the error type used by the command/response layer.
//! Transport failures are wrapped transparently so callers can still tell a
//! vanished device apart from a protocol problem.

use crate::{response::status::StatusWord, transport::TransportError};

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The command needs extended length or chaining and neither is available
    #[error("Command too long, and chaining unavailable ({nc} bytes)")]
    CommandTooLong {
        /// Data length of the rejected command
        nc: usize,
    },

    /// An intermediate block of a chained command was rejected
    #[error("Failed to chain apdu ({index}/{total}, last SW: {status})")]
    ChainFailed {
        /// One-based index of the failing block
        index: usize,
        /// Number of blocks in the chain
        total: usize,
        /// Status word returned for the failing block
        status: StatusWord,
    },

    /// Too many GET RESPONSE rounds
    #[error("Chain limit exceeded")]
    ChainLimitExceeded,

    /// Parse error when decoding a command or response
    #[error("Parse error: {0}")]
    ParseError(&'static str),

    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a new parse error
    pub const fn parse(message: &'static str) -> Self {
        Self::ParseError(message)
    }

    /// The transport error at the root of this error, if any
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Context { source, .. } => source.transport_error(),
            _ => None,
        }
    }
}

/// Result type for APDU operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Extension trait for Result with APDU Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T, Error>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn context<S: Into<String>>(self, context: S) -> Self {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for Result<T, TransportError> {
    fn context<S: Into<String>>(self, context: S) -> Result<T, Error> {
        self.map_err(|e| Error::from(e).with_context(context))
    }
}
