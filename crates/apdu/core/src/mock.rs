//! Scripted transport for tests
//!
//! Records every command it receives and replays raw responses in order. A
//! single remaining response is repeated for every further command.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    Command, Response,
    transport::{ReleaseCallback, ReleaseState, Transport, TransportError, TransportKind},
};

/// A transport double with scripted responses
#[derive(Debug)]
pub struct MockTransport {
    kind: TransportKind,
    responses: Mutex<VecDeque<Bytes>>,
    commands: Mutex<Vec<Command>>,
    connected: Mutex<bool>,
    connect_error: Option<TransportError>,
    persistent: bool,
    extended_length: bool,
    release: ReleaseState,
}

impl MockTransport {
    /// Create a new mock transport with the given responses
    pub fn new(kind: TransportKind, responses: Vec<Bytes>) -> Self {
        Self {
            kind,
            responses: Mutex::new(responses.into()),
            commands: Mutex::new(Vec::new()),
            connected: Mutex::new(false),
            connect_error: None,
            persistent: kind.is_usb(),
            extended_length: false,
            release: ReleaseState::new(),
        }
    }

    /// Create a new mock transport that always returns the given response
    pub fn with_response(kind: TransportKind, response: Bytes) -> Self {
        Self::new(kind, vec![response])
    }

    /// Create a new mock transport that always returns success (90 00)
    pub fn with_success(kind: TransportKind) -> Self {
        Self::with_response(kind, Bytes::from_static(&[0x90, 0x00]))
    }

    /// Report native extended length support
    pub const fn with_extended_length(mut self, extended_length: bool) -> Self {
        self.extended_length = extended_length;
        self
    }

    /// Report persistent connection support
    pub const fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Fail every connect attempt with the given error
    pub fn with_connect_error(mut self, error: TransportError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Queue another response
    pub fn push_response(&self, response: Bytes) {
        self.responses.lock().push_back(response);
    }

    /// Commands received so far
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    /// Number of commands received so far
    pub fn command_count(&self) -> usize {
        self.commands.lock().len()
    }
}

impl Transport for MockTransport {
    fn do_transceive(&self, command: &Command) -> Result<Response, TransportError> {
        if self.release.is_released() {
            return Err(TransportError::Disconnected);
        }

        self.commands.lock().push(command.clone());

        let raw = {
            let mut responses = self.responses.lock();
            // Either clone the single response or take the next one
            if responses.len() == 1 {
                responses.front().cloned()
            } else {
                responses.pop_front()
            }
        };

        let raw = raw.ok_or_else(|| TransportError::io("no scripted response left"))?;
        Response::from_bytes(&raw).map_err(|e| TransportError::malformed(e.to_string()))
    }

    fn connect(&self) -> Result<(), TransportError> {
        if let Some(error) = &self.connect_error {
            return Err(error.clone());
        }
        *self.connected.lock() = true;
        Ok(())
    }

    fn release(&self) {
        *self.connected.lock() = false;
        self.release.release();
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock() && !self.release.is_released()
    }

    fn is_released(&self) -> bool {
        self.release.is_released()
    }

    fn ping(&self) -> bool {
        self.is_connected()
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_persistent_connection_allowed(&self) -> bool {
        self.persistent
    }

    fn is_extended_length_supported(&self) -> bool {
        self.extended_length
    }

    fn set_release_callback(&self, callback: ReleaseCallback) {
        self.release.set_callback(callback);
    }
}
