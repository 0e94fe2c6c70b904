//! PC/SC transport implementation

use std::{ffi::CString, fmt};

use hwkey_apdu_core::{
    Command, Response,
    secret::wipe_bytes,
    transport::{ReleaseCallback, ReleaseState, Transport, TransportError, TransportKind},
};
use parking_lot::Mutex;
use pcsc::{Card, Context, Disposition};
use tracing::{debug, warn};

use crate::{config::PcscConfig, error::PcscError};

/// A security key reached through a PC/SC reader (USB CCID)
pub struct PcscTransport {
    /// PC/SC context
    context: Context,
    /// Card connection, if established
    card: Mutex<Option<Card>>,
    /// Reader name
    reader_name: String,
    /// Configuration
    config: PcscConfig,
    release: ReleaseState,
}

impl fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTransport")
            .field("reader_name", &self.reader_name)
            .field("has_card", &self.card.lock().is_some())
            .field("config", &self.config)
            .field("release", &self.release)
            .finish()
    }
}

impl PcscTransport {
    /// Create a transport for the given reader without connecting yet
    pub fn new(context: Context, reader_name: impl Into<String>, config: PcscConfig) -> Self {
        Self {
            context,
            card: Mutex::new(None),
            reader_name: reader_name.into(),
            config,
            release: ReleaseState::new(),
        }
    }

    /// Get the reader name
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Get the ATR of the current card
    pub fn atr(&self) -> Result<Vec<u8>, PcscError> {
        self.card.lock().as_ref().map_or_else(
            || Err(PcscError::NoCard(self.reader_name.clone())),
            |card| {
                card.get_attribute_owned(pcsc::Attribute::AtrString)
                    .map_err(Into::into)
            },
        )
    }

    fn connect_card(&self) -> Result<Card, PcscError> {
        let reader = CString::new(self.reader_name.clone())
            .map_err(|_| PcscError::ReaderNotFound(self.reader_name.clone()))?;

        match self.context.connect(
            &reader,
            self.config.share_mode.into(),
            self.config.protocols,
        ) {
            Ok(card) => Ok(card),
            Err(pcsc::Error::NoSmartcard) => Err(PcscError::NoCard(self.reader_name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn transmit(&self, card: &mut Card, apdu: &[u8]) -> Result<Vec<u8>, PcscError> {
        let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        match card.transmit(apdu, &mut buffer) {
            Ok(response) => Ok(response.to_vec()),
            Err(pcsc::Error::ResetCard) if self.config.auto_reconnect => {
                debug!(reader = %self.reader_name, "Card was reset, reconnecting");
                card.reconnect(
                    self.config.share_mode.into(),
                    self.config.protocols,
                    Disposition::LeaveCard,
                )?;
                let response = card.transmit(apdu, &mut buffer)?;
                Ok(response.to_vec())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Transport for PcscTransport {
    fn do_transceive(&self, command: &Command) -> Result<Response, TransportError> {
        if self.release.is_released() {
            return Err(TransportError::Disconnected);
        }

        let result = {
            let mut card = self.card.lock();
            let card = card
                .as_mut()
                .ok_or_else(|| TransportError::connection("Not connected"))?;
            let apdu = command.to_bytes();
            let result = self.transmit(card, &apdu);
            if command.carries_secret() {
                wipe_bytes(apdu);
            }
            result
        };

        match result {
            Ok(raw) => {
                Response::from_bytes(&raw).map_err(|e| TransportError::malformed(e.to_string()))
            }
            Err(PcscError::Pcsc(pcsc::Error::RemovedCard)) => {
                warn!(reader = %self.reader_name, "Security key removed during transmission");
                self.release();
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn connect(&self) -> Result<(), TransportError> {
        if self.release.is_released() {
            return Err(TransportError::Released);
        }

        let mut card = self.card.lock();
        if card.is_some() {
            return Err(TransportError::connection("Already connected"));
        }
        *card = Some(self.connect_card()?);
        debug!(reader = %self.reader_name, "Connected to card");
        Ok(())
    }

    fn release(&self) {
        if !self.release.release() {
            return;
        }

        debug!(reader = %self.reader_name, "Releasing PC/SC transport");
        if let Some(card) = self.card.lock().take()
            && let Err((_, e)) = card.disconnect(Disposition::LeaveCard)
        {
            debug!(error = ?e, "Failed to disconnect card");
        }
    }

    fn is_connected(&self) -> bool {
        !self.release.is_released() && self.card.lock().is_some()
    }

    fn is_released(&self) -> bool {
        self.release.is_released()
    }

    fn ping(&self) -> bool {
        if self.release.is_released() {
            return false;
        }
        self.card
            .lock()
            .as_ref()
            .is_some_and(|card| card.status2_owned().is_ok())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::UsbCcid
    }

    fn is_persistent_connection_allowed(&self) -> bool {
        true
    }

    fn is_extended_length_supported(&self) -> bool {
        // Decided per applet from the card capabilities
        false
    }

    fn set_release_callback(&self, callback: ReleaseCallback) {
        self.release.set_callback(callback);
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        if let Some(card) = self.card.get_mut().take() {
            let _ = card.disconnect(Disposition::LeaveCard);
        }
    }
}
