//! Connection to the OpenPGP card applet
//!
//! Selection tries the configured AIDs in order and reactivates a terminated
//! applet once. Capabilities are cached after selection and drive the
//! chaining policy of the request path. PIN verification is remembered per
//! connection, and every command goes through secure messaging once a
//! session is established.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use hwkey_apdu_core::{
    ApduProcessor, ChainingPolicy, Command, Response, Secret, SecureMessaging, SharedTransport,
    StatusWord, TransportError, response::status::common, secret::wipe_command,
};
use iso7816_tlv::ber::Tlv;
use tracing::{debug, info, warn};

use super::{
    capabilities::{OpenPgpCapabilities, find_primitive, tags},
    commands::{self, KeySlot, PinReference, data_object},
    info::SecurityKeyInfo,
};
use crate::{
    error::{Error, Result},
    select::select_first,
};

/// AID prefix of the OpenPGP card applet
pub const OPENPGP_AID_PREFIX: [u8; 6] = [0xD2, 0x76, 0x00, 0x01, 0x24, 0x01];

/// Establishes secure messaging sessions for applets that offer it
pub trait SecureMessagingProvider: Send + Sync + fmt::Debug {
    /// Run the key agreement over the plain request path
    fn establish(
        &self,
        processor: &ApduProcessor,
        capabilities: &OpenPgpCapabilities,
    ) -> Result<Box<dyn SecureMessaging>, TransportError>;
}

/// Configuration of the OpenPGP connection
#[derive(Debug, Clone)]
pub struct OpenPgpConfig {
    /// Candidate AIDs, tried in order
    pub aids: Vec<Vec<u8>>,
    /// Secure messaging, used when the applet announces it
    pub secure_messaging: Option<Arc<dyn SecureMessagingProvider>>,
}

impl Default for OpenPgpConfig {
    fn default() -> Self {
        Self {
            aids: vec![OPENPGP_AID_PREFIX.to_vec()],
            secure_messaging: None,
        }
    }
}

impl OpenPgpConfig {
    /// Replace the candidate AIDs
    pub fn with_aids(mut self, aids: Vec<Vec<u8>>) -> Self {
        self.aids = aids;
        self
    }

    /// Set the secure messaging provider
    pub fn with_secure_messaging(mut self, provider: Arc<dyn SecureMessagingProvider>) -> Self {
        self.secure_messaging = Some(provider);
        self
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not selected
    Disconnected,
    /// Selecting the applet
    Connecting,
    /// Bringing a terminated applet back
    Reactivating,
    /// Selected, capabilities cached
    Connected,
}

/// Which PINs were verified in this session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinState {
    /// PW1 verified for signatures
    pub pw1_signature: bool,
    /// PW1 verified for the other operations
    pub pw1_other: bool,
    /// PW3 verified
    pub pw3: bool,
}

impl PinState {
    const fn reset(&mut self) {
        *self = Self {
            pw1_signature: false,
            pw1_other: false,
            pw3: false,
        };
    }
}

/// Connection to the OpenPGP card applet of one security key
#[derive(Debug)]
pub struct OpenPgpConnection {
    processor: ApduProcessor,
    config: OpenPgpConfig,
    state: ConnectionState,
    capabilities: Option<OpenPgpCapabilities>,
    pins: PinState,
    secure_messaging: Option<Box<dyn SecureMessaging>>,
}

impl OpenPgpConnection {
    /// Create a connection over the given transport without selecting yet
    pub fn new(transport: SharedTransport, config: OpenPgpConfig) -> Self {
        Self {
            processor: ApduProcessor::new(transport, ChainingPolicy::default()),
            config,
            state: ConnectionState::Disconnected,
            capabilities: None,
            pins: PinState::default(),
            secure_messaging: None,
        }
    }

    /// Current connection state
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the applet is selected
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Cached capabilities
    pub const fn capabilities(&self) -> Option<&OpenPgpCapabilities> {
        self.capabilities.as_ref()
    }

    /// PIN verification state
    pub const fn pin_state(&self) -> PinState {
        self.pins
    }

    /// The underlying transport
    pub const fn transport(&self) -> &SharedTransport {
        self.processor.transport()
    }

    /// Whether a secure messaging session is active
    pub fn is_secure_messaging_established(&self) -> bool {
        self.secure_messaging.as_ref().is_some_and(|sm| sm.is_established())
    }

    /// Select the applet unless already connected
    ///
    /// When already connected, only the capabilities are refreshed. Any
    /// failure while connecting releases the transport.
    pub fn connect_if_necessary(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return self.refresh_capabilities();
        }

        if let Err(e) = self.connect_to_device() {
            warn!(error = %e, "Failed to connect to OpenPGP applet");
            self.state = ConnectionState::Disconnected;
            self.capabilities = None;
            self.processor.transport().release();
            return Err(e);
        }
        Ok(())
    }

    fn connect_to_device(&mut self) -> Result<()> {
        self.state = ConnectionState::Connecting;
        self.secure_messaging = None;
        self.processor.set_policy(ChainingPolicy::default());

        let aids = self.config.aids.clone();
        let (aid, ()) = select_first(&aids, "OpenPGP", |aid| self.select_or_reactivate(aid))?;
        debug!(aid = %hex::encode(&aid), "Selected OpenPGP applet");

        match self.refresh_capabilities() {
            Err(Error::ConditionsNotSatisfied) => {
                self.reactivate()?;
                self.select(&aid)?;
                self.refresh_capabilities()?;
            }
            other => other?,
        }

        self.state = ConnectionState::Connected;
        self.pins.reset();
        self.establish_secure_messaging();
        info!(transport = %self.transport().kind(), "OpenPGP applet connected");
        Ok(())
    }

    fn select(&mut self, aid: &[u8]) -> Result<()> {
        self.communicate_or_throw(&commands::select(aid)).map(drop)
    }

    fn select_or_reactivate(&mut self, aid: &[u8]) -> Result<()> {
        match self.select(aid) {
            Err(Error::FileInTerminationState) => {
                self.reactivate()?;
                self.select(aid)
            }
            other => other,
        }
    }

    fn reactivate(&mut self) -> Result<()> {
        warn!("OpenPGP applet is terminated, trying to reactivate");
        self.state = ConnectionState::Reactivating;
        let response = self.communicate(&commands::activate_file())?;
        self.state = ConnectionState::Connecting;
        if !response.is_success() {
            return Err(Error::SecurityKeyTerminated);
        }
        Ok(())
    }

    /// Re-read the Application Related Data and adapt the chaining policy
    pub fn refresh_capabilities(&mut self) -> Result<()> {
        let response =
            self.communicate_or_throw(&commands::get_data(data_object::APPLICATION_RELATED_DATA))?;
        self.cache_capabilities(&response)
    }

    fn cache_capabilities(&mut self, response: &Response) -> Result<()> {
        let capabilities = OpenPgpCapabilities::parse(response.data())?;
        let card = capabilities.card_capabilities();
        self.processor.set_policy(ChainingPolicy::from_capabilities(
            card.has_extended_length(),
            card.has_chaining(),
        ));
        self.capabilities = Some(capabilities);
        Ok(())
    }

    fn establish_secure_messaging(&mut self) {
        let (Some(provider), Some(capabilities)) =
            (self.config.secure_messaging.as_ref(), self.capabilities.as_ref())
        else {
            return;
        };
        if !capabilities.has_secure_messaging() {
            return;
        }

        match provider.establish(&self.processor, capabilities) {
            Ok(session) => {
                debug!("Secure messaging established");
                self.secure_messaging = Some(session);
            }
            Err(e) => warn!(error = %e, "Failed to establish secure messaging"),
        }
    }

    /// Send a command on the full request path and return the raw response
    ///
    /// With secure messaging active the command is wrapped before sending and
    /// the response unwrapped after continuation. A wrapping failure tears
    /// the session down.
    pub fn communicate(&mut self, command: &Command) -> Result<Response> {
        let Some(session) = self.secure_messaging.as_mut().filter(|sm| sm.is_established()) else {
            return Ok(self.processor.communicate(command)?);
        };

        let wrapped = match session.encrypt_and_sign(command.clone()) {
            Ok(wrapped) => wrapped,
            Err(e) => return Err(self.tear_down_session(e)),
        };
        let response = self.processor.communicate(&wrapped)?;
        match self.secure_messaging.as_mut().map(|sm| sm.verify_and_decrypt(response)) {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(self.tear_down_session(e)),
            None => Err(Error::NotConnected),
        }
    }

    fn tear_down_session(&mut self, error: TransportError) -> Error {
        warn!(error = %error, "Secure messaging failed, clearing session");
        if let Some(mut session) = self.secure_messaging.take() {
            session.clear_session();
        }
        Error::Transport(error)
    }

    /// Send a command and map a non-success status word to an error
    pub fn communicate_or_throw(&mut self, command: &Command) -> Result<Response> {
        let response = self.communicate(command)?;
        if response.is_success() {
            return Ok(response);
        }

        let status = response.status();
        Err(match status {
            common::SECURITY_CONDITION_NOT_SATISFIED
            | common::WRONG_PIN_ONE_LEFT
            | common::WRONG_PIN_TWO_LEFT => {
                let retries_left = self.retries_after_failed_verify(command, status);
                Error::WrongPin { retries_left }
            }
            common::AUTHENTICATION_METHOD_BLOCKED | common::PIN_BLOCKED_COUNTER => Error::Locked,
            common::INCORRECT_DATA | common::WRONG_LENGTH => Error::PinTooShort,
            common::FILE_NOT_FOUND => Error::FileNotFound,
            common::CLASS_NOT_SUPPORTED => Error::ClassNotSupported,
            common::CONDITIONS_NOT_SATISFIED => Error::ConditionsNotSatisfied,
            common::FILE_IN_TERMINATION_STATE => Error::FileInTerminationState,
            common::INVALID_INSTRUCTION => Error::InstructionNotSupported,
            _ => Error::Unknown(status),
        })
    }

    fn retries_after_failed_verify(&mut self, command: &Command, status: StatusWord) -> u8 {
        let from_status = status.retry_counter().unwrap_or(0);
        // Must not go through the status mapping, which lands back here on 6982
        let refreshed = self
            .communicate(&commands::get_data(data_object::APPLICATION_RELATED_DATA))
            .and_then(|response| {
                if response.is_success() {
                    self.cache_capabilities(&response)
                } else {
                    Err(Error::Unknown(response.status()))
                }
            });
        if let Err(e) = refreshed {
            debug!(error = %e, "Could not refresh PIN retry counters");
            return from_status;
        }

        let is_pw3 = command.matches_header(0x00, commands::ins::VERIFY, 0x00, PinReference::Pw3 as u8);
        let capabilities = self.capabilities.as_ref();
        let retries = if is_pw3 {
            capabilities.and_then(OpenPgpCapabilities::pw3_retries)
        } else {
            capabilities.and_then(OpenPgpCapabilities::pw1_retries)
        };
        retries.unwrap_or(from_status)
    }

    fn verify(&mut self, pin: PinReference, secret: &Secret) -> Result<()> {
        let command = commands::verify(pin, secret.expose());
        let result = self.communicate_or_throw(&command);
        wipe_command(command);
        result.map(drop)
    }

    /// Verify PW1 for signing, once per session
    pub fn verify_pin_for_signature(&mut self, pin: &Secret) -> Result<()> {
        if self.pins.pw1_signature {
            return Ok(());
        }
        self.verify(PinReference::Pw1Signature, pin)?;
        self.pins.pw1_signature = true;
        Ok(())
    }

    /// Verify PW1 for decryption and authentication, once per session
    pub fn verify_pin_for_other(&mut self, pin: &Secret) -> Result<()> {
        if self.pins.pw1_other {
            return Ok(());
        }
        self.verify(PinReference::Pw1Other, pin)?;
        self.pins.pw1_other = true;
        Ok(())
    }

    /// Verify PW3, once per session
    pub fn verify_puk(&mut self, puk: &Secret) -> Result<()> {
        if self.pins.pw3 {
            return Ok(());
        }
        self.verify(PinReference::Pw3, puk)?;
        self.pins.pw3 = true;
        Ok(())
    }

    /// Forget the signature PIN after a signature, unless the card keeps it valid
    pub fn invalidate_single_use_pw1(&mut self) {
        let multiple = self
            .capabilities
            .as_ref()
            .is_some_and(OpenPgpCapabilities::pw1_valid_for_multiple_signatures);
        if !multiple {
            self.pins.pw1_signature = false;
        }
    }

    /// Forget the admin PIN
    pub const fn invalidate_pw3(&mut self) {
        self.pins.pw3 = false;
    }

    /// Read a data object
    pub fn get_data(&mut self, data_object: u16) -> Result<Bytes> {
        self.ensure_connected()?;
        let response = self.communicate_or_throw(&commands::get_data(data_object))?;
        Ok(response.into_data())
    }

    /// Write a data object
    pub fn put_data(&mut self, data_object: u16, data: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        self.communicate_or_throw(&commands::put_data(data_object, data)).map(drop)
    }

    /// Read the public key of a key slot
    pub fn retrieve_public_key(&mut self, slot: KeySlot) -> Result<Bytes> {
        self.ensure_connected()?;
        let response = self.communicate_or_throw(&commands::read_public_key(slot))?;
        Ok(response.into_data())
    }

    /// Collect the summary information shown for a key
    pub fn read_security_key_info(&mut self) -> Result<SecurityKeyInfo> {
        self.ensure_connected()?;
        let url = self.get_data(data_object::URL)?;
        let cardholder = self.get_data(data_object::CARDHOLDER_RELATED_DATA)?;
        let name = find_primitive(&Tlv::parse_all(&cardholder), tags::NAME).map(<[u8]>::to_vec);

        let capabilities = self.capabilities.as_ref().ok_or(Error::NotConnected)?;
        Ok(SecurityKeyInfo::new(
            self.transport().kind(),
            capabilities,
            name.as_deref(),
            Some(&url),
        ))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}
