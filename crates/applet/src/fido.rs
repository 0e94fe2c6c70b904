//! FIDO U2F and FIDO2 applet connections
//!
//! Over CTAPHID the authenticator is asked for its version directly. Over
//! other transports one of the FIDO AIDs is selected and the select
//! response carries the version. FIDO2 additionally probes
//! `authenticatorGetInfo` to tell CTAP2 authenticators from CTAP1 ones.

use bytes::Bytes;
use hwkey_apdu_core::{
    ApduProcessor, ChainingPolicy, Command, Response, SharedTransport, StatusWord, TransportKind,
    command::MAX_NC_SHORT, response::status::common,
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    select::{select_command, select_first},
};

/// Version string of U2F authenticators
pub const U2F_VERSION: &str = "U2F_V2";

/// Version string of FIDO2 authenticators
pub const FIDO2_VERSION: &str = "FIDO_2_0";

/// AIDs of the FIDO applet, tried in order
pub const FIDO_AIDS: [&[u8]; 3] = [
    &[0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01],
    &[0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01, 0x00],
    &[0xA0, 0x00, 0x00, 0x05, 0x27, 0x10, 0x02],
];

/// `authenticatorGetInfo`
pub const CTAP2_GET_INFO: u8 = 0x04;

/// U2F VERSION
pub const fn version_command() -> Command {
    Command::new(0x00, 0x03, 0x00, 0x00)
}

/// Wrap a CTAP2 command and its CBOR parameters into the CTAP2 APDU
pub fn ctap2_command(command: u8, cbor: &[u8]) -> Command {
    let mut data = Vec::with_capacity(cbor.len() + 1);
    data.push(command);
    data.extend_from_slice(cbor);
    Command::new_with_data(0x80, 0x10, 0x00, 0x00, data)
}

/// Map a non-success status word of the FIDO applet
pub fn map_status(status: StatusWord) -> Error {
    match status {
        common::CONDITIONS_NOT_SATISFIED => Error::PresenceRequired,
        common::INCORRECT_DATA => Error::WrongKeyHandle,
        common::WRONG_LENGTH => Error::WrongRequestLength,
        common::FILE_NOT_FOUND => Error::FileNotFound,
        common::CLASS_NOT_SUPPORTED => Error::ClassNotSupported,
        common::INVALID_INSTRUCTION => Error::InstructionNotSupported,
        _ => Error::Unknown(status),
    }
}

fn check_version(data: &[u8], accepted: &[&str]) -> Result<String> {
    let version = String::from_utf8_lossy(data).into_owned();
    if accepted.contains(&version.as_str()) {
        Ok(version)
    } else {
        Err(Error::UnsupportedVersion(version))
    }
}

/// Shared selection logic of the U2F and FIDO2 connections
#[derive(Debug)]
struct FidoSession {
    processor: ApduProcessor,
    version: Option<String>,
    selected_aid: Option<Vec<u8>>,
}

impl FidoSession {
    fn new(transport: SharedTransport) -> Self {
        Self {
            processor: ApduProcessor::new(
                transport,
                ChainingPolicy::ExtendedThenShort {
                    block_size: MAX_NC_SHORT,
                },
            ),
            version: None,
            selected_aid: None,
        }
    }

    fn connect(&mut self, accepted: &[&str]) -> Result<()> {
        if self.version.is_some() {
            return Ok(());
        }

        let result = self.select_and_check_version(accepted);
        if let Err(e) = &result {
            warn!(error = %e, "Failed to connect to FIDO applet");
            self.processor.transport().release();
        }
        result
    }

    fn select_and_check_version(&mut self, accepted: &[&str]) -> Result<()> {
        if self.processor.transport().kind() == TransportKind::UsbCtapHid {
            let response = self.communicate_or_throw(&version_command())?;
            self.version = Some(check_version(response.data(), accepted)?);
            return Ok(());
        }

        let aids: Vec<Vec<u8>> = FIDO_AIDS.iter().map(|aid| aid.to_vec()).collect();
        let (aid, version) = select_first(&aids, "FIDO", |aid| {
            let response = self.communicate_or_throw(&select_command(aid))?;
            check_version(response.data(), accepted)
        })?;
        debug!(aid = %hex::encode(&aid), version = %version, "Selected FIDO applet");
        self.selected_aid = Some(aid);
        self.version = Some(version);
        Ok(())
    }

    fn communicate(&self, command: &Command) -> Result<Response> {
        Ok(self.processor.communicate(command)?)
    }

    fn communicate_or_throw(&self, command: &Command) -> Result<Response> {
        let response = self.communicate(command)?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(map_status(response.status()))
        }
    }
}

/// Connection to the FIDO U2F applet
#[derive(Debug)]
pub struct FidoU2fConnection {
    session: FidoSession,
}

impl FidoU2fConnection {
    /// Create a connection over the given transport without selecting yet
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            session: FidoSession::new(transport),
        }
    }

    /// Select the applet and check its version unless already done
    ///
    /// A failure releases the transport.
    pub fn connect_if_necessary(&mut self) -> Result<()> {
        self.session.connect(&[U2F_VERSION])
    }

    /// Version reported by the authenticator
    pub fn version(&self) -> Option<&str> {
        self.session.version.as_deref()
    }

    /// AID that was selected, `None` over CTAPHID
    pub fn selected_aid(&self) -> Option<&[u8]> {
        self.session.selected_aid.as_deref()
    }

    /// The underlying transport
    pub const fn transport(&self) -> &SharedTransport {
        self.session.processor.transport()
    }

    /// Send a command and return the raw response
    pub fn communicate(&self, command: &Command) -> Result<Response> {
        self.session.communicate(command)
    }

    /// Send a command and map a non-success status word to an error
    pub fn communicate_or_throw(&self, command: &Command) -> Result<Response> {
        self.session.communicate_or_throw(command)
    }
}

/// Configuration of the FIDO2 connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fido2Config {
    /// Treat every authenticator as U2F and skip the CTAP2 probe
    pub force_u2f: bool,
}

impl Fido2Config {
    /// Set whether the CTAP2 probe is skipped
    pub const fn with_force_u2f(mut self, force_u2f: bool) -> Self {
        self.force_u2f = force_u2f;
        self
    }
}

/// Connection to a FIDO2 authenticator, falling back to U2F
#[derive(Debug)]
pub struct Fido2Connection {
    session: FidoSession,
    config: Fido2Config,
    info: Option<Bytes>,
    probed: bool,
}

impl Fido2Connection {
    /// Create a connection over the given transport without selecting yet
    pub fn new(transport: SharedTransport, config: Fido2Config) -> Self {
        Self {
            session: FidoSession::new(transport),
            config,
            info: None,
            probed: false,
        }
    }

    /// Select the applet, check its version and probe for CTAP2
    ///
    /// A failure releases the transport.
    pub fn connect_if_necessary(&mut self) -> Result<()> {
        self.session.connect(&[U2F_VERSION, FIDO2_VERSION])?;
        if self.probed || self.config.force_u2f {
            return Ok(());
        }

        match self.session.communicate(&ctap2_command(CTAP2_GET_INFO, &[])) {
            Ok(response) if response.is_success() && response.data().first() == Some(&0x00) => {
                debug!("Authenticator speaks CTAP2");
                self.info = Some(response.into_data().slice(1..));
            }
            Ok(response) => {
                debug!(status = %response.status(), "No CTAP2 support, using CTAP1");
            }
            Err(e) => {
                self.session.processor.transport().release();
                return Err(e);
            }
        }
        self.probed = true;
        Ok(())
    }

    /// Whether the authenticator answered `authenticatorGetInfo`
    pub const fn is_ctap2(&self) -> bool {
        self.info.is_some()
    }

    /// CBOR encoded `authenticatorGetInfo` response
    pub fn authenticator_info(&self) -> Option<&[u8]> {
        self.info.as_deref()
    }

    /// Version reported by the authenticator
    pub fn version(&self) -> Option<&str> {
        self.session.version.as_deref()
    }

    /// The underlying transport
    pub const fn transport(&self) -> &SharedTransport {
        self.session.processor.transport()
    }

    /// Send a CTAP2 command and return the reply, status byte first
    pub fn transceive_ctap2(&self, command: u8, cbor: &[u8]) -> Result<Bytes> {
        let response = self.session.communicate_or_throw(&ctap2_command(command, cbor))?;
        Ok(response.into_data())
    }

    /// Send a U2F command and map a non-success status word to an error
    pub fn communicate_or_throw(&self, command: &Command) -> Result<Response> {
        self.session.communicate_or_throw(command)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use hwkey_apdu_core::{Transport, mock::MockTransport};
    use hex::decode;

    fn ok(data: &[u8]) -> Bytes {
        let mut raw = data.to_vec();
        raw.extend_from_slice(&[0x90, 0x00]);
        Bytes::from(raw)
    }

    fn sw(status: &str) -> Bytes {
        Bytes::from(decode(status).unwrap())
    }

    #[test]
    fn test_u2f_over_ctaphid_asks_for_version() {
        let transport = Arc::new(MockTransport::with_response(
            TransportKind::UsbCtapHid,
            ok(b"U2F_V2"),
        ));
        let mut connection = FidoU2fConnection::new(transport.clone());

        connection.connect_if_necessary().unwrap();
        connection.connect_if_necessary().unwrap();

        let commands = transport.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].to_bytes().as_ref(), decode("00030000000000").unwrap());
        assert_eq!(connection.version(), Some(U2F_VERSION));
        assert_eq!(connection.selected_aid(), None);
    }

    #[test]
    fn test_u2f_rejects_other_versions() {
        let transport = Arc::new(MockTransport::with_response(
            TransportKind::UsbCtapHid,
            ok(b"U2F_V1"),
        ));
        let mut connection = FidoU2fConnection::new(transport.clone());

        assert!(matches!(
            connection.connect_if_necessary(),
            Err(Error::UnsupportedVersion(version)) if version == "U2F_V1"
        ));
        assert!(transport.is_released());
    }

    #[test]
    fn test_u2f_over_nfc_selects_next_aid() {
        let transport = Arc::new(MockTransport::new(
            TransportKind::Nfc,
            vec![sw("6A82"), ok(b"U2F_V2")],
        ));
        let mut connection = FidoU2fConnection::new(transport.clone());

        connection.connect_if_necessary().unwrap();
        assert_eq!(connection.selected_aid(), Some(FIDO_AIDS[1]));
    }

    #[test]
    fn test_u2f_over_nfc_without_applet() {
        let transport = Arc::new(MockTransport::with_response(TransportKind::Nfc, sw("6A82")));
        let mut connection = FidoU2fConnection::new(transport.clone());

        assert!(matches!(
            connection.connect_if_necessary(),
            Err(Error::SelectApplet { applet: "FIDO" })
        ));
        assert_eq!(transport.command_count(), 3);
    }

    #[test]
    fn test_fido_status_mapping() {
        let transport = Arc::new(MockTransport::new(
            TransportKind::UsbCtapHid,
            vec![ok(b"U2F_V2"), sw("6985")],
        ));
        let mut connection = FidoU2fConnection::new(transport);
        connection.connect_if_necessary().unwrap();

        let register = Command::new_with_data(0x00, 0x01, 0x03, 0x00, vec![0u8; 64]);
        assert!(matches!(
            connection.communicate_or_throw(&register),
            Err(Error::PresenceRequired)
        ));
        assert!(matches!(map_status(StatusWord::new(0x6A, 0x80)), Error::WrongKeyHandle));
        assert!(matches!(map_status(StatusWord::new(0x67, 0x00)), Error::WrongRequestLength));
    }

    #[test]
    fn test_fido2_probe_detects_ctap2() {
        let transport = Arc::new(MockTransport::new(
            TransportKind::UsbCtapHid,
            vec![ok(b"FIDO_2_0"), ok(&[0x00, 0xA1, 0x01, 0x80])],
        ));
        let mut connection = Fido2Connection::new(transport.clone(), Fido2Config::default());

        connection.connect_if_necessary().unwrap();
        assert!(connection.is_ctap2());
        assert_eq!(connection.authenticator_info(), Some(&[0xA1, 0x01, 0x80][..]));

        let probe = &transport.commands()[1];
        assert!(probe.matches_header(0x80, 0x10, 0x00, 0x00));
        assert_eq!(probe.data(), &[CTAP2_GET_INFO]);
    }

    #[test]
    fn test_fido2_falls_back_to_ctap1() {
        let transport = Arc::new(MockTransport::new(
            TransportKind::Nfc,
            vec![ok(b"U2F_V2"), sw("6D00")],
        ));
        let mut connection = Fido2Connection::new(transport.clone(), Fido2Config::default());

        connection.connect_if_necessary().unwrap();
        assert!(!connection.is_ctap2());
        assert_eq!(connection.version(), Some(U2F_VERSION));
        assert!(!transport.is_released());
    }

    #[test]
    fn test_fido2_force_u2f_skips_probe() {
        let transport = Arc::new(MockTransport::with_response(
            TransportKind::UsbCtapHid,
            ok(b"FIDO_2_0"),
        ));
        let config = Fido2Config::default().with_force_u2f(true);
        let mut connection = Fido2Connection::new(transport.clone(), config);

        connection.connect_if_necessary().unwrap();
        assert!(!connection.is_ctap2());
        assert_eq!(transport.command_count(), 1);
    }
}
