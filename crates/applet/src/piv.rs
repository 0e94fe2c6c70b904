//! PIV applet connection

use bytes::Bytes;
use hwkey_apdu_core::{
    ApduProcessor, ChainingPolicy, Command, Response, Secret, SharedTransport, StatusWord,
    response::status::common, secret::wipe_command,
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    select::{select_command, select_first},
};

/// AID prefix of the PIV applet
pub const PIV_AID_PREFIX: [u8; 5] = [0xA0, 0x00, 0x00, 0x03, 0x08];

/// PIV PINs are padded to this length with `0xFF`
pub const PIN_LENGTH: usize = 8;

/// P2 of VERIFY for the card application PIN
const P2_APPLICATION_PIN: u8 = 0x80;

/// Key references and the data objects holding their certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivKeyReference {
    /// PIV authentication key (9A)
    Authentication,
    /// Digital signature key (9C)
    DigitalSignature,
    /// Key management key (9D)
    KeyManagement,
    /// Card authentication key (9E)
    CardAuthentication,
}

impl PivKeyReference {
    /// Key reference used in GENERAL AUTHENTICATE
    pub const fn reference_id(self) -> u8 {
        match self {
            Self::Authentication => 0x9A,
            Self::DigitalSignature => 0x9C,
            Self::KeyManagement => 0x9D,
            Self::CardAuthentication => 0x9E,
        }
    }

    /// Tag of the data object holding the certificate
    pub const fn certificate_object(self) -> [u8; 3] {
        match self {
            Self::Authentication => [0x5F, 0xC1, 0x05],
            Self::DigitalSignature => [0x5F, 0xC1, 0x0A],
            Self::KeyManagement => [0x5F, 0xC1, 0x0B],
            Self::CardAuthentication => [0x5F, 0xC1, 0x01],
        }
    }
}

/// Map a non-success status word of the PIV applet
pub fn map_status(status: StatusWord) -> Error {
    if let Some(retries_left) = status.retry_counter() {
        return Error::WrongPin { retries_left };
    }
    match status {
        common::SECURITY_CONDITION_NOT_SATISFIED => Error::WrongPin { retries_left: 0 },
        common::FILE_NOT_FOUND => Error::FileNotFound,
        common::CLASS_NOT_SUPPORTED => Error::ClassNotSupported,
        common::CONDITIONS_NOT_SATISFIED => Error::ConditionsNotSatisfied,
        common::INVALID_INSTRUCTION => Error::InstructionNotSupported,
        _ => Error::Unknown(status),
    }
}

/// GET DATA for a PIV data object
pub fn get_data_command(tag: &[u8]) -> Command {
    let mut data = Vec::with_capacity(tag.len() + 2);
    data.push(0x5C);
    data.push(tag.len() as u8);
    data.extend_from_slice(tag);
    Command::new_with_data(0x00, 0xCB, 0x3F, 0xFF, data).with_ne(256)
}

/// VERIFY with the card application PIN, padded to eight bytes
pub fn verify_command(pin: &Secret) -> Result<Command> {
    if pin.len() > PIN_LENGTH {
        return Err(Error::InvalidData("PIV PIN longer than eight bytes"));
    }
    let mut data = [0xFF; PIN_LENGTH];
    data[..pin.len()].copy_from_slice(pin.expose());
    let command = Command::new_with_data(0x00, 0x20, 0x00, P2_APPLICATION_PIN, data.to_vec());
    data.fill(0);
    Ok(command)
}

/// Connection to the PIV applet of one security key
#[derive(Debug)]
pub struct PivConnection {
    processor: ApduProcessor,
    aids: Vec<Vec<u8>>,
    selected_aid: Option<Vec<u8>>,
    pin_verified: bool,
}

impl PivConnection {
    /// Create a connection over the given transport without selecting yet
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            processor: ApduProcessor::new(transport, ChainingPolicy::short_chained()),
            aids: vec![PIV_AID_PREFIX.to_vec()],
            selected_aid: None,
            pin_verified: false,
        }
    }

    /// Replace the candidate AIDs
    pub fn with_aids(mut self, aids: Vec<Vec<u8>>) -> Self {
        self.aids = aids;
        self
    }

    /// Select the applet unless already done
    ///
    /// A failure releases the transport.
    pub fn connect_if_necessary(&mut self) -> Result<()> {
        if self.selected_aid.is_some() {
            return Ok(());
        }

        let aids = self.aids.clone();
        match select_first(&aids, "PIV", |aid| self.communicate_or_throw(&select_command(aid))) {
            Ok((aid, _)) => {
                debug!(aid = %hex::encode(&aid), "Selected PIV applet");
                self.selected_aid = Some(aid);
                self.reset_pin_state();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to PIV applet");
                self.processor.transport().release();
                Err(e)
            }
        }
    }

    /// AID that was selected
    pub fn selected_aid(&self) -> Option<&[u8]> {
        self.selected_aid.as_deref()
    }

    /// The underlying transport
    pub const fn transport(&self) -> &SharedTransport {
        self.processor.transport()
    }

    /// Whether the PIN was verified in this session
    pub const fn is_pin_verified(&self) -> bool {
        self.pin_verified
    }

    /// Forget the PIN verification
    pub const fn reset_pin_state(&mut self) {
        self.pin_verified = false;
    }

    /// Send a command and return the raw response
    pub fn communicate(&self, command: &Command) -> Result<Response> {
        Ok(self.processor.communicate(command)?)
    }

    /// Send a command and map a non-success status word to an error
    pub fn communicate_or_throw(&self, command: &Command) -> Result<Response> {
        let response = self.communicate(command)?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(map_status(response.status()))
        }
    }

    /// Verify the card application PIN, once per session
    pub fn verify_pin(&mut self, pin: &Secret) -> Result<()> {
        if self.pin_verified {
            return Ok(());
        }
        let command = verify_command(pin)?;
        let result = self.communicate_or_throw(&command);
        wipe_command(command);
        result?;
        self.pin_verified = true;
        Ok(())
    }

    /// Read the certificate object of a key
    pub fn read_certificate(&self, key: PivKeyReference) -> Result<Bytes> {
        if self.selected_aid.is_none() {
            return Err(Error::NotConnected);
        }
        let response = self.communicate_or_throw(&get_data_command(&key.certificate_object()))?;
        Ok(response.into_data())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use hwkey_apdu_core::{Transport, TransportKind, mock::MockTransport};
    use hex::decode;

    fn raw(hex: &str) -> Bytes {
        Bytes::from(decode(hex).unwrap())
    }

    #[test]
    fn test_select_and_verify_once() {
        let transport = Arc::new(MockTransport::with_success(TransportKind::UsbCcid));
        let mut connection = PivConnection::new(transport.clone());

        connection.connect_if_necessary().unwrap();
        connection.verify_pin(&Secret::from("123456")).unwrap();
        connection.verify_pin(&Secret::from("123456")).unwrap();

        let commands = transport.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].to_bytes().as_ref(), decode("00A4040005A00000030800").unwrap());
        assert_eq!(commands[1].to_bytes().as_ref(), decode("0020008008313233343536FFFF").unwrap());
        assert!(connection.is_pin_verified());
    }

    #[test]
    fn test_wrong_pin_carries_retries() {
        let transport = Arc::new(MockTransport::new(
            TransportKind::UsbCcid,
            vec![raw("9000"), raw("63C2")],
        ));
        let mut connection = PivConnection::new(transport);
        connection.connect_if_necessary().unwrap();

        assert!(matches!(
            connection.verify_pin(&Secret::from("000000")),
            Err(Error::WrongPin { retries_left: 2 })
        ));
        assert!(!connection.is_pin_verified());
    }

    #[test]
    fn test_status_word_mapping() {
        assert!(matches!(map_status(StatusWord::new(0x69, 0x82)), Error::WrongPin { retries_left: 0 }));
        assert!(matches!(map_status(StatusWord::new(0x6A, 0x82)), Error::FileNotFound));
        assert!(matches!(map_status(StatusWord::new(0x69, 0x85)), Error::ConditionsNotSatisfied));
        assert!(matches!(map_status(StatusWord::new(0x6F, 0x00)), Error::Unknown(_)));
    }

    #[test]
    fn test_missing_applet_releases_transport() {
        let transport = Arc::new(MockTransport::with_response(TransportKind::Nfc, raw("6A82")));
        let mut connection = PivConnection::new(transport.clone());

        assert!(matches!(
            connection.connect_if_necessary(),
            Err(Error::SelectApplet { applet: "PIV" })
        ));
        assert!(transport.is_released());
    }

    #[test]
    fn test_read_certificate_chains_get_response() {
        let transport = Arc::new(MockTransport::new(
            TransportKind::UsbCcid,
            vec![raw("9000"), raw("5302AA6102"), raw("BBCC9000")],
        ));
        let mut connection = PivConnection::new(transport.clone());
        connection.connect_if_necessary().unwrap();

        let certificate = connection.read_certificate(PivKeyReference::Authentication).unwrap();
        assert_eq!(certificate.as_ref(), decode("5302AABBCC").unwrap());

        let commands = transport.commands();
        assert_eq!(commands[1].data(), decode("5C035FC105").unwrap());
        assert!(commands[2].matches_header(0x00, 0xC0, 0x00, 0x00));
    }

    #[test]
    fn test_long_pin_is_rejected() {
        assert!(matches!(
            verify_command(&Secret::from("123456789")),
            Err(Error::InvalidData(_))
        ));
    }
}
