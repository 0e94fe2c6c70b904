//! Summary information about an OpenPGP security key

use derive_more::Display;
use hwkey_apdu_core::TransportKind;

use super::capabilities::{Fingerprints, OpenPgpCapabilities};

/// Manufacturer of a security key, read from its AID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SecurityKeyType {
    /// Yubico YubiKey
    #[display("YubiKey")]
    Yubico,
    /// ZeitControl cardsystems
    #[display("ZeitControl")]
    ZeitControl,
    /// Nitrokey
    #[display("Nitrokey")]
    Nitrokey,
    /// Free Software Initiative of Japan (Gnuk)
    #[display("Gnuk")]
    Gnuk,
    /// Anything else
    #[display("Unknown")]
    Unknown,
}

impl SecurityKeyType {
    /// Derive the manufacturer from an OpenPGP AID
    pub fn from_aid(aid: &[u8]) -> Self {
        match aid.get(8..10) {
            Some([0x00, 0x06]) => Self::Yubico,
            Some([0x00, 0x05]) => Self::ZeitControl,
            Some([0x00, 0x0F]) => Self::Nitrokey,
            Some([0xF5, 0x17]) => Self::Gnuk,
            _ => Self::Unknown,
        }
    }
}

/// Everything an application usually shows about an OpenPGP security key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityKeyInfo {
    /// Transport the key was reached over
    pub transport_kind: TransportKind,
    /// Manufacturer
    pub key_type: SecurityKeyType,
    /// Full AID of the applet
    pub aid: Vec<u8>,
    /// Key fingerprints
    pub fingerprints: Fingerprints,
    /// Cardholder name, `<` separators replaced by spaces
    pub user_id: Option<String>,
    /// URL of the public key
    pub url: Option<String>,
    /// PW1 attempts left
    pub pw1_retries: u8,
    /// PW3 attempts left
    pub pw3_retries: u8,
    /// Whether the applet can be terminated and reactivated
    pub has_lifecycle_management: bool,
}

impl SecurityKeyInfo {
    /// Assemble the info from capabilities and the optional text objects
    pub fn new(
        transport_kind: TransportKind,
        capabilities: &OpenPgpCapabilities,
        cardholder_name: Option<&[u8]>,
        url: Option<&[u8]>,
    ) -> Self {
        Self {
            transport_kind,
            key_type: SecurityKeyType::from_aid(capabilities.aid()),
            aid: capabilities.aid().to_vec(),
            fingerprints: *capabilities.fingerprints(),
            user_id: cardholder_name.and_then(parse_holder_name),
            url: url.and_then(parse_url),
            pw1_retries: capabilities.pw1_retries().unwrap_or(0),
            pw3_retries: capabilities.pw3_retries().unwrap_or(0),
            has_lifecycle_management: capabilities.card_capabilities().has_lifecycle_management(),
        }
    }

    /// Serial number from the AID, as printed on the key
    pub fn serial_number(&self) -> Option<String> {
        self.aid.get(10..14).map(hex::encode_upper)
    }

    /// OpenPGP card specification version from the AID
    pub fn version(&self) -> Option<(u8, u8)> {
        match self.aid.get(6..8) {
            Some(&[major, minor]) => Some((major, minor)),
            _ => None,
        }
    }
}

fn parse_holder_name(name: &[u8]) -> Option<String> {
    let name = String::from_utf8_lossy(name).replace('<', " ");
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    (!name.is_empty()).then_some(name)
}

fn parse_url(url: &[u8]) -> Option<String> {
    let url = String::from_utf8_lossy(url).trim().to_string();
    (!url.is_empty()).then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openpgp::capabilities::tests::APPLICATION_RELATED_DATA;
    use hex::decode;

    #[test]
    fn test_key_type_from_aid() {
        let aid = decode("D2760001240103040006123456780000").unwrap();
        assert_eq!(SecurityKeyType::from_aid(&aid), SecurityKeyType::Yubico);

        let aid = decode("D276000124010200F517000000010000").unwrap();
        assert_eq!(SecurityKeyType::from_aid(&aid), SecurityKeyType::Gnuk);

        assert_eq!(SecurityKeyType::from_aid(&[0xD2, 0x76]), SecurityKeyType::Unknown);
    }

    #[test]
    fn test_info_from_capabilities() {
        let caps = OpenPgpCapabilities::parse(&decode(APPLICATION_RELATED_DATA).unwrap()).unwrap();
        let info = SecurityKeyInfo::new(
            TransportKind::Nfc,
            &caps,
            Some(b"Doe<<Jane"),
            Some(b" https://keys.example.org/jane.asc \n"),
        );

        assert_eq!(info.key_type, SecurityKeyType::Yubico);
        assert_eq!(info.user_id.as_deref(), Some("Doe Jane"));
        assert_eq!(info.url.as_deref(), Some("https://keys.example.org/jane.asc"));
        assert_eq!(info.serial_number().as_deref(), Some("12345678"));
        assert_eq!(info.version(), Some((0x03, 0x04)));
        assert_eq!(info.pw1_retries, 3);
        assert!(info.has_lifecycle_management);
    }

    #[test]
    fn test_empty_text_objects_are_none() {
        assert_eq!(parse_holder_name(b"<<"), None);
        assert_eq!(parse_url(b"   "), None);
    }
}
