//! Capabilities of an OpenPGP card
//!
//! Everything here is parsed from the Application Related Data object
//! (DO 6E): the AID, the historical bytes with the card capabilities, the
//! extended capabilities, PIN status and the key fingerprints.

use iso7816_tlv::ber::{Tlv, Value};

use crate::error::Error;

/// Tags of the data objects parsed here
pub mod tags {
    /// Application identifier
    pub const AID: &[u8] = &[0x4F];
    /// Historical bytes
    pub const HISTORICAL_BYTES: &[u8] = &[0x5F, 0x52];
    /// Extended capabilities
    pub const EXTENDED_CAPABILITIES: &[u8] = &[0xC0];
    /// Algorithm attributes of the signature key
    pub const ALGORITHM_SIGNATURE: &[u8] = &[0xC1];
    /// Algorithm attributes of the decryption key
    pub const ALGORITHM_DECRYPTION: &[u8] = &[0xC2];
    /// Algorithm attributes of the authentication key
    pub const ALGORITHM_AUTHENTICATION: &[u8] = &[0xC3];
    /// PW status bytes
    pub const PW_STATUS: &[u8] = &[0xC4];
    /// Fingerprints of the three keys
    pub const FINGERPRINTS: &[u8] = &[0xC5];
    /// Cardholder name inside the Cardholder Related Data object
    pub const NAME: &[u8] = &[0x5B];
}

/// Depth-first search for a tag in a list of TLVs
pub fn find_tag<'a>(tlvs: &'a [Tlv], tag: &[u8]) -> Option<&'a Tlv> {
    tlvs.iter().find_map(|tlv| {
        if tlv.tag().to_bytes() == tag {
            return Some(tlv);
        }
        match tlv.value() {
            Value::Constructed(children) => find_tag(children, tag),
            Value::Primitive(_) => None,
        }
    })
}

/// Value of a primitive TLV found anywhere below `tlvs`
pub fn find_primitive<'a>(tlvs: &'a [Tlv], tag: &[u8]) -> Option<&'a [u8]> {
    match find_tag(tlvs, tag)?.value() {
        Value::Primitive(value) => Some(value.as_slice()),
        Value::Constructed(_) => None,
    }
}

/// Capabilities announced in the historical bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardCapabilities {
    chaining: bool,
    extended_length: bool,
    lifecycle_management: bool,
}

impl CardCapabilities {
    /// Capabilities for cards that are not selected yet
    pub const fn new(chaining: bool, extended_length: bool, lifecycle_management: bool) -> Self {
        Self {
            chaining,
            extended_length,
            lifecycle_management,
        }
    }

    /// Parse the historical bytes
    ///
    /// The category indicator must be `00`. Compact TLVs follow, the last
    /// three bytes are the status indicator and the status word.
    pub fn from_historical_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 || bytes[0] != 0x00 {
            return Err(Error::InvalidData("Invalid historical bytes category indicator"));
        }

        let status_indicator = bytes[bytes.len() - 3];
        let mut capability_bytes: Option<&[u8]> = None;
        let mut offset = 1;
        while offset < bytes.len() - 3 {
            let tag = bytes[offset] >> 4;
            let len = usize::from(bytes[offset] & 0x0F);
            let end = offset + 1 + len;
            if end > bytes.len() - 3 {
                return Err(Error::InvalidData("Truncated compact TLV in historical bytes"));
            }
            if tag == 0x7 {
                capability_bytes = Some(&bytes[offset + 1..end]);
            }
            offset = end;
        }

        let third = capability_bytes.and_then(|caps| caps.get(2)).copied().unwrap_or(0);
        Ok(Self {
            chaining: third & 0x80 != 0,
            extended_length: third & 0x40 != 0,
            lifecycle_management: matches!(status_indicator, 0x03 | 0x05),
        })
    }

    /// Command chaining supported
    pub const fn has_chaining(&self) -> bool {
        self.chaining
    }

    /// Extended Lc and Le supported
    pub const fn has_extended_length(&self) -> bool {
        self.extended_length
    }

    /// The applet can be terminated and reactivated
    pub const fn has_lifecycle_management(&self) -> bool {
        self.lifecycle_management
    }
}

/// Extended capabilities (DO C0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedCapabilities {
    /// Secure messaging supported
    pub secure_messaging: bool,
    /// GET CHALLENGE supported
    pub get_challenge: bool,
    /// Key import supported
    pub key_import: bool,
    /// PW status byte can be changed
    pub pw_status_changeable: bool,
    /// Algorithm attributes can be changed
    pub algorithm_attributes_changeable: bool,
    /// Secure messaging algorithm, 0 if none
    pub secure_messaging_algorithm: u8,
    /// Largest GET CHALLENGE length
    pub max_challenge_length: u16,
    /// Largest cardholder certificate length
    pub max_certificate_length: u16,
}

impl ExtendedCapabilities {
    /// Parse the value of DO C0
    pub fn parse(value: &[u8]) -> Result<Self, Error> {
        if value.len() < 6 {
            return Err(Error::InvalidData("Extended capabilities too short"));
        }
        let flags = value[0];
        Ok(Self {
            secure_messaging: flags & 0x80 != 0,
            get_challenge: flags & 0x40 != 0,
            key_import: flags & 0x20 != 0,
            pw_status_changeable: flags & 0x10 != 0,
            algorithm_attributes_changeable: flags & 0x04 != 0,
            secure_messaging_algorithm: value[1],
            max_challenge_length: u16::from_be_bytes([value[2], value[3]]),
            max_certificate_length: u16::from_be_bytes([value[4], value[5]]),
        })
    }
}

/// PW status bytes (DO C4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwStatus {
    /// PW1 stays valid for more than one PSO:CDS
    pub pw1_valid_for_multiple_signatures: bool,
    /// Largest PW1 length
    pub pw1_max_length: u8,
    /// Largest resetting code length
    pub rc_max_length: u8,
    /// Largest PW3 length
    pub pw3_max_length: u8,
    /// PW1 attempts left
    pub pw1_retries: u8,
    /// Resetting code attempts left
    pub rc_retries: u8,
    /// PW3 attempts left
    pub pw3_retries: u8,
}

impl PwStatus {
    /// Parse the value of DO C4
    pub fn parse(value: &[u8]) -> Result<Self, Error> {
        let &[validity, pw1_max, rc_max, pw3_max, pw1, rc, pw3, ..] = value else {
            return Err(Error::InvalidData("PW status bytes too short"));
        };
        Ok(Self {
            pw1_valid_for_multiple_signatures: validity == 0x01,
            pw1_max_length: pw1_max,
            rc_max_length: rc_max,
            pw3_max_length: pw3_max,
            pw1_retries: pw1,
            rc_retries: rc,
            pw3_retries: pw3,
        })
    }
}

/// Algorithm attributes of one key slot (DO C1, C2, C3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmAttributes {
    /// RSA
    Rsa {
        /// Modulus length in bits
        modulus_bits: u16,
        /// Public exponent length in bits
        exponent_bits: u16,
        /// Import format
        import_format: u8,
    },
    /// ECDH, ECDSA or EdDSA on a named curve
    Ecc {
        /// Algorithm id (0x12 ECDH, 0x13 ECDSA, 0x16 EdDSA)
        algorithm: u8,
        /// Curve OID
        oid: Vec<u8>,
    },
    /// Anything else, kept raw
    Other(Vec<u8>),
}

impl AlgorithmAttributes {
    /// Algorithm id of RSA
    pub const RSA: u8 = 0x01;
    /// Algorithm id of ECDH
    pub const ECDH: u8 = 0x12;
    /// Algorithm id of ECDSA
    pub const ECDSA: u8 = 0x13;
    /// Algorithm id of EdDSA
    pub const EDDSA: u8 = 0x16;

    /// Parse the value of DO C1, C2 or C3
    pub fn parse(value: &[u8]) -> Result<Self, Error> {
        match value {
            [] => Err(Error::InvalidData("Empty algorithm attributes")),
            &[Self::RSA, n1, n2, e1, e2, ref rest @ ..] => Ok(Self::Rsa {
                modulus_bits: u16::from_be_bytes([n1, n2]),
                exponent_bits: u16::from_be_bytes([e1, e2]),
                import_format: rest.first().copied().unwrap_or(0),
            }),
            [algorithm @ (Self::ECDH | Self::ECDSA | Self::EDDSA), oid @ ..] => {
                // A trailing 0xFF marks public key import
                let oid = oid.strip_suffix(&[0xFF]).unwrap_or(oid);
                Ok(Self::Ecc {
                    algorithm: *algorithm,
                    oid: oid.to_vec(),
                })
            }
            other => Ok(Self::Other(other.to_vec())),
        }
    }
}

/// Fingerprint of one key, all zero when the slot is empty
pub type Fingerprint = [u8; 20];

/// Fingerprints of the signature, decryption and authentication keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fingerprints {
    /// Signature key
    pub signature: Option<Fingerprint>,
    /// Decryption key
    pub decryption: Option<Fingerprint>,
    /// Authentication key
    pub authentication: Option<Fingerprint>,
}

impl Fingerprints {
    /// Parse the value of DO C5
    pub fn parse(value: &[u8]) -> Result<Self, Error> {
        if value.len() < 60 {
            return Err(Error::InvalidData("Fingerprints too short"));
        }
        let slot = |i: usize| -> Option<Fingerprint> {
            let mut fingerprint = [0u8; 20];
            fingerprint.copy_from_slice(&value[i * 20..(i + 1) * 20]);
            fingerprint.iter().any(|b| *b != 0).then_some(fingerprint)
        };
        Ok(Self {
            signature: slot(0),
            decryption: slot(1),
            authentication: slot(2),
        })
    }
}

/// Everything learned from the Application Related Data object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPgpCapabilities {
    aid: Vec<u8>,
    historical_bytes: Vec<u8>,
    card_capabilities: CardCapabilities,
    extended_capabilities: Option<ExtendedCapabilities>,
    pw_status: Option<PwStatus>,
    fingerprints: Fingerprints,
    algorithm_attributes: [Option<AlgorithmAttributes>; 3],
}

impl OpenPgpCapabilities {
    /// Parse the content of DO 6E
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let tlvs = Tlv::parse_all(data);
        if tlvs.is_empty() {
            return Err(Error::InvalidData("Empty application related data"));
        }

        let aid = find_primitive(&tlvs, tags::AID)
            .ok_or(Error::InvalidData("Application related data without AID"))?
            .to_vec();
        let historical_bytes = find_primitive(&tlvs, tags::HISTORICAL_BYTES)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let card_capabilities = if historical_bytes.is_empty() {
            CardCapabilities::default()
        } else {
            CardCapabilities::from_historical_bytes(&historical_bytes)?
        };

        let extended_capabilities = find_primitive(&tlvs, tags::EXTENDED_CAPABILITIES)
            .map(ExtendedCapabilities::parse)
            .transpose()?;
        let pw_status = find_primitive(&tlvs, tags::PW_STATUS).map(PwStatus::parse).transpose()?;
        let fingerprints = find_primitive(&tlvs, tags::FINGERPRINTS)
            .map(Fingerprints::parse)
            .transpose()?
            .unwrap_or_default();

        let attributes = |tag| find_primitive(&tlvs, tag).map(AlgorithmAttributes::parse).transpose();
        let algorithm_attributes = [
            attributes(tags::ALGORITHM_SIGNATURE)?,
            attributes(tags::ALGORITHM_DECRYPTION)?,
            attributes(tags::ALGORITHM_AUTHENTICATION)?,
        ];

        Ok(Self {
            aid,
            historical_bytes,
            card_capabilities,
            extended_capabilities,
            pw_status,
            fingerprints,
            algorithm_attributes,
        })
    }

    /// Full AID of the selected applet
    pub fn aid(&self) -> &[u8] {
        &self.aid
    }

    /// Raw historical bytes
    pub fn historical_bytes(&self) -> &[u8] {
        &self.historical_bytes
    }

    /// Capabilities from the historical bytes
    pub const fn card_capabilities(&self) -> CardCapabilities {
        self.card_capabilities
    }

    /// Extended capabilities, if announced
    pub const fn extended_capabilities(&self) -> Option<&ExtendedCapabilities> {
        self.extended_capabilities.as_ref()
    }

    /// PW status bytes, if announced
    pub const fn pw_status(&self) -> Option<&PwStatus> {
        self.pw_status.as_ref()
    }

    /// Key fingerprints
    pub const fn fingerprints(&self) -> &Fingerprints {
        &self.fingerprints
    }

    /// Algorithm attributes of the signature, decryption and authentication key
    pub const fn algorithm_attributes(&self) -> &[Option<AlgorithmAttributes>; 3] {
        &self.algorithm_attributes
    }

    /// Whether the applet offers secure messaging
    pub fn has_secure_messaging(&self) -> bool {
        self.extended_capabilities.is_some_and(|caps| caps.secure_messaging)
    }

    /// Whether PW1 stays valid after one signature
    pub fn pw1_valid_for_multiple_signatures(&self) -> bool {
        self.pw_status.is_some_and(|pw| pw.pw1_valid_for_multiple_signatures)
    }

    /// PW1 attempts left
    pub fn pw1_retries(&self) -> Option<u8> {
        self.pw_status.map(|pw| pw.pw1_retries)
    }

    /// PW3 attempts left
    pub fn pw3_retries(&self) -> Option<u8> {
        self.pw_status.map(|pw| pw.pw3_retries)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hex::decode;

    /// Application related data of a key with signature and decryption keys
    pub(crate) const APPLICATION_RELATED_DATA: &str = concat!(
        "6E81B0",
        "4F10D2760001240103040006123456780000",
        "5F520A0031F573C00160059000",
        "73818E",
        "C00A7D000BFE080000FF0000",
        "C106010800001100",
        "C206010800001100",
        "C30A162B06010401DA470F01",
        "C40700202020030003",
        "C53C",
        "1111111111111111111111111111111111111111",
        "2222222222222222222222222222222222222222",
        "0000000000000000000000000000000000000000",
        "C60F",
        "000000000000000000000000000000",
        "CD0C",
        "000000000000000000000000",
    );

    #[test]
    fn test_historical_bytes() {
        let caps = CardCapabilities::from_historical_bytes(&decode("0031F573C00160009000").unwrap())
            .unwrap();
        assert!(!caps.has_chaining());
        assert!(caps.has_extended_length());
        assert!(!caps.has_lifecycle_management());

        let caps = CardCapabilities::from_historical_bytes(&decode("00730000E0059000").unwrap())
            .unwrap();
        assert!(caps.has_chaining());
        assert!(caps.has_extended_length());
        assert!(caps.has_lifecycle_management());

        assert!(CardCapabilities::from_historical_bytes(&decode("80730000E0059000").unwrap()).is_err());
    }

    #[test]
    fn test_parse_application_related_data() {
        let caps = OpenPgpCapabilities::parse(&decode(APPLICATION_RELATED_DATA).unwrap()).unwrap();

        assert_eq!(caps.aid(), decode("D2760001240103040006123456780000").unwrap());
        assert!(caps.card_capabilities().has_extended_length());
        assert!(caps.card_capabilities().has_lifecycle_management());
        assert!(!caps.has_secure_messaging());
        assert!(!caps.pw1_valid_for_multiple_signatures());
        assert_eq!(caps.pw1_retries(), Some(3));
        assert_eq!(caps.pw3_retries(), Some(3));

        let fingerprints = caps.fingerprints();
        assert_eq!(fingerprints.signature, Some([0x11; 20]));
        assert_eq!(fingerprints.decryption, Some([0x22; 20]));
        assert_eq!(fingerprints.authentication, None);

        assert_eq!(
            caps.algorithm_attributes()[0],
            Some(AlgorithmAttributes::Rsa {
                modulus_bits: 2048,
                exponent_bits: 17,
                import_format: 0,
            })
        );
        assert!(matches!(
            &caps.algorithm_attributes()[2],
            Some(AlgorithmAttributes::Ecc { algorithm: AlgorithmAttributes::EDDSA, .. })
        ));
    }

    #[test]
    fn test_algorithm_attributes() {
        let eddsa = AlgorithmAttributes::parse(&decode("162B06010401DA470F01").unwrap()).unwrap();
        assert_eq!(
            eddsa,
            AlgorithmAttributes::Ecc {
                algorithm: AlgorithmAttributes::EDDSA,
                oid: decode("2B06010401DA470F01").unwrap(),
            }
        );

        let with_import = AlgorithmAttributes::parse(&decode("132A8648CE3D030107FF").unwrap()).unwrap();
        assert!(matches!(with_import, AlgorithmAttributes::Ecc { ref oid, .. } if oid.len() == 8));
    }

    #[test]
    fn test_missing_aid_is_rejected() {
        assert!(matches!(
            OpenPgpCapabilities::parse(&decode("6E03C10101").unwrap()),
            Err(Error::InvalidData(_))
        ));
    }
}
