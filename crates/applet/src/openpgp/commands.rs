//! OpenPGP card command builders

use hwkey_apdu_core::{Command, command::MAX_NE_EXTENDED};

pub use crate::select::select_command as select;

/// Instruction bytes used by the OpenPGP card applet
pub mod ins {
    /// VERIFY
    pub const VERIFY: u8 = 0x20;
    /// ACTIVATE FILE
    pub const ACTIVATE_FILE: u8 = 0x44;
    /// GENERATE ASYMMETRIC KEY PAIR, used to read public keys
    pub const GENERATE_ASYMMETRIC_KEY_PAIR: u8 = 0x47;
    /// GET DATA
    pub const GET_DATA: u8 = 0xCA;
    /// PUT DATA
    pub const PUT_DATA: u8 = 0xDA;
}

/// Data objects read and written through GET DATA / PUT DATA
pub mod data_object {
    /// Cardholder related data
    pub const CARDHOLDER_RELATED_DATA: u16 = 0x0065;
    /// Application related data
    pub const APPLICATION_RELATED_DATA: u16 = 0x006E;
    /// URL of the public key
    pub const URL: u16 = 0x5F50;
}

/// PIN addressed by VERIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PinReference {
    /// PW1 for PSO:CDS
    Pw1Signature = 0x81,
    /// PW1 for the other operations
    Pw1Other = 0x82,
    /// PW3, the admin PIN
    Pw3 = 0x83,
}

/// Key slot addressed by its control reference template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeySlot {
    /// Digital signature key
    Signature = 0xB6,
    /// Decryption key
    Decryption = 0xB8,
    /// Authentication key
    Authentication = 0xA4,
}

/// GET DATA for a data object
pub fn get_data(data_object: u16) -> Command {
    let [p1, p2] = data_object.to_be_bytes();
    Command::new(0x00, ins::GET_DATA, p1, p2).with_ne(MAX_NE_EXTENDED)
}

/// PUT DATA for a data object
pub fn put_data(data_object: u16, data: &[u8]) -> Command {
    let [p1, p2] = data_object.to_be_bytes();
    Command::new_with_data(0x00, ins::PUT_DATA, p1, p2, data.to_vec())
}

/// VERIFY with the given PIN
///
/// The command carries the PIN; wipe it once it has been sent.
pub fn verify(pin: PinReference, secret: &[u8]) -> Command {
    Command::new_with_data(0x00, ins::VERIFY, 0x00, pin as u8, secret.to_vec())
}

/// ACTIVATE FILE, used to bring a terminated applet back
pub const fn activate_file() -> Command {
    Command::new(0x00, ins::ACTIVATE_FILE, 0x00, 0x00)
}

/// Read the public key of a slot
pub fn read_public_key(slot: KeySlot) -> Command {
    Command::new_with_data(0x00, ins::GENERATE_ASYMMETRIC_KEY_PAIR, 0x81, 0x00, vec![slot as u8, 0x00])
        .with_ne(MAX_NE_EXTENDED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex::decode;

    #[test]
    fn test_get_data_asks_for_extended_response() {
        let command = get_data(data_object::APPLICATION_RELATED_DATA);
        assert_eq!(command.to_bytes().as_ref(), decode("00CA006E000000").unwrap());

        let command = get_data(data_object::URL);
        assert!(command.matches_header(0x00, 0xCA, 0x5F, 0x50));
    }

    #[test]
    fn test_verify_and_read_public_key() {
        let command = verify(PinReference::Pw1Signature, b"123456");
        assert_eq!(command.to_bytes().as_ref(), decode("0020008106313233343536").unwrap());

        let command = read_public_key(KeySlot::Decryption);
        assert_eq!(command.to_bytes().as_ref(), decode("00478100000002B8000000").unwrap());
    }
}
