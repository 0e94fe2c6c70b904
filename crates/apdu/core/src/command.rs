//! APDU command definitions
//!
//! This module provides the command value type and its ISO/IEC 7816-4 encoding.
//! Short and extended length fields are chosen from the data length (Nc) and
//! the expected response length (Ne).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

/// Largest data field a short APDU can carry
pub const MAX_NC_SHORT: usize = 255;

/// Largest data field an extended APDU can carry
pub const MAX_NC_EXTENDED: usize = 65535;

/// Largest expected response length a short APDU can announce
pub const MAX_NE_SHORT: usize = 256;

/// Largest expected response length an extended APDU can announce
pub const MAX_NE_EXTENDED: usize = 65536;

/// Class bit marking every block of a chained command except the last
pub const CLA_CHAINING: u8 = 0x10;

/// An APDU command
///
/// `ne == 0` means that no Le field is sent.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Bytes,
    ne: usize,
}

impl Command {
    /// Create a case 1 command (header only)
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Bytes::new(),
            ne: 0,
        }
    }

    /// Create a command with a data field
    pub fn new_with_data(cla: u8, ins: u8, p1: u8, p2: u8, data: impl Into<Bytes>) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data)
    }

    /// Replace the data field
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Replace the expected response length, clamped to the extended maximum
    pub fn with_ne(mut self, ne: usize) -> Self {
        self.ne = ne.min(MAX_NE_EXTENDED);
        self
    }

    /// Ask for up to 256 response bytes unless Ne is already set
    pub fn with_short_ne(self) -> Self {
        if self.ne == 0 {
            self.with_ne(MAX_NE_SHORT)
        } else {
            self
        }
    }

    /// Ask for up to 65536 response bytes unless Ne is already set
    pub fn with_extended_ne(self) -> Self {
        if self.ne == 0 {
            self.with_ne(MAX_NE_EXTENDED)
        } else {
            self
        }
    }

    /// Ask for up to 65536 response bytes regardless of the current Ne
    pub fn with_forced_extended_ne(self) -> Self {
        self.with_ne(MAX_NE_EXTENDED)
    }

    /// Replace the class byte
    pub fn with_cla(mut self, cla: u8) -> Self {
        self.cla = cla;
        self
    }

    /// Command class (CLA)
    pub const fn class(&self) -> u8 {
        self.cla
    }

    /// Instruction code (INS)
    pub const fn instruction(&self) -> u8 {
        self.ins
    }

    /// First parameter (P1)
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    /// Second parameter (P2)
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Command data field
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Command data field as shared bytes
    pub const fn data_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Consume the command, keeping the data field
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Data length (Nc)
    pub fn nc(&self) -> usize {
        self.data.len()
    }

    /// Expected response length (Ne), 0 when absent
    pub const fn ne(&self) -> usize {
        self.ne
    }

    /// Whether the command needs extended length fields
    pub fn is_extended(&self) -> bool {
        self.nc() > MAX_NC_SHORT || self.ne > MAX_NE_SHORT
    }

    /// Whether the command matches the given header
    pub const fn matches_header(&self, cla: u8, ins: u8, p1: u8, p2: u8) -> bool {
        self.cla == cla && self.ins == ins && self.p1 == p1 && self.p2 == p2
    }

    /// Encode the command as raw APDU bytes
    pub fn to_bytes(&self) -> Bytes {
        let extended = self.is_extended();
        let mut buffer = BytesMut::with_capacity(4 + 3 + self.nc() + 3);

        buffer.put_u8(self.cla);
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);

        if !self.data.is_empty() {
            if extended {
                buffer.put_u8(0x00);
                buffer.put_u16(self.nc() as u16);
            } else {
                buffer.put_u8(self.nc() as u8);
            }
            buffer.put_slice(&self.data);
        }

        if self.ne != 0 {
            if extended {
                // Case 2E carries a leading zero, case 4E shares the one in Lc
                if self.data.is_empty() {
                    buffer.put_u8(0x00);
                }
                buffer.put_u16(if self.ne == MAX_NE_EXTENDED {
                    0
                } else {
                    self.ne as u16
                });
            } else {
                buffer.put_u8(if self.ne == MAX_NE_SHORT {
                    0
                } else {
                    self.ne as u8
                });
            }
        }

        buffer.freeze()
    }

    /// Parse a command from raw APDU bytes
    pub fn from_bytes(apdu: &[u8]) -> Result<Self, Error> {
        if apdu.len() < 4 {
            return Err(Error::parse("APDU must be at least 4 bytes long"));
        }

        let header = Self::new(apdu[0], apdu[1], apdu[2], apdu[3]);
        let body = &apdu[4..];

        let (data, ne) = match body.len() {
            // Case 1
            0 => (&[][..], 0),
            // Case 2S
            1 => (&[][..], short_le(body[0])),
            _ if body[0] != 0 => {
                let nc = body[0] as usize;
                match body.len() - 1 {
                    // Case 3S
                    n if n == nc => (&body[1..], 0),
                    // Case 4S
                    n if n == nc + 1 => (&body[1..=nc], short_le(body[nc + 1])),
                    _ => return Err(Error::parse("Short APDU length mismatch")),
                }
            }
            // Case 2E
            3 => (&[][..], extended_le(body[1], body[2])),
            n if n > 3 => {
                let nc = u16::from_be_bytes([body[1], body[2]]) as usize;
                match n - 3 {
                    // Case 3E
                    m if m == nc => (&body[3..], 0),
                    // Case 4E
                    m if m == nc + 2 => (
                        &body[3..3 + nc],
                        extended_le(body[3 + nc], body[4 + nc]),
                    ),
                    _ => return Err(Error::parse("Extended APDU length mismatch")),
                }
            }
            _ => return Err(Error::parse("Malformed APDU length field")),
        };

        Ok(header.with_data(Bytes::copy_from_slice(data)).with_ne(ne))
    }
}

const fn short_le(le: u8) -> usize {
    if le == 0 { MAX_NE_SHORT } else { le as usize }
}

const fn extended_le(hi: u8, lo: u8) -> usize {
    let le = ((hi as usize) << 8) | lo as usize;
    if le == 0 { MAX_NE_EXTENDED } else { le }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("cla", &format_args!("{:#04x}", self.cla))
            .field("ins", &format_args!("{:#04x}", self.ins))
            .field("p1", &format_args!("{:#04x}", self.p1))
            .field("p2", &format_args!("{:#04x}", self.p2))
            .field("nc", &self.nc())
            .field("ne", &self.ne)
            .finish()
    }
}

/// Instructions whose data field holds a PIN: VERIFY, CHANGE REFERENCE DATA
/// and RESET RETRY COUNTER
const SECRET_INSTRUCTIONS: [u8; 3] = [0x20, 0x24, 0x2C];

impl Command {
    /// Whether the data field holds a PIN and must not be logged
    pub fn carries_secret(&self) -> bool {
        SECRET_INSTRUCTIONS.contains(&self.ins)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}{:02x}", self.cla, self.ins, self.p1, self.p2)?;
        if !self.data.is_empty() {
            if self.carries_secret() {
                write!(f, " nc={} <redacted>", self.nc())?;
            } else {
                write!(f, " nc={} {}", self.nc(), hex::encode(&self.data))?;
            }
        }
        if self.ne > 0 {
            write!(f, " ne={}", self.ne)?;
        }
        Ok(())
    }
}
