//! APDU response definitions
//!
//! This module provides the response value type according to ISO/IEC 7816-4:
//! an optional data field followed by the two status bytes.

pub mod status;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;
use status::StatusWord;

/// Basic APDU response structure
#[derive(Clone, PartialEq, Eq)]
pub struct Response {
    /// Response data field
    data: Bytes,
    /// Status word
    status: StatusWord,
}

impl Response {
    /// Create a new response with data and status
    pub fn new(data: impl Into<Bytes>, status: impl Into<StatusWord>) -> Self {
        Self {
            data: data.into(),
            status: status.into(),
        }
    }

    /// Create a success (90 00) response
    pub fn success(data: impl Into<Bytes>) -> Self {
        Self::new(data, status::common::SUCCESS)
    }

    /// Parse a response from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 2 {
            return Err(Error::parse("Response must be at least 2 bytes long"));
        }

        let split = bytes.len() - 2;
        Ok(Self {
            data: Bytes::copy_from_slice(&bytes[..split]),
            status: StatusWord::new(bytes[split], bytes[split + 1]),
        })
    }

    /// Encode the response as raw bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.data.len() + 2);
        buffer.put_slice(&self.data);
        buffer.put_u8(self.status.sw1);
        buffer.put_u8(self.status.sw2);
        buffer.freeze()
    }

    /// Response data field
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Response data field as shared bytes
    pub const fn data_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Consume the response, keeping the data field
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Status word
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Status word as a u16
    pub const fn sw(&self) -> u16 {
        self.status.to_u16()
    }

    /// Check if the response indicates success
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("data", &hex::encode(&self.data))
            .field("status", &format_args!("{}", self.status))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_from_bytes() {
        let response = Response::from_bytes(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(response.data(), &[0x01, 0x02]);
        assert_eq!(response.sw(), 0x9000);
        assert!(response.is_success());

        let status_only = Response::from_bytes(&[0x6A, 0x82]).unwrap();
        assert!(status_only.data().is_empty());
        assert!(status_only.status().is_file_not_found());
    }

    #[test]
    fn test_response_too_short() {
        assert!(Response::from_bytes(&[0x90]).is_err());
        assert!(Response::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_response_to_bytes_appends_status() {
        let response = Response::new(vec![0xAA], (0x61, 0x10));
        assert_eq!(response.to_bytes().as_ref(), &[0xAA, 0x61, 0x10]);
    }
}
