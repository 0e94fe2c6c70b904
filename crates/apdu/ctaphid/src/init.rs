//! Channel allocation (CTAPHID_INIT) request and response

use rand::RngCore;

use crate::{
    constants::{
        CAPABILITY_CBOR, CAPABILITY_NMSG, CAPABILITY_WINK, INIT_NONCE_SIZE, INIT_RESPONSE_SIZE,
    },
    error::CtapHidError,
};

/// Random nonce sent with CTAPHID_INIT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitNonce(pub [u8; INIT_NONCE_SIZE]);

impl InitNonce {
    /// Draw a fresh nonce from the thread RNG
    pub fn random() -> Self {
        let mut nonce = [0u8; INIT_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        Self(nonce)
    }

    /// Nonce bytes
    pub const fn as_bytes(&self) -> &[u8; INIT_NONCE_SIZE] {
        &self.0
    }
}

/// Device answer to CTAPHID_INIT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitResponse {
    /// Channel allocated for us
    pub channel_id: u32,
    /// CTAPHID protocol version
    pub protocol_version: u8,
    /// Device major version
    pub version_major: u8,
    /// Device minor version
    pub version_minor: u8,
    /// Device build version
    pub version_build: u8,
    /// Capability flags
    pub capabilities: u8,
}

impl InitResponse {
    /// Parse an INIT payload, requiring it to echo our nonce
    pub fn parse(payload: &[u8], nonce: &InitNonce) -> Result<Self, CtapHidError> {
        if payload.len() < INIT_RESPONSE_SIZE || payload[..INIT_NONCE_SIZE] != nonce.0 {
            return Err(CtapHidError::InvalidInitResponse);
        }

        let body = &payload[INIT_NONCE_SIZE..];
        Ok(Self {
            channel_id: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            protocol_version: body[4],
            version_major: body[5],
            version_minor: body[6],
            version_build: body[7],
            capabilities: body[8],
        })
    }

    /// Whether the device implements WINK
    pub const fn supports_wink(&self) -> bool {
        self.capabilities & CAPABILITY_WINK != 0
    }

    /// Whether the device implements CTAP2 over CBOR
    pub const fn supports_cbor(&self) -> bool {
        self.capabilities & CAPABILITY_CBOR != 0
    }

    /// Whether the device implements U2F messages
    pub const fn supports_msg(&self) -> bool {
        self.capabilities & CAPABILITY_NMSG == 0
    }
}
