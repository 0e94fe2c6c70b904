//! Command processing on top of a transport
//!
//! This module turns a transport that moves exactly one APDU at a time into a
//! request/response channel. Oversized commands are split with ISO/IEC 7816-4
//! command chaining or sent with extended length fields depending on the
//! [`ChainingPolicy`], and multi-part responses (`61 XX`) are drained with
//! GET RESPONSE.

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::{
    Command, Error, Response,
    command::{CLA_CHAINING, MAX_NC_SHORT, MAX_NE_SHORT},
    error::ResultExt,
    transport::SharedTransport,
};

/// INS byte of GET RESPONSE
pub const INS_GET_RESPONSE: u8 = 0xC0;

/// Default bound on GET RESPONSE rounds for one command
pub const DEFAULT_MAX_CHAIN: usize = 64;

/// How commands that do not fit a short APDU reach the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainingPolicy {
    /// The card accepts extended length; commands are sent unchanged
    Extended,
    /// Only short APDUs; larger commands are chained when allowed
    Short {
        /// Whether the card supports command chaining
        chaining: bool,
        /// Largest data field sent in one APDU
        block_size: usize,
    },
    /// Try extended length first and fall back to short APDUs on `67 00`
    ExtendedThenShort {
        /// Largest data field sent in one APDU after the fallback
        block_size: usize,
    },
}

impl ChainingPolicy {
    /// Block size used by applets that keep one byte of headroom
    pub const RESERVED_BLOCK_SIZE: usize = MAX_NC_SHORT - 1;

    /// Derive the policy from card capabilities
    pub const fn from_capabilities(extended_length: bool, chaining: bool) -> Self {
        if extended_length {
            Self::Extended
        } else {
            Self::Short {
                chaining,
                block_size: Self::RESERVED_BLOCK_SIZE,
            }
        }
    }

    /// Short APDUs with chaining and full 255 byte blocks
    pub const fn short_chained() -> Self {
        Self::Short {
            chaining: true,
            block_size: MAX_NC_SHORT,
        }
    }
}

impl Default for ChainingPolicy {
    fn default() -> Self {
        Self::from_capabilities(false, false)
    }
}

/// Request/response channel over a shared transport
#[derive(Debug, Clone)]
pub struct ApduProcessor {
    transport: SharedTransport,
    policy: ChainingPolicy,
    max_chain: usize,
    get_response_cla: u8,
}

impl ApduProcessor {
    /// Create a processor for the given transport and policy
    pub fn new(transport: SharedTransport, policy: ChainingPolicy) -> Self {
        Self {
            transport,
            policy,
            max_chain: DEFAULT_MAX_CHAIN,
            get_response_cla: 0x00,
        }
    }

    /// Set the bound on GET RESPONSE rounds
    pub const fn with_max_chain(mut self, max_chain: usize) -> Self {
        self.max_chain = max_chain;
        self
    }

    /// Replace the chaining policy, e.g. after capabilities were refreshed
    pub const fn set_policy(&mut self, policy: ChainingPolicy) {
        self.policy = policy;
    }

    /// Current chaining policy
    pub const fn policy(&self) -> ChainingPolicy {
        self.policy
    }

    /// The underlying transport
    pub const fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Send one APDU unchanged
    pub fn transceive(&self, command: &Command) -> Result<Response, Error> {
        Ok(self.transport.transceive(command)?)
    }

    /// Full request path: chaining, one `6C XX` retry, then continuation
    pub fn communicate(&self, command: &Command) -> Result<Response, Error> {
        let mut response = self.transceive_with_chaining(command)?;

        if let Some(ne) = response.status().corrected_length() {
            debug!(ne, "Card reported wrong Le, resending with corrected length");
            response = self.transceive_with_chaining(&command.clone().with_ne(ne))?;
        }

        self.read_remaining_response(response)
    }

    /// Send a command according to the chaining policy
    pub fn transceive_with_chaining(&self, command: &Command) -> Result<Response, Error> {
        match self.policy {
            ChainingPolicy::Extended => self.transceive(command),
            ChainingPolicy::Short {
                chaining,
                block_size,
            } => self.transceive_short(command, chaining, block_size),
            ChainingPolicy::ExtendedThenShort { block_size } => {
                let response = self.transceive(&command.clone().with_extended_ne())?;
                if !response.status().is_wrong_length() {
                    return Ok(response);
                }

                debug!("Extended length rejected, retrying with short APDUs");
                self.transceive_short(&command.clone().with_short_ne(), true, block_size)
            }
        }
    }

    fn transceive_short(
        &self,
        command: &Command,
        chaining: bool,
        block_size: usize,
    ) -> Result<Response, Error> {
        if command.nc() <= block_size {
            let ne = command.ne().min(MAX_NE_SHORT);
            return self.transceive(&command.clone().with_ne(ne));
        }

        if !chaining {
            warn!(nc = command.nc(), "Command too long, and chaining unavailable");
            return Err(Error::CommandTooLong { nc: command.nc() });
        }

        let blocks = chain_blocks(command, block_size);
        let total = blocks.len();
        let mut last = None;

        for (i, block) in blocks.iter().enumerate() {
            trace!(index = i + 1, total, "Sending chained block");
            let response = self
                .transceive(block)
                .context(format!("Failed to send chained block {}/{}", i + 1, total))?;

            if i + 1 < total && !response.is_success() {
                return Err(Error::ChainFailed {
                    index: i + 1,
                    total,
                    status: response.status(),
                });
            }
            last = Some(response);
        }

        last.ok_or(Error::CommandTooLong { nc: command.nc() })
    }

    /// Drain a `61 XX` response with GET RESPONSE, concatenating the data
    pub fn read_remaining_response(&self, response: Response) -> Result<Response, Error> {
        if !response.status().is_more_data_available() {
            return Ok(response);
        }

        let mut buffer = BytesMut::from(response.data());
        let mut status = response.status();
        let mut rounds = 0;

        while let Some(ne) = status.remaining_bytes() {
            if rounds == self.max_chain {
                return Err(Error::ChainLimitExceeded);
            }
            rounds += 1;

            let get_response =
                Command::new(self.get_response_cla, INS_GET_RESPONSE, 0x00, 0x00).with_ne(ne);
            let next = self
                .transceive(&get_response)
                .context("Failed to transmit GET RESPONSE command")?;

            buffer.extend_from_slice(next.data());
            status = next.status();
        }

        trace!(rounds, len = buffer.len(), "Assembled chained response");
        Ok(Response::new(buffer.freeze(), status))
    }
}

/// Split a command into ISO/IEC 7816-4 chained blocks
///
/// All blocks but the last carry the chaining class bit and no Le; the last
/// one asks for at most 256 bytes.
pub fn chain_blocks(command: &Command, block_size: usize) -> Vec<Command> {
    let data = command.data_bytes();
    let block_size = block_size.max(1);
    let total = data.len().div_ceil(block_size).max(1);

    (0..total)
        .map(|i| {
            let start = i * block_size;
            let end = (start + block_size).min(data.len());
            let block = command.clone().with_data(data.slice(start..end));

            if i + 1 == total {
                let ne = command.ne().min(MAX_NE_SHORT);
                block.with_ne(ne)
            } else {
                block
                    .with_cla(command.class() | CLA_CHAINING)
                    .with_ne(0)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockTransport, transport::TransportKind};
    use bytes::Bytes;
    use std::sync::Arc;

    fn processor(mock: &Arc<MockTransport>, policy: ChainingPolicy) -> ApduProcessor {
        ApduProcessor::new(mock.clone(), policy)
    }

    #[test]
    fn test_command_too_long_fails_before_any_write() {
        let mock = Arc::new(MockTransport::with_success(TransportKind::UsbCcid));
        let processor = processor(
            &mock,
            ChainingPolicy::Short {
                chaining: false,
                block_size: 8,
            },
        );

        let command = Command::new_with_data(0x00, 0xDA, 0x00, 0x65, vec![0x42; 10]);
        let err = processor.communicate(&command).unwrap_err();

        assert_eq!(err, Error::CommandTooLong { nc: 10 });
        assert_eq!(mock.command_count(), 0);
    }

    #[test]
    fn test_chained_blocks_carry_flag_and_reassemble() {
        let mock = Arc::new(MockTransport::with_success(TransportKind::Nfc));
        let processor = processor(&mock, ChainingPolicy::from_capabilities(false, true));

        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let command = Command::new_with_data(0x00, 0x2A, 0x9E, 0x9A, data.clone()).with_ne(512);
        processor.communicate(&command).unwrap();

        let sent = mock.commands();
        assert_eq!(sent.len(), 3);
        for block in &sent[..2] {
            assert_eq!(block.class() & CLA_CHAINING, CLA_CHAINING);
            assert_eq!(block.ne(), 0);
            assert_eq!(block.nc(), ChainingPolicy::RESERVED_BLOCK_SIZE);
        }
        assert_eq!(sent[2].class() & CLA_CHAINING, 0);
        assert_eq!(sent[2].ne(), MAX_NE_SHORT);

        let reassembled: Vec<u8> = sent.iter().flat_map(|c| c.data().to_vec()).collect();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_intermediate_chain_failure() {
        let mock = Arc::new(MockTransport::new(
            TransportKind::UsbCcid,
            vec![Bytes::from_static(&[0x90, 0x00]), Bytes::from_static(&[0x68, 0x84])],
        ));
        let processor = processor(&mock, ChainingPolicy::from_capabilities(false, true));

        let command = Command::new_with_data(0x00, 0xDB, 0x3F, 0xFF, vec![0x00; 700]);
        let err = processor.communicate(&command).unwrap_err();
        assert!(matches!(err, Error::ChainFailed { index: 2, total: 3, .. }));
        assert_eq!(mock.command_count(), 2);
    }

    #[test]
    fn test_get_response_drains_remaining_data() {
        let mock = Arc::new(MockTransport::new(
            TransportKind::UsbCcid,
            vec![
                Bytes::from_static(&[0x01, 0x02, 0x61, 0x02]),
                Bytes::from_static(&[0x03, 0x04, 0x61, 0x00]),
                Bytes::from_static(&[0x05, 0x90, 0x00]),
            ],
        ));
        let processor = processor(&mock, ChainingPolicy::Extended);

        let response = processor
            .communicate(&Command::new(0x00, 0xCA, 0x00, 0x6E).with_extended_ne())
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.data(), &[0x01, 0x02, 0x03, 0x04, 0x05]);

        let sent = mock.commands();
        assert_eq!(sent[1].instruction(), INS_GET_RESPONSE);
        assert_eq!(sent[1].ne(), 2);
        assert_eq!(sent[2].ne(), 256);
    }

    #[test]
    fn test_get_response_chain_limit() {
        let mock = Arc::new(MockTransport::with_response(
            TransportKind::UsbCcid,
            Bytes::from_static(&[0xAA, 0x61, 0x01]),
        ));
        let processor = processor(&mock, ChainingPolicy::Extended).with_max_chain(3);

        let err = processor
            .communicate(&Command::new(0x00, 0xCA, 0x00, 0x6E))
            .unwrap_err();
        assert_eq!(err, Error::ChainLimitExceeded);
        assert_eq!(mock.command_count(), 4);
    }

    #[test]
    fn test_wrong_le_is_retried_once() {
        let mock = Arc::new(MockTransport::new(
            TransportKind::UsbCcid,
            vec![
                Bytes::from_static(&[0x6C, 0x05]),
                Bytes::from_static(&[0x6C, 0x05]),
            ],
        ));
        let processor = processor(&mock, ChainingPolicy::Extended);

        let response = processor
            .communicate(&Command::new(0x00, 0xB0, 0x00, 0x00).with_ne(2))
            .unwrap();
        assert_eq!(response.sw(), 0x6C05);

        let sent = mock.commands();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].ne(), 5);
    }

    #[test]
    fn test_extended_then_short_fallback() {
        let mock = Arc::new(MockTransport::new(
            TransportKind::Nfc,
            vec![
                Bytes::from_static(&[0x67, 0x00]),
                Bytes::from_static(&[0x55, 0x32, 0x46, 0x90, 0x00]),
            ],
        ));
        let processor = processor(
            &mock,
            ChainingPolicy::ExtendedThenShort {
                block_size: MAX_NC_SHORT,
            },
        );

        let response = processor
            .communicate(&Command::new(0x00, 0x03, 0x00, 0x00))
            .unwrap();
        assert_eq!(response.data(), b"U2F");

        let sent = mock.commands();
        assert_eq!(sent[0].ne(), 65536);
        assert_eq!(sent[1].ne(), 256);
    }

    #[test]
    fn test_chain_blocks_single_block_for_empty_data() {
        let blocks = chain_blocks(&Command::new(0x00, 0x44, 0x00, 0x00), 254);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].class(), 0x00);
    }
}
