//! CTAPHID protocol engine
//!
//! Negotiates a private channel, then exchanges framed messages on it. Writes
//! and reads each run on their own deadline-bounded operation.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    constants::{
        BROADCAST_CHANNEL, CTAPHID_CBOR, CTAPHID_INIT, CTAPHID_MSG, CTAPHID_PING, CTAPHID_WINK,
        HID_PACKET_SIZE,
    },
    error::CtapHidError,
    frame::{self, InitHeader},
    init::{InitNonce, InitResponse},
    link::{HidLink, Packet},
    runner::{read_packet_interruptible, run_with_timeout},
};

/// Deadlines for the three kinds of link operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtapHidTimeouts {
    /// Channel negotiation (default 850 ms)
    pub negotiation: Duration,
    /// Reading one response frame (default 2 s)
    pub read: Duration,
    /// Writing one request frame (default 1 s)
    pub write: Duration,
}

impl Default for CtapHidTimeouts {
    fn default() -> Self {
        Self {
            negotiation: Duration::from_millis(850),
            read: Duration::from_millis(2000),
            write: Duration::from_millis(1000),
        }
    }
}

impl CtapHidTimeouts {
    /// Set the negotiation deadline
    pub const fn with_negotiation(mut self, timeout: Duration) -> Self {
        self.negotiation = timeout;
        self
    }

    /// Set the read deadline
    pub const fn with_read(mut self, timeout: Duration) -> Self {
        self.read = timeout;
        self
    }

    /// Set the write deadline
    pub const fn with_write(mut self, timeout: Duration) -> Self {
        self.write = timeout;
        self
    }
}

/// CTAPHID session on one HID link
#[derive(Debug)]
pub struct CtapHidProtocol {
    link: Arc<dyn HidLink>,
    timeouts: CtapHidTimeouts,
    channel_id: AtomicU32,
    init: Mutex<Option<InitResponse>>,
}

impl CtapHidProtocol {
    /// Create a session that still sits on the broadcast channel
    pub fn new(link: Arc<dyn HidLink>, timeouts: CtapHidTimeouts) -> Self {
        Self {
            link,
            timeouts,
            channel_id: AtomicU32::new(BROADCAST_CHANNEL),
            init: Mutex::new(None),
        }
    }

    /// The underlying link
    pub const fn link(&self) -> &Arc<dyn HidLink> {
        &self.link
    }

    /// Channel in use, the broadcast channel until [`connect`](Self::connect) succeeds
    pub fn channel_id(&self) -> u32 {
        self.channel_id.load(Ordering::Acquire)
    }

    /// Device information from the last successful negotiation
    pub fn init_response(&self) -> Option<InitResponse> {
        *self.init.lock()
    }

    /// Negotiate a private channel with a fresh random nonce
    pub fn connect(&self) -> Result<InitResponse, CtapHidError> {
        self.connect_with_nonce(InitNonce::random())
    }

    /// Negotiate a private channel with the given nonce
    pub fn connect_with_nonce(&self, nonce: InitNonce) -> Result<InitResponse, CtapHidError> {
        debug!("Initializing CTAPHID transport");

        let request = frame::wrap_frame(BROADCAST_CHANNEL, CTAPHID_INIT, nonce.as_bytes())?;
        self.write_frame(request)?;

        let response = run_with_timeout(&self.link, self.timeouts.negotiation, move |interrupt, request| {
            loop {
                let packet = read_packet_interruptible(interrupt, request)?;
                match parse_init_packet(&packet, &nonce) {
                    Ok(response) => return Ok(response),
                    Err(e) => trace!(error = %e, "Ignoring unrelated INIT response"),
                }
            }
        })?;

        debug!(
            channel_id = format_args!("{:#010x}", response.channel_id),
            version = format_args!(
                "{}.{}.{}",
                response.version_major, response.version_minor, response.version_build
            ),
            capabilities = response.capabilities,
            "CTAPHID_INIT response"
        );

        self.channel_id.store(response.channel_id, Ordering::Release);
        *self.init.lock() = Some(response);
        Ok(response)
    }

    /// Exchange a U2F/APDU message
    pub fn transceive(&self, payload: &[u8]) -> Result<Bytes, CtapHidError> {
        self.exchange(CTAPHID_MSG, payload, false)
    }

    /// Exchange a CTAP2 CBOR message, skipping keepalives
    pub fn transceive_cbor(&self, payload: &[u8]) -> Result<Bytes, CtapHidError> {
        self.exchange(CTAPHID_CBOR, payload, true)
    }

    /// Echo a payload through the device
    pub fn ping(&self, payload: &[u8]) -> Result<Bytes, CtapHidError> {
        self.exchange(CTAPHID_PING, payload, false)
    }

    /// Ask the device to identify itself
    pub fn wink(&self) -> Result<(), CtapHidError> {
        self.exchange(CTAPHID_WINK, &[], false).map(drop)
    }

    fn exchange(
        &self,
        command: u8,
        payload: &[u8],
        skip_keepalive: bool,
    ) -> Result<Bytes, CtapHidError> {
        let channel_id = self.channel_id();
        self.write_frame(frame::wrap_frame(channel_id, command, payload)?)?;

        loop {
            let response = self.read_frame()?;
            if skip_keepalive
                && let Some(status) = frame::keepalive_status(&response)
            {
                debug!(%status, "Received keepalive packet, waiting for response");
                continue;
            }
            return frame::unwrap_frame(channel_id, command, &response);
        }
    }

    fn write_frame(&self, frame: Bytes) -> Result<(), CtapHidError> {
        run_with_timeout(&self.link, self.timeouts.write, move |interrupt, request| {
            for chunk in frame.chunks(HID_PACKET_SIZE) {
                interrupt.check()?;
                let mut packet: Packet = [0; HID_PACKET_SIZE];
                packet.copy_from_slice(chunk);
                request.write_packet(&packet)?;
            }
            Ok(())
        })
    }

    fn read_frame(&self) -> Result<Bytes, CtapHidError> {
        let channel_id = self.channel_id();
        run_with_timeout(&self.link, self.timeouts.read, move |interrupt, request| {
            // Wait for an initialization packet on our channel
            let (first, expected) = loop {
                let packet = read_packet_interruptible(interrupt, request)?;
                match frame::expected_packets(channel_id, &packet) {
                    Ok(expected) => break (packet, expected),
                    Err(CtapHidError::ChangedChannel { actual, .. }) => {
                        trace!(
                            channel = format_args!("{actual:#010x}"),
                            "Received message from wrong channel, ignoring"
                        );
                    }
                    Err(e) => return Err(e),
                }
            };

            // Continuations must follow on the same channel, in order
            let header = InitHeader::parse(&first)?;
            let mut data = BytesMut::with_capacity(expected * HID_PACKET_SIZE);
            data.put_slice(&first);
            for seq in 0..expected - 1 {
                let packet = read_packet_interruptible(interrupt, request)?;
                frame::check_continuation(header.channel_id, seq, &packet)?;
                data.put_slice(&packet);
            }
            Ok(data.freeze())
        })
    }
}

fn parse_init_packet(packet: &Packet, nonce: &InitNonce) -> Result<InitResponse, CtapHidError> {
    let header = InitHeader::parse(packet)?;
    if header.channel_id != BROADCAST_CHANNEL {
        return Err(CtapHidError::ChangedChannel {
            expected: BROADCAST_CHANNEL,
            actual: header.channel_id,
        });
    }

    let payload = frame::unwrap_frame(BROADCAST_CHANNEL, CTAPHID_INIT, packet)?;
    InitResponse::parse(&payload, nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SimulatedDevice;
    use hex::decode;

    const CHANNEL_ID: u32 = 0x0000_0042;

    fn fast_timeouts() -> CtapHidTimeouts {
        CtapHidTimeouts::default()
            .with_negotiation(Duration::from_millis(200))
            .with_read(Duration::from_millis(300))
            .with_write(Duration::from_millis(300))
    }

    fn connected(device: &Arc<SimulatedDevice>) -> CtapHidProtocol {
        let protocol = CtapHidProtocol::new(device.clone(), fast_timeouts());
        protocol.connect().unwrap();
        protocol
    }

    #[test]
    fn test_connect_adopts_channel() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        let protocol = CtapHidProtocol::new(device.clone(), fast_timeouts());
        assert_eq!(protocol.channel_id(), BROADCAST_CHANNEL);

        let nonce = InitNonce(decode("0102030405060708").unwrap().try_into().unwrap());
        let response = protocol.connect_with_nonce(nonce).unwrap();

        assert_eq!(protocol.channel_id(), 0x42);
        assert_eq!(response.protocol_version, 2);
        assert_eq!(
            (response.version_major, response.version_minor, response.version_build),
            (7, 1, 3)
        );
        assert_eq!(device.open_requests(), 0);
    }

    #[test]
    fn test_connect_ignores_leading_garbage() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        device.queue_init_garbage(decode("0102030405060708").unwrap());
        device.queue_init_garbage(decode("0807060504030201").unwrap());

        let protocol = connected(&device);
        assert_eq!(protocol.channel_id(), CHANNEL_ID);
    }

    #[test]
    fn test_connect_with_wrong_nonce_times_out() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        device.set_corrupt_nonce(true);

        let protocol = CtapHidProtocol::new(device.clone(), fast_timeouts());
        assert_eq!(protocol.connect(), Err(CtapHidError::Timeout));
        assert_eq!(protocol.channel_id(), BROADCAST_CHANNEL);
    }

    #[test]
    fn test_transceive_short() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        device.set_handler(|_, data| {
            assert_eq!(data, decode("1a2b3d4e5f").unwrap().as_slice());
            decode("5f4e3d2c1b").unwrap()
        });

        let protocol = connected(&device);
        let response = protocol.transceive(&decode("1a2b3d4e5f").unwrap()).unwrap();
        assert_eq!(response.as_ref(), decode("5f4e3d2c1b").unwrap().as_slice());
    }

    #[test]
    fn test_transceive_long() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        device.set_handler(|_, data| {
            assert_eq!(data.len(), 200);
            vec![0; 199]
        });

        let protocol = connected(&device);
        let response = protocol.transceive(&[0; 200]).unwrap();
        assert_eq!(response.len(), 199);
    }

    #[test]
    fn test_transceive_cbor_skips_keepalives() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        device.set_keepalives(3);
        device.set_handler(|command, _| {
            assert_eq!(command, CTAPHID_CBOR);
            vec![0x00, 0xA1, 0x01, 0x02]
        });

        let protocol = connected(&device);
        let response = protocol.transceive_cbor(&[0x04]).unwrap();
        assert_eq!(response.as_ref(), &[0x00, 0xA1, 0x01, 0x02]);
    }

    #[test]
    fn test_frames_from_other_channels_are_ignored() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        device.set_foreign_frames(2);
        device.set_handler(|_, data| data.to_vec());

        let protocol = connected(&device);
        assert_eq!(protocol.ping(b"hello").unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_stray_continuation_fails_without_reading_the_rest() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        device.set_handler(|_, _| vec![0; 199]);
        device.set_stray_continuation(true);

        let protocol = connected(&device);
        assert!(matches!(
            protocol.transceive(&[0x01]),
            Err(CtapHidError::ChangedChannel { actual, .. }) if actual == CHANNEL_ID + 1
        ));
        // Three of the four reply packets are left unread
        assert_eq!(device.queued_packets(), 3);
    }

    #[test]
    fn test_timeout_releases_request_and_allows_reconnect() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        device.set_stalled(true);

        let protocol = CtapHidProtocol::new(device.clone(), fast_timeouts());
        assert_eq!(protocol.connect(), Err(CtapHidError::Timeout));
        assert_eq!(device.open_requests(), 0);

        device.set_stalled(false);
        protocol.connect().unwrap();
        assert_eq!(protocol.channel_id(), CHANNEL_ID);
    }

    #[test]
    fn test_read_timeout_after_connect() {
        let device = Arc::new(SimulatedDevice::new(CHANNEL_ID));
        let protocol = connected(&device);

        device.set_stalled(true);
        assert_eq!(protocol.transceive(&[0x01]), Err(CtapHidError::Timeout));
        assert_eq!(device.open_requests(), 0);
    }
}
