//! [`Transport`] over a CTAPHID link

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use hwkey_apdu_core::{
    Command, Response,
    secret::wipe_bytes,
    transport::{ReleaseCallback, ReleaseState, Transport, TransportError, TransportKind},
};
use tracing::{debug, trace, warn};

use crate::{
    error::CtapHidError,
    link::HidLink,
    protocol::{CtapHidProtocol, CtapHidTimeouts},
};

/// Header of the CTAP2 command APDU that is sent as a CBOR message
const CTAP2_APDU_HEADER: (u8, u8, u8, u8) = (0x80, 0x10, 0x00, 0x00);

/// A security key reached over USB HID
///
/// ISO 7816 commands travel as CTAPHID MSG with an extended Le, the CTAP2
/// command APDU is unwrapped and sent as a CBOR message.
#[derive(Debug)]
pub struct UsbCtapHidTransport {
    protocol: CtapHidProtocol,
    connected: AtomicBool,
    release: ReleaseState,
}

impl UsbCtapHidTransport {
    /// Create a transport with the default timeouts
    pub fn new(link: Arc<dyn HidLink>) -> Self {
        Self::with_timeouts(link, CtapHidTimeouts::default())
    }

    /// Create a transport with custom timeouts
    pub fn with_timeouts(link: Arc<dyn HidLink>, timeouts: CtapHidTimeouts) -> Self {
        Self {
            protocol: CtapHidProtocol::new(link, timeouts),
            connected: AtomicBool::new(false),
            release: ReleaseState::new(),
        }
    }

    /// The protocol session
    pub const fn protocol(&self) -> &CtapHidProtocol {
        &self.protocol
    }

    /// Round-trip `payload` through a CTAPHID PING
    pub fn ping_device(&self, payload: &[u8]) -> Result<Bytes, TransportError> {
        self.ensure_usable()?;
        self.protocol.ping(payload).map_err(|e| self.map_error(e))
    }

    /// Make the device blink, if it supports WINK
    pub fn wink(&self) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let supported = self.protocol.init_response().is_some_and(|init| init.supports_wink());
        if !supported {
            return Err(TransportError::Unsupported("device does not support WINK"));
        }
        self.protocol.wink().map_err(|e| self.map_error(e))
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        if self.release.is_released() {
            return Err(TransportError::Disconnected);
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::connection("Not connected"));
        }
        Ok(())
    }

    fn map_error(&self, error: CtapHidError) -> TransportError {
        if !self.protocol.link().is_device_present() {
            warn!(error = %error, "Security key removed during CTAPHID exchange");
            self.release();
            return TransportError::Disconnected;
        }
        error.into()
    }
}

impl Transport for UsbCtapHidTransport {
    fn do_transceive(&self, command: &Command) -> Result<Response, TransportError> {
        self.ensure_usable()?;

        let (cla, ins, p1, p2) = CTAP2_APDU_HEADER;
        if command.matches_header(cla, ins, p1, p2) {
            trace!(request = %hex::encode(command.data()), "Sending CTAP2 request as CBOR");
            let reply = self
                .protocol
                .transceive_cbor(command.data())
                .map_err(|e| self.map_error(e))?;
            return Ok(Response::success(reply));
        }

        let apdu = command.clone().with_forced_extended_ne().to_bytes();
        let reply = self.protocol.transceive(&apdu);
        if command.carries_secret() {
            wipe_bytes(apdu);
        }
        let reply = reply.map_err(|e| self.map_error(e))?;
        Response::from_bytes(&reply).map_err(|e| TransportError::malformed(e.to_string()))
    }

    fn connect(&self) -> Result<(), TransportError> {
        if self.release.is_released() {
            return Err(TransportError::Released);
        }
        if self.connected.load(Ordering::Acquire) {
            return Err(TransportError::connection("Already connected"));
        }

        self.protocol.connect().map_err(|e| self.map_error(e))?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn release(&self) {
        if self.release.release() {
            debug!("Releasing CTAPHID transport");
            self.connected.store(false, Ordering::Release);
            self.protocol.link().close();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.release.is_released()
    }

    fn is_released(&self) -> bool {
        self.release.is_released()
    }

    fn ping(&self) -> bool {
        !self.release.is_released() && self.protocol.link().is_device_present()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::UsbCtapHid
    }

    fn is_persistent_connection_allowed(&self) -> bool {
        true
    }

    fn is_extended_length_supported(&self) -> bool {
        true
    }

    fn set_release_callback(&self, callback: ReleaseCallback) {
        self.release.set_callback(callback);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use super::*;
    use crate::{constants::CTAPHID_CBOR, mock::SimulatedDevice};
    use hex::decode;

    fn transport(device: &Arc<SimulatedDevice>) -> UsbCtapHidTransport {
        let timeouts = CtapHidTimeouts::default()
            .with_negotiation(Duration::from_millis(200))
            .with_read(Duration::from_millis(300))
            .with_write(Duration::from_millis(300));
        UsbCtapHidTransport::with_timeouts(device.clone(), timeouts)
    }

    #[test]
    fn test_iso_command_goes_out_as_msg_with_extended_le() {
        let device = Arc::new(SimulatedDevice::new(0x1234_5678));
        device.set_handler(|_, apdu| {
            assert_eq!(apdu, decode("00CA006E000000").unwrap().as_slice());
            decode("6E0A9000").unwrap()
        });

        let transport = transport(&device);
        transport.connect().unwrap();
        assert_eq!(transport.protocol().channel_id(), 0x1234_5678);

        let response = transport
            .transceive(&Command::new(0x00, 0xCA, 0x00, 0x6E))
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.data(), &[0x6E, 0x0A]);
    }

    #[test]
    fn test_ctap2_command_goes_out_as_cbor() {
        let device = Arc::new(SimulatedDevice::new(0x42));
        device.set_keepalives(2);
        device.set_handler(|command, data| {
            assert_eq!(command, CTAPHID_CBOR);
            assert_eq!(data, &[0x04]);
            vec![0x00, 0xA0]
        });

        let transport = transport(&device);
        transport.connect().unwrap();

        let command = Command::new_with_data(0x80, 0x10, 0x00, 0x00, vec![0x04]);
        let response = transport.transceive(&command).unwrap();
        assert!(response.is_success());
        assert_eq!(response.data(), &[0x00, 0xA0]);
    }

    #[test]
    fn test_connect_twice_fails() {
        let device = Arc::new(SimulatedDevice::new(0x42));
        let transport = transport(&device);
        transport.connect().unwrap();
        assert!(matches!(transport.connect(), Err(TransportError::Connection(_))));
    }

    #[test]
    fn test_transceive_before_connect_fails() {
        let device = Arc::new(SimulatedDevice::new(0x42));
        let transport = transport(&device);
        assert!(matches!(
            transport.transceive(&Command::new(0x00, 0xCA, 0x00, 0x6E)),
            Err(TransportError::Connection(_))
        ));
    }

    #[test]
    fn test_release_fires_callback_once_and_closes_link() {
        let device = Arc::new(SimulatedDevice::new(0x42));
        let transport = transport(&device);
        transport.connect().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        transport.set_release_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        transport.release();
        transport.release();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(device.is_closed());
        assert!(transport.is_released());
        assert!(!transport.is_connected());
        assert!(!transport.ping());
        assert_eq!(
            transport.transceive(&Command::new(0x00, 0xCA, 0x00, 0x6E)),
            Err(TransportError::Disconnected)
        );
    }

    #[test]
    fn test_unplugged_device_releases_transport() {
        let device = Arc::new(SimulatedDevice::new(0x42));
        let transport = transport(&device);
        transport.connect().unwrap();
        assert!(transport.ping());

        device.set_present(false);
        assert!(!transport.ping());
        assert_eq!(
            transport.transceive(&Command::new(0x00, 0xCA, 0x00, 0x6E)),
            Err(TransportError::Disconnected)
        );
        assert!(transport.is_released());
    }

    #[test]
    fn test_timeout_then_reconnect_on_fresh_transport() {
        let device = Arc::new(SimulatedDevice::new(0x42));
        let transport = transport(&device);
        transport.connect().unwrap();

        device.set_stalled(true);
        assert_eq!(
            transport.transceive(&Command::new(0x00, 0xCA, 0x00, 0x6E)),
            Err(TransportError::Timeout)
        );
        assert_eq!(device.open_requests(), 0);

        device.set_stalled(false);
        let again = super::UsbCtapHidTransport::new(device.clone());
        again.connect().unwrap();
        assert_eq!(again.protocol().channel_id(), 0x42);
    }

    #[test]
    fn test_ping_device_and_wink() {
        let device = Arc::new(SimulatedDevice::new(0x42));
        let transport = transport(&device);
        transport.connect().unwrap();

        assert_eq!(transport.ping_device(b"abc").unwrap().as_ref(), b"abc");
        transport.wink().unwrap();
    }
}
