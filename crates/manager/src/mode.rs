//! Connection modes: which applet a registration wants
//!
//! A mode decides which transport kinds it cares about, builds the applet
//! connection for a discovered transport and recognizes its own keys when
//! persistent keys are offered again.

use hwkey_apdu_core::{ApduProcessor, ChainingPolicy, SharedTransport, TransportKind};
use hwkey_applet::{
    Error, Fido2Config, Fido2Connection, FidoU2fConnection, OpenPgpConfig, OpenPgpConnection,
    PivConnection,
};
use tracing::debug;

use crate::key::{Applet, AppletKind, SecurityKey};

/// Configuration of the raw mode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig {
    /// Transport kinds offered to the raw mode, all kinds if empty
    pub allowed_kinds: Vec<TransportKind>,
}

impl RawConfig {
    /// Allow one more transport kind
    pub fn with_allowed_kind(mut self, kind: TransportKind) -> Self {
        if !self.allowed_kinds.contains(&kind) {
            self.allowed_kinds.push(kind);
        }
        self
    }

    /// Whether the raw mode accepts this transport kind
    pub fn allows(&self, kind: TransportKind) -> bool {
        self.allowed_kinds.is_empty() || self.allowed_kinds.contains(&kind)
    }
}

/// The applet a registration connects discovered transports with
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// FIDO U2F authenticators
    Fido,
    /// FIDO2 authenticators, falling back to U2F
    Fido2(Fido2Config),
    /// OpenPGP cards
    OpenPgp(OpenPgpConfig),
    /// PIV cards
    Piv,
    /// Plain APDU exchange without selecting an applet
    Raw(RawConfig),
}

impl ConnectionMode {
    /// OpenPGP mode with the default AIDs
    pub fn openpgp() -> Self {
        Self::OpenPgp(OpenPgpConfig::default())
    }

    /// FIDO2 mode with the CTAP2 probe enabled
    pub fn fido2() -> Self {
        Self::Fido2(Fido2Config::default())
    }

    /// Raw mode over every transport kind
    pub fn raw() -> Self {
        Self::Raw(RawConfig::default())
    }

    /// Kind of the applet this mode connects
    pub const fn applet_kind(&self) -> AppletKind {
        match self {
            Self::Fido => AppletKind::Fido,
            Self::Fido2(_) => AppletKind::Fido2,
            Self::OpenPgp(_) => AppletKind::OpenPgp,
            Self::Piv => AppletKind::Piv,
            Self::Raw(_) => AppletKind::Raw,
        }
    }

    /// Whether transports of this kind are offered to the mode
    pub fn is_relevant_transport(&self, kind: TransportKind) -> bool {
        match self {
            Self::Fido | Self::Fido2(_) => {
                matches!(kind, TransportKind::UsbCtapHid | TransportKind::Nfc)
            }
            Self::OpenPgp(_) | Self::Piv => {
                matches!(kind, TransportKind::UsbCcid | TransportKind::Nfc)
            }
            Self::Raw(config) => config.allows(kind),
        }
    }

    /// Whether an already connected key can be handed to this mode
    pub fn is_relevant_key(&self, key: &SecurityKey) -> bool {
        match self {
            Self::Raw(_) => true,
            _ => key.applet_kind() == self.applet_kind(),
        }
    }

    /// Connect the applet over a discovered transport
    ///
    /// `Ok(None)` means the transport is not for this mode. Applet
    /// connections release the transport when they fail.
    pub fn establish(&self, transport: SharedTransport) -> Result<Option<SecurityKey>, Error> {
        let kind = transport.kind();
        if !self.is_relevant_transport(kind) {
            return Ok(None);
        }

        debug!(mode = %self.applet_kind(), transport = %kind, "Establishing security key connection");
        let applet = match self {
            Self::Fido => {
                let mut connection = FidoU2fConnection::new(transport.clone());
                connection.connect_if_necessary()?;
                Applet::Fido(connection)
            }
            Self::Fido2(config) => {
                let mut connection = Fido2Connection::new(transport.clone(), *config);
                connection.connect_if_necessary()?;
                Applet::Fido2(connection)
            }
            Self::OpenPgp(config) => {
                let mut connection = OpenPgpConnection::new(transport.clone(), config.clone());
                connection.connect_if_necessary()?;
                Applet::OpenPgp(connection)
            }
            Self::Piv => {
                let mut connection = PivConnection::new(transport.clone());
                connection.connect_if_necessary()?;
                Applet::Piv(connection)
            }
            Self::Raw(_) => {
                let policy =
                    ChainingPolicy::from_capabilities(transport.is_extended_length_supported(), true);
                Applet::Raw(ApduProcessor::new(transport.clone(), policy))
            }
        };

        Ok(Some(SecurityKey::new(transport, applet)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use hwkey_apdu_core::{Bytes, Transport, mock::MockTransport};
    use hex::decode;

    fn raw(hex: &str) -> Bytes {
        Bytes::from(decode(hex).unwrap())
    }

    #[test]
    fn test_relevant_transports() {
        use TransportKind::*;

        let fido = ConnectionMode::Fido;
        assert!(fido.is_relevant_transport(UsbCtapHid));
        assert!(fido.is_relevant_transport(Nfc));
        assert!(!fido.is_relevant_transport(UsbCcid));

        let openpgp = ConnectionMode::openpgp();
        assert!(openpgp.is_relevant_transport(UsbCcid));
        assert!(openpgp.is_relevant_transport(Nfc));
        assert!(!openpgp.is_relevant_transport(UsbCtapHid));

        assert!(!ConnectionMode::Piv.is_relevant_transport(UsbCtapHid));
        assert!(ConnectionMode::raw().is_relevant_transport(UsbCtapHid));

        let nfc_only = ConnectionMode::Raw(RawConfig::default().with_allowed_kind(Nfc));
        assert!(nfc_only.is_relevant_transport(Nfc));
        assert!(!nfc_only.is_relevant_transport(UsbCcid));
    }

    #[test]
    fn test_irrelevant_transport_is_not_touched() {
        let transport = Arc::new(MockTransport::with_success(TransportKind::UsbCtapHid));

        let key = ConnectionMode::openpgp().establish(transport.clone()).unwrap();
        assert!(key.is_none());
        assert_eq!(transport.command_count(), 0);
        assert!(!transport.is_released());
    }

    #[test]
    fn test_establish_fido_over_ctaphid() {
        let transport = Arc::new(MockTransport::with_response(
            TransportKind::UsbCtapHid,
            raw("5532465F56329000"),
        ));

        let key = ConnectionMode::Fido.establish(transport.clone()).unwrap().unwrap();
        assert_eq!(key.applet_kind(), AppletKind::Fido);
        let version = key.with_fido(|fido| fido.version().map(str::to_owned)).flatten();
        assert_eq!(version.as_deref(), Some("U2F_V2"));
        assert!(ConnectionMode::Fido.is_relevant_key(&key));
        assert!(!ConnectionMode::fido2().is_relevant_key(&key));
        assert!(ConnectionMode::raw().is_relevant_key(&key));

        let commands = transport.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].matches_header(0x00, 0x03, 0x00, 0x00));
    }

    #[test]
    fn test_establish_failure_releases_transport() {
        let transport = Arc::new(MockTransport::with_response(TransportKind::Nfc, raw("6A82")));

        let result = ConnectionMode::openpgp().establish(transport.clone());
        assert!(matches!(result, Err(Error::SelectApplet { .. })));
        assert!(transport.is_released());
    }

    #[test]
    fn test_raw_mode_skips_selection() {
        let transport = Arc::new(MockTransport::with_success(TransportKind::UsbCcid));

        let key = ConnectionMode::raw().establish(transport.clone()).unwrap().unwrap();
        assert_eq!(key.applet_kind(), AppletKind::Raw);
        assert_eq!(transport.command_count(), 0);
    }
}
