//! Handle to a connected security key

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use derive_more::Display;
use hwkey_apdu_core::{ApduProcessor, SharedTransport, TransportKind};
use hwkey_applet::{Fido2Connection, FidoU2fConnection, OpenPgpConnection, PivConnection};
use parking_lot::Mutex;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a connected security key, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("key-{_0}")]
pub struct SecurityKeyId(u64);

impl SecurityKeyId {
    fn next() -> Self {
        Self(NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Applet a security key was connected with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum AppletKind {
    /// FIDO U2F
    #[display("FIDO U2F")]
    Fido,
    /// FIDO2, with U2F fallback
    #[display("FIDO2")]
    Fido2,
    /// OpenPGP card
    #[display("OpenPGP")]
    OpenPgp,
    /// PIV
    #[display("PIV")]
    Piv,
    /// No applet, plain APDU exchange
    #[display("raw")]
    Raw,
}

/// Connected applet of a security key
#[derive(Debug)]
pub enum Applet {
    /// FIDO U2F connection
    Fido(FidoU2fConnection),
    /// FIDO2 connection
    Fido2(Fido2Connection),
    /// OpenPGP card connection
    OpenPgp(OpenPgpConnection),
    /// PIV connection
    Piv(PivConnection),
    /// APDU processor without a selected applet
    Raw(ApduProcessor),
}

impl Applet {
    /// Kind of this applet
    pub const fn kind(&self) -> AppletKind {
        match self {
            Self::Fido(_) => AppletKind::Fido,
            Self::Fido2(_) => AppletKind::Fido2,
            Self::OpenPgp(_) => AppletKind::OpenPgp,
            Self::Piv(_) => AppletKind::Piv,
            Self::Raw(_) => AppletKind::Raw,
        }
    }
}

/// A connected security key
///
/// Cloning is cheap; all clones share the transport and the applet
/// connection. Equality is by [`SecurityKeyId`].
#[derive(Debug, Clone)]
pub struct SecurityKey {
    id: SecurityKeyId,
    kind: AppletKind,
    transport: SharedTransport,
    applet: Arc<Mutex<Applet>>,
}

impl PartialEq for SecurityKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SecurityKey {}

impl SecurityKey {
    /// Wrap a connected applet
    pub fn new(transport: SharedTransport, applet: Applet) -> Self {
        Self {
            id: SecurityKeyId::next(),
            kind: applet.kind(),
            transport,
            applet: Arc::new(Mutex::new(applet)),
        }
    }

    /// Identifier of this key
    pub const fn id(&self) -> SecurityKeyId {
        self.id
    }

    /// Applet the key was connected with
    pub const fn applet_kind(&self) -> AppletKind {
        self.kind
    }

    /// The underlying transport
    pub const fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Physical link of the transport
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Check that the key still answers
    pub fn check_connection(&self) -> bool {
        self.transport.ping()
    }

    /// Whether the key is reached over NFC
    pub fn is_transport_nfc(&self) -> bool {
        self.transport_kind().is_nfc()
    }

    /// Whether the key is reached over USB
    pub fn is_transport_usb(&self) -> bool {
        self.transport_kind().is_usb()
    }

    /// Whether the link stays usable between operations
    pub fn is_persistently_connected(&self) -> bool {
        self.transport.is_persistent_connection_allowed() && self.transport.is_connected()
    }

    /// Release the transport
    pub fn release(&self) {
        self.transport.release();
    }

    /// Run `f` with exclusive access to the applet connection
    pub fn with_applet<R>(&self, f: impl FnOnce(&mut Applet) -> R) -> R {
        f(&mut self.applet.lock())
    }

    /// Run `f` with the OpenPGP connection, if that is the applet
    pub fn with_openpgp<R>(&self, f: impl FnOnce(&mut OpenPgpConnection) -> R) -> Option<R> {
        match &mut *self.applet.lock() {
            Applet::OpenPgp(connection) => Some(f(connection)),
            _ => None,
        }
    }

    /// Run `f` with the FIDO U2F connection, if that is the applet
    pub fn with_fido<R>(&self, f: impl FnOnce(&mut FidoU2fConnection) -> R) -> Option<R> {
        match &mut *self.applet.lock() {
            Applet::Fido(connection) => Some(f(connection)),
            _ => None,
        }
    }

    /// Run `f` with the FIDO2 connection, if that is the applet
    pub fn with_fido2<R>(&self, f: impl FnOnce(&mut Fido2Connection) -> R) -> Option<R> {
        match &mut *self.applet.lock() {
            Applet::Fido2(connection) => Some(f(connection)),
            _ => None,
        }
    }

    /// Run `f` with the PIV connection, if that is the applet
    pub fn with_piv<R>(&self, f: impl FnOnce(&mut PivConnection) -> R) -> Option<R> {
        match &mut *self.applet.lock() {
            Applet::Piv(connection) => Some(f(connection)),
            _ => None,
        }
    }

    /// Run `f` with the raw APDU processor, if no applet was selected
    pub fn with_raw<R>(&self, f: impl FnOnce(&ApduProcessor) -> R) -> Option<R> {
        match &*self.applet.lock() {
            Applet::Raw(processor) => Some(f(processor)),
            _ => None,
        }
    }
}
