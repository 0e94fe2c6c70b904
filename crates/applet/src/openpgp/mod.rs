//! OpenPGP card applet

pub mod capabilities;
pub mod commands;
pub mod connection;
pub mod info;

pub use capabilities::{CardCapabilities, OpenPgpCapabilities};
pub use commands::{KeySlot, PinReference};
pub use connection::{
    ConnectionState, OPENPGP_AID_PREFIX, OpenPgpConfig, OpenPgpConnection, PinState,
    SecureMessagingProvider,
};
pub use info::{SecurityKeyInfo, SecurityKeyType};
