//! Applet connections for security keys
//!
//! Each connection owns a shared transport and an [`ApduProcessor`] with the
//! chaining policy its applet needs, selects the applet and maps status words
//! to [`Error`] variants.
//!
//! - [`openpgp::OpenPgpConnection`]: OpenPGP card, with capability caching,
//!   reactivation of terminated applets, PIN state and secure messaging
//! - [`fido::FidoU2fConnection`] and [`fido::Fido2Connection`]: FIDO
//!   authenticators over CTAPHID or NFC
//! - [`piv::PivConnection`]: PIV smart cards
//!
//! [`ApduProcessor`]: hwkey_apdu_core::ApduProcessor
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod fido;
pub mod openpgp;
pub mod piv;
pub mod select;

pub use error::{Error, Result};
pub use fido::{Fido2Config, Fido2Connection, FidoU2fConnection};
pub use openpgp::{OpenPgpConfig, OpenPgpConnection, SecurityKeyInfo, SecurityKeyType};
pub use piv::PivConnection;
