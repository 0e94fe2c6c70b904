//! Security key dispatcher
//!
//! Watchers report transports to a [`SecurityKeyManager`]. The manager
//! connects each one with the [`ConnectionMode`] of the newest active
//! registration that accepts its transport kind and hands the resulting
//! [`SecurityKey`] to that registration's [`SecurityKeyCallback`]. Transports
//! meant for a paused registration wait until its owner resumes.
//!
//! ```no_run
//! use hwkey_applet::Error;
//! use hwkey_manager::{
//!     ConnectionMode, LifecycleOwner, LifecycleTransition, ManagerConfig, SecurityKey,
//!     SecurityKeyCallback, SecurityKeyManager,
//! };
//!
//! struct Sign;
//!
//! impl SecurityKeyCallback for Sign {
//!     fn on_security_key_discovered(&mut self, key: SecurityKey) {
//!         let info = key.with_openpgp(|card| card.read_security_key_info());
//!         println!("{info:?}");
//!     }
//!
//!     fn on_security_key_discovery_failed(&mut self, error: Error) {
//!         eprintln!("{error}");
//!     }
//!
//!     fn on_security_key_disconnected(&mut self, _key: SecurityKey) {}
//! }
//!
//! let manager = SecurityKeyManager::start(ManagerConfig::default(), None)?;
//! let screen = LifecycleOwner::new(1, "SignScreen");
//! manager.dispatch_lifecycle(&screen, LifecycleTransition::Resume)?;
//! manager.register_callback(ConnectionMode::openpgp(), &screen, Sign)?;
//! # Ok::<(), hwkey_manager::ManagerError>(())
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod callback;
mod channel;
pub mod config;
mod coordinator;
pub mod error;
pub mod key;
pub mod lifecycle;
pub mod manager;
pub mod mode;
#[cfg(feature = "pcsc")]
mod pcsc;
pub mod registration;
pub mod usb;
pub mod watcher;
mod worker;

pub use callback::SecurityKeyCallback;
pub use config::ManagerConfig;
pub use error::{ManagerError, Result};
pub use key::{Applet, AppletKind, SecurityKey, SecurityKeyId};
pub use lifecycle::{LifecycleOwner, LifecycleTransition};
pub use manager::{DiscoverySink, SecurityKeyManager};
pub use mode::{ConnectionMode, RawConfig};
pub use registration::RegistrationId;
pub use usb::{UsbDeviceFilter, UsbDeviceInfo, UsbInterfaces};
pub use watcher::DeviceWatcher;
