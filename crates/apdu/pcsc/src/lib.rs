//! PC/SC transport for security keys behind USB CCID readers
//!
//! [`PcscTransport`] implements the core [`Transport`](hwkey_apdu_core::Transport)
//! trait for one reader, and [`PcscWatcher`] polls all readers and hands an
//! unconnected transport to a discovery sink whenever a card shows up.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod reader;
pub mod transport;
pub mod watcher;

pub use config::{PcscConfig, ShareMode};
pub use error::PcscError;
pub use reader::PcscReader;
pub use transport::PcscTransport;
pub use watcher::{CardEvent, DiscoverySink, PcscWatcher};
