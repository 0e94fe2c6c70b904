//! Configuration of the security key manager

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::usb::UsbDeviceFilter;

/// Crates whose events the debug logging enables
const DEBUG_TARGETS: [&str; 5] = [
    "hwkey_manager",
    "hwkey_applet",
    "hwkey_apdu_core",
    "hwkey_apdu_transport_ctaphid",
    "hwkey_apdu_transport_pcsc",
];

/// Configuration options for [`SecurityKeyManager`](crate::SecurityKeyManager)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Owner kinds whose registrations are rejected
    pub excluded_owner_kinds: Vec<String>,

    /// Install a debug level `fmt` subscriber on start
    pub enable_debug_logging: bool,

    /// Keep NFC security keys in the persistent set
    pub enable_persistent_nfc_connection: bool,

    /// Ask the watcher to ignore an NFC tag once its transport is released
    pub ignore_nfc_tag_after_use: bool,

    /// Let watchers offer USB devices that were never tested
    pub allow_untested_usb_devices: bool,
}

impl ManagerConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject registrations of the given owner kind
    pub fn with_excluded_owner_kind(mut self, kind: impl Into<String>) -> Self {
        self.excluded_owner_kinds.push(kind.into());
        self
    }

    /// Set whether debug logging is installed
    pub const fn with_debug_logging(mut self, enable: bool) -> Self {
        self.enable_debug_logging = enable;
        self
    }

    /// Set whether NFC security keys stay connected
    pub const fn with_persistent_nfc_connection(mut self, enable: bool) -> Self {
        self.enable_persistent_nfc_connection = enable;
        self
    }

    /// Set whether released NFC tags are ignored
    pub const fn with_ignore_nfc_tag_after_use(mut self, ignore: bool) -> Self {
        self.ignore_nfc_tag_after_use = ignore;
        self
    }

    /// Set whether untested USB devices are offered
    pub const fn with_allow_untested_usb_devices(mut self, allow: bool) -> Self {
        self.allow_untested_usb_devices = allow;
        self
    }

    /// USB device filter handed to watchers through the discovery sink
    pub const fn usb_device_filter(&self) -> UsbDeviceFilter {
        UsbDeviceFilter::new(self.allow_untested_usb_devices)
    }

    /// Whether registrations of this owner kind are rejected
    pub fn is_excluded(&self, kind: &str) -> bool {
        self.excluded_owner_kinds.iter().any(|excluded| excluded == kind)
    }

    /// Install the debug subscriber if enabled
    ///
    /// Directives from `RUST_LOG` are kept. Nothing happens when a global
    /// subscriber is already set.
    pub fn init_logging(&self) {
        if !self.enable_debug_logging {
            return;
        }

        let mut filter = EnvFilter::from_default_env();
        for target in DEBUG_TARGETS {
            if let Ok(directive) = format!("{target}=debug").parse() {
                filter = filter.add_directive(directive);
            }
        }

        if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
            debug!("Debug logging enabled");
        }
    }
}
