//! Hardware watchers feeding the dispatcher

use std::fmt;

use hwkey_apdu_core::SharedTransport;

/// A platform watcher producing transports for the dispatcher
pub trait DeviceWatcher: Send + fmt::Debug {
    /// Ask the watcher to scan for devices again
    ///
    /// Returns `true` when the scan itself will produce discovery events.
    fn rescan_devices(&self, active: bool) -> bool;

    /// Stop offering the device behind this transport until it leaves
    fn ignore(&self, _transport: &SharedTransport) {}
}
