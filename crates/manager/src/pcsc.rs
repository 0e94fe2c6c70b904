//! PC/SC reader watcher as a device watcher

use std::sync::Arc;

use hwkey_apdu_core::SharedTransport;
use hwkey_apdu_transport_pcsc::{PcscConfig, PcscError, PcscWatcher};
use tracing::trace;

use crate::{SecurityKeyManager, error::Result, manager::DiscoverySink, watcher::DeviceWatcher};

impl DeviceWatcher for PcscWatcher {
    fn rescan_devices(&self, active: bool) -> bool {
        trace!(active, "Rescan requested");
        self.rescan()
    }
}

impl DiscoverySink {
    /// Adapt the sink to the PC/SC watcher's callback
    pub fn into_pcsc_sink(self) -> hwkey_apdu_transport_pcsc::DiscoverySink {
        Arc::new(move |transport: SharedTransport| self.discover(transport))
    }
}

impl SecurityKeyManager {
    /// Start watching PC/SC readers and install the watcher
    pub fn watch_pcsc_readers(&self, config: PcscConfig) -> Result<(), PcscError> {
        let watcher = PcscWatcher::start(config, self.discovery_sink().into_pcsc_sink())?;
        self.set_watcher(Box::new(watcher))
            .map_err(|e| PcscError::Watcher(e.to_string()))
    }
}
