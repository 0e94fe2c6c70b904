//! Common test utilities

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use hwkey_apdu_core::{SharedTransport, TransportKind, mock::MockTransport};
use hwkey_applet::Error;
use hwkey_manager::{AppletKind, DeviceWatcher, SecurityKey, SecurityKeyCallback, SecurityKeyId};
use parking_lot::Mutex;

/// What a callback observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Discovered(AppletKind, SecurityKeyId),
    Failed(String),
    Disconnected(SecurityKeyId),
}

/// Callback recording every event
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    keys: Arc<Mutex<Vec<SecurityKey>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn keys(&self) -> Vec<SecurityKey> {
        self.keys.lock().clone()
    }
}

impl SecurityKeyCallback for Recorder {
    fn on_security_key_discovered(&mut self, key: SecurityKey) {
        self.events.lock().push(Event::Discovered(key.applet_kind(), key.id()));
        self.keys.lock().push(key);
    }

    fn on_security_key_discovery_failed(&mut self, error: Error) {
        self.events.lock().push(Event::Failed(error.to_string()));
    }

    fn on_security_key_disconnected(&mut self, key: SecurityKey) {
        self.events.lock().push(Event::Disconnected(key.id()));
    }
}

/// Callback that holds the coordinator inside its first discovery until opened
#[derive(Debug)]
pub struct Gate {
    entered: Sender<()>,
    open: Receiver<()>,
    passed: bool,
}

/// Test side of a [`Gate`]
#[derive(Debug)]
pub struct GateHandle {
    entered: Receiver<()>,
    open: Sender<()>,
}

impl GateHandle {
    /// Wait until the coordinator is blocked in the callback
    pub fn wait_entered(&self) {
        self.entered.recv().unwrap();
    }

    /// Let the coordinator continue
    pub fn open(&self) {
        self.open.send(()).unwrap();
    }
}

pub fn gate() -> (Gate, GateHandle) {
    let (entered_tx, entered_rx) = bounded(1);
    let (open_tx, open_rx) = bounded(1);
    (
        Gate {
            entered: entered_tx,
            open: open_rx,
            passed: false,
        },
        GateHandle {
            entered: entered_rx,
            open: open_tx,
        },
    )
}

impl SecurityKeyCallback for Gate {
    fn on_security_key_discovered(&mut self, _key: SecurityKey) {
        if self.passed {
            return;
        }
        self.passed = true;
        let _ = self.entered.send(());
        let _ = self.open.recv();
    }

    fn on_security_key_discovery_failed(&mut self, _error: Error) {}

    fn on_security_key_disconnected(&mut self, _key: SecurityKey) {}
}

/// Watcher double counting rescans and ignored transports
#[derive(Debug, Clone, Default)]
pub struct CountingWatcher {
    pub rescan_result: bool,
    pub rescans: Arc<AtomicUsize>,
    pub ignored: Arc<AtomicUsize>,
}

impl CountingWatcher {
    pub fn rescans(&self) -> usize {
        self.rescans.load(Ordering::Acquire)
    }

    pub fn ignored(&self) -> usize {
        self.ignored.load(Ordering::Acquire)
    }
}

impl DeviceWatcher for CountingWatcher {
    fn rescan_devices(&self, _active: bool) -> bool {
        self.rescans.fetch_add(1, Ordering::AcqRel);
        self.rescan_result
    }

    fn ignore(&self, _transport: &SharedTransport) {
        self.ignored.fetch_add(1, Ordering::AcqRel);
    }
}

/// A connected-on-demand transport answering 90 00 to everything
pub fn transport(kind: TransportKind) -> Arc<MockTransport> {
    Arc::new(MockTransport::with_success(kind))
}
