//! The security key manager
//!
//! One explicitly started value per process. It owns two threads: a worker
//! that does all device I/O and a coordinator that owns the registrations
//! and invokes the callbacks. Watchers hand transports to the worker
//! through [`SecurityKeyManager::on_transport_discovered`] or a
//! [`DiscoverySink`].

use std::{
    fmt,
    sync::atomic::Ordering,
    thread::{self, JoinHandle},
};

use hwkey_apdu_core::SharedTransport;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    callback::SecurityKeyCallback,
    channel::{Queue, queue},
    config::ManagerConfig,
    coordinator::{Coordinator, CoordinatorEvent, Shared},
    error::{ManagerError, Result},
    key::SecurityKey,
    lifecycle::{LifecycleOwner, LifecycleTransition},
    mode::ConnectionMode,
    registration::{Registration, RegistrationId},
    usb::{UsbDeviceFilter, UsbDeviceInfo},
    watcher::DeviceWatcher,
    worker::{Worker, WorkerTask},
};

/// Cloneable entry point for watchers
#[derive(Debug, Clone)]
pub struct DiscoverySink {
    worker: Queue<WorkerTask>,
    usb_filter: UsbDeviceFilter,
}

impl DiscoverySink {
    /// Hand a newly discovered, unconnected transport to the dispatcher
    ///
    /// The transport is released if the manager is shut down.
    pub fn discover(&self, transport: SharedTransport) {
        debug!(transport = %transport.kind(), "Transport discovered");
        if let Err(WorkerTask::Discovered(transport)) =
            self.worker.send_or_return(WorkerTask::Discovered(transport))
        {
            warn!(transport = %transport.kind(), "Security key manager is shut down, releasing transport");
            transport.release();
        }
    }

    /// Filter USB watchers apply before opening a device
    pub const fn usb_device_filter(&self) -> UsbDeviceFilter {
        self.usb_filter
    }

    /// Hand over a transport of a USB device if the filter admits the device
    ///
    /// A rejected device's transport is released. Returns whether it was
    /// handed over.
    pub fn discover_usb(&self, device: &UsbDeviceInfo, transport: SharedTransport) -> bool {
        if !self.usb_filter.is_relevant(device) {
            debug!(%device, "Ignoring untested USB device");
            transport.release();
            return false;
        }
        self.discover(transport);
        true
    }
}

/// Dispatcher delivering connected security keys to registered callbacks
pub struct SecurityKeyManager {
    config: ManagerConfig,
    shared: Shared,
    worker: Queue<WorkerTask>,
    coordinator: Queue<CoordinatorEvent>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for SecurityKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityKeyManager")
            .field("config", &self.config)
            .field("registrations", &self.shared.registrations.read().len())
            .field("persistent_keys", &self.shared.persistent.read().len())
            .field("running", &!self.threads.lock().is_empty())
            .finish()
    }
}

impl SecurityKeyManager {
    /// Start the worker and coordinator threads
    pub fn start(config: ManagerConfig, watcher: Option<Box<dyn DeviceWatcher>>) -> Result<Self> {
        config.init_logging();

        let shared = Shared::default();
        let (worker, worker_tasks) = queue(&shared.pending);
        let (coordinator, coordinator_events) = queue(&shared.pending);

        let worker_thread = {
            let worker = Worker::new(
                shared.registrations.clone(),
                coordinator.clone(),
                shared.pending.clone(),
            );
            spawn("hwkey-worker", move || worker.run(worker_tasks))?
        };

        let coordinator_thread = {
            let state = Coordinator::new(
                config.clone(),
                watcher,
                shared.clone(),
                coordinator.clone(),
                worker.clone(),
            );
            match spawn("hwkey-coordinator", move || state.run(coordinator_events)) {
                Ok(handle) => handle,
                Err(e) => {
                    let _ = worker.send_uncounted(WorkerTask::Shutdown);
                    let _ = worker_thread.join();
                    return Err(e);
                }
            }
        };

        info!("Security key manager started");
        Ok(Self {
            config,
            shared,
            worker,
            coordinator,
            threads: Mutex::new(vec![worker_thread, coordinator_thread]),
        })
    }

    /// Configuration the manager was started with
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Register a callback gated by the owner's lifecycle
    ///
    /// The registration takes precedence over all earlier ones. It starts
    /// active if the owner was last resumed.
    pub fn register_callback(
        &self,
        mode: ConnectionMode,
        owner: &LifecycleOwner,
        callback: impl SecurityKeyCallback + 'static,
    ) -> Result<RegistrationId> {
        if self.config.is_excluded(&owner.kind) {
            return Err(ManagerError::excluded_owner(owner.kind.clone()));
        }
        self.register(mode, Some(owner.id), Box::new(callback))
    }

    /// Register a fallback callback without lifecycle gating
    ///
    /// It only receives transports while no owner-bound registration
    /// registered after it is paused.
    pub fn register_callback_forever(
        &self,
        mode: ConnectionMode,
        callback: impl SecurityKeyCallback + 'static,
    ) -> Result<RegistrationId> {
        self.register(mode, None, Box::new(callback))
    }

    fn register(
        &self,
        mode: ConnectionMode,
        owner: Option<u64>,
        callback: Box<dyn SecurityKeyCallback>,
    ) -> Result<RegistrationId> {
        let id = RegistrationId::next();
        self.coordinator.send(CoordinatorEvent::Register(Registration {
            id,
            owner,
            mode,
            callback,
            active: false,
            postponed: None,
        }))?;
        self.rediscover()?;
        Ok(id)
    }

    /// Report a lifecycle transition of an owner
    pub fn dispatch_lifecycle(
        &self,
        owner: &LifecycleOwner,
        transition: LifecycleTransition,
    ) -> Result<()> {
        debug!(owner = owner.id, kind = %owner.kind, %transition, "Lifecycle transition");
        self.coordinator.send(CoordinatorEvent::Lifecycle {
            owner: owner.id,
            transition,
        })
    }

    /// Install or replace the hardware watcher
    pub fn set_watcher(&self, watcher: Box<dyn DeviceWatcher>) -> Result<()> {
        self.coordinator.send(CoordinatorEvent::SetWatcher(watcher))
    }

    /// Hand a newly discovered, unconnected transport to the dispatcher
    pub fn on_transport_discovered(&self, transport: SharedTransport) {
        self.discovery_sink().discover(transport);
    }

    /// Entry point for watchers running on their own threads
    pub fn discovery_sink(&self) -> DiscoverySink {
        DiscoverySink {
            worker: self.worker.clone(),
            usb_filter: self.config.usb_device_filter(),
        }
    }

    /// Snapshot of the connected keys whose transport stays usable
    pub fn connected_persistent_security_keys(&self) -> Vec<SecurityKey> {
        self.shared.persistent.read().clone()
    }

    /// Rescan for devices and offer persistent keys to the registrations again
    ///
    /// Requests made while one is still queued are merged into it.
    pub fn rediscover(&self) -> Result<()> {
        if self.shared.rediscover_pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.coordinator.send(CoordinatorEvent::Rediscover).inspect_err(|_| {
            self.shared.rediscover_pending.store(false, Ordering::Release);
        })
    }

    /// Block until both threads are idle
    ///
    /// Must not be called from a callback.
    pub fn flush(&self) -> Result<()> {
        loop {
            self.worker.barrier(WorkerTask::Flush)?;
            self.coordinator.barrier(CoordinatorEvent::Flush)?;
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
        }
    }

    /// Stop both threads and wait for them
    ///
    /// Postponed transports are released. Calling this twice is harmless.
    pub fn shutdown(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }

        let _ = self.worker.send_uncounted(WorkerTask::Shutdown);
        let _ = self.coordinator.send_uncounted(CoordinatorEvent::Shutdown);
        for handle in threads {
            if handle.join().is_err() {
                warn!("Security key manager thread panicked");
            }
        }
        info!("Security key manager stopped");
    }
}

impl Drop for SecurityKeyManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn(name: &'static str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|source| ManagerError::Spawn { name, source })
}
