//! The coordinator
//!
//! Owns the registrations, the postponed transports and the persistent key
//! set. Every callback runs here, so consumers never see two invocations at
//! once.

use std::{
    collections::HashSet,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender};
use hwkey_apdu_core::{SharedTransport, Transport};
use hwkey_applet::Error;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::{
    channel::{Pending, Queue, handled},
    config::ManagerConfig,
    key::{SecurityKey, SecurityKeyId},
    lifecycle::LifecycleTransition,
    registration::{Registration, RegistrationId, RegistrationView},
    watcher::DeviceWatcher,
    worker::WorkerTask,
};

/// Events handled by the coordinator
pub(crate) enum CoordinatorEvent {
    /// A new registration, inserted first
    Register(Registration),
    /// A lifecycle transition of an owner
    Lifecycle {
        owner: u64,
        transition: LifecycleTransition,
    },
    /// Install the hardware watcher
    SetWatcher(Box<dyn DeviceWatcher>),
    /// The worker connected a key for a registration
    Discovered {
        registration: RegistrationId,
        key: SecurityKey,
    },
    /// The worker failed to connect a key for a registration
    DiscoveryFailed {
        registration: RegistrationId,
        error: Error,
    },
    /// The worker found only a paused registration for a transport
    Postpone {
        registration: RegistrationId,
        transport: SharedTransport,
    },
    /// The transport of a delivered key was released
    Released {
        registration: RegistrationId,
        key: SecurityKeyId,
        transport: Weak<dyn Transport>,
    },
    /// Rescan and offer persistent keys again
    Rediscover,
    /// Barrier
    Flush(Sender<()>),
    /// Stop the coordinator
    Shutdown,
}

/// State shared between the manager handle and the coordinator
#[derive(Debug, Clone, Default)]
pub(crate) struct Shared {
    /// Registrations in delivery order, as last published
    pub(crate) registrations: Arc<RwLock<Vec<RegistrationView>>>,
    /// Connected keys whose transport stays usable
    pub(crate) persistent: Arc<RwLock<Vec<SecurityKey>>>,
    /// Set while a rediscovery is queued
    pub(crate) rediscover_pending: Arc<AtomicBool>,
    /// Messages queued on either thread but not handled yet
    pub(crate) pending: Pending,
}

pub(crate) struct Coordinator {
    config: ManagerConfig,
    registrations: Vec<Registration>,
    resumed_owners: HashSet<u64>,
    watcher: Option<Box<dyn DeviceWatcher>>,
    shared: Shared,
    events: Queue<CoordinatorEvent>,
    worker: Queue<WorkerTask>,
}

impl Coordinator {
    pub(crate) fn new(
        config: ManagerConfig,
        watcher: Option<Box<dyn DeviceWatcher>>,
        shared: Shared,
        events: Queue<CoordinatorEvent>,
        worker: Queue<WorkerTask>,
    ) -> Self {
        Self {
            config,
            registrations: Vec::new(),
            resumed_owners: HashSet::new(),
            watcher,
            shared,
            events,
            worker,
        }
    }

    pub(crate) fn run(mut self, events: Receiver<CoordinatorEvent>) {
        for event in events {
            match event {
                CoordinatorEvent::Flush(done) => {
                    // The flusher may have given up waiting
                    let _ = done.send(());
                }
                CoordinatorEvent::Shutdown => break,
                event => {
                    self.handle(event);
                    handled(&self.shared.pending);
                }
            }
        }

        for registration in &mut self.registrations {
            if let Some(transport) = registration.postponed.take() {
                transport.release();
            }
        }
        debug!("Security key coordinator stopped");
    }

    fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Register(registration) => self.register(registration),
            CoordinatorEvent::Lifecycle { owner, transition } => match transition {
                LifecycleTransition::Resume => self.resume(owner),
                LifecycleTransition::Pause => self.pause(owner),
                LifecycleTransition::Destroy => self.destroy(owner),
            },
            CoordinatorEvent::SetWatcher(watcher) => {
                debug!(?watcher, "Device watcher installed");
                self.watcher = Some(watcher);
            }
            CoordinatorEvent::Discovered { registration, key } => self.discovered(registration, key),
            CoordinatorEvent::DiscoveryFailed {
                registration,
                error,
            } => match self.active_registration(registration) {
                Some(active) => active.callback.on_security_key_discovery_failed(error),
                None => debug!(%registration, error = %error, "Registration paused, dropping discovery failure"),
            },
            CoordinatorEvent::Postpone {
                registration,
                transport,
            } => self.postpone(registration, transport),
            CoordinatorEvent::Released {
                registration,
                key,
                transport,
            } => self.handle_release(registration, key, &transport),
            CoordinatorEvent::Rediscover => {
                self.shared.rediscover_pending.store(false, Ordering::Release);
                if self.has_active_callbacks() {
                    self.trigger_callbacks_actively();
                }
            }
            CoordinatorEvent::Flush(_) | CoordinatorEvent::Shutdown => {}
        }
    }

    fn register(&mut self, mut registration: Registration) {
        registration.active = match registration.owner {
            Some(owner) => self.resumed_owners.contains(&owner),
            None => true,
        };
        debug!(
            registration = %registration.id,
            mode = %registration.mode.applet_kind(),
            active = registration.active,
            "Callback registered"
        );
        self.registrations.insert(0, registration);
        self.publish();
    }

    fn resume(&mut self, owner: u64) {
        self.resumed_owners.insert(owner);
        let mut deliveries = Vec::new();
        for registration in self.registrations.iter_mut().filter(|r| r.owner == Some(owner)) {
            registration.active = true;
            if let Some(transport) = registration.postponed.take() {
                deliveries.push((registration.id, registration.mode.clone(), transport));
            }
        }
        self.publish();

        for (registration, mode, transport) in deliveries {
            if transport.is_released() {
                debug!(%registration, "Postponed transport already released, not delivering");
                continue;
            }
            debug!(%registration, "Delivering postponed transport");
            self.send_to_worker(WorkerTask::Deliver {
                registration,
                mode,
                transport,
            });
        }
    }

    fn pause(&mut self, owner: u64) {
        self.resumed_owners.remove(&owner);
        for registration in self.registrations.iter_mut().filter(|r| r.owner == Some(owner)) {
            registration.active = false;
        }
        self.publish();
    }

    fn destroy(&mut self, owner: u64) {
        self.resumed_owners.remove(&owner);
        self.registrations.retain_mut(|registration| {
            if registration.owner != Some(owner) {
                return true;
            }
            debug!(registration = %registration.id, "Callback unregistered");
            if let Some(transport) = registration.postponed.take() {
                transport.release();
            }
            false
        });
        self.publish();
    }

    /// Store a transport for a paused registration
    ///
    /// The registration may have resumed since the worker looked; then the
    /// transport is delivered right away.
    fn postpone(&mut self, registration: RegistrationId, transport: SharedTransport) {
        let Some(target) = self.registrations.iter_mut().find(|r| r.id == registration) else {
            info!(%registration, transport = %transport.kind(), "Unhandled transport");
            transport.release();
            return;
        };

        if target.active {
            let mode = target.mode.clone();
            self.send_to_worker(WorkerTask::Deliver {
                registration,
                mode,
                transport,
            });
            return;
        }

        debug!(%registration, mode = %target.mode.applet_kind(), "Postponing transport for paused callback");
        if let Some(previous) = target.postponed.replace(transport) {
            debug!(%registration, "Replacing undelivered postponed transport");
            previous.release();
        }
    }

    /// Deliver a freshly connected key
    ///
    /// A registration paused while the worker was connecting gets the
    /// transport postponed instead.
    fn discovered(&mut self, registration: RegistrationId, key: SecurityKey) {
        match self.registrations.iter().find(|r| r.id == registration).map(|r| r.active) {
            Some(true) => {
                self.track_persistent(&key);
                self.deliver(registration, key);
            }
            Some(false) => {
                debug!(%registration, key = %key.id(), "Registration paused while connecting");
                self.postpone(registration, Arc::clone(key.transport()));
            }
            None => {
                info!(%registration, key = %key.id(), "Registration gone, releasing security key");
                key.release();
            }
        }
    }

    fn track_persistent(&self, key: &SecurityKey) {
        let persistent = key.transport().is_persistent_connection_allowed()
            && (!key.is_transport_nfc() || self.config.enable_persistent_nfc_connection);
        if !persistent {
            return;
        }

        let mut keys = self.shared.persistent.write();
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }

    /// Hook the key's release and hand it to the registration if it is active
    fn deliver(&mut self, registration: RegistrationId, key: SecurityKey) {
        let events = self.events.clone();
        let key_id = key.id();
        let transport = Arc::downgrade(key.transport());
        key.transport().set_release_callback(Box::new(move || {
            let released = CoordinatorEvent::Released {
                registration,
                key: key_id,
                transport,
            };
            if events.send(released).is_err() {
                trace!(key = %key_id, "Coordinator stopped, ignoring transport release");
            }
        }));

        match self.active_registration(registration) {
            Some(active) => active.callback.on_security_key_discovered(key),
            None => debug!(%registration, key = %key.id(), "Registration paused, dropping delivery"),
        }
    }

    fn handle_release(
        &mut self,
        registration: RegistrationId,
        key: SecurityKeyId,
        transport: &Weak<dyn Transport>,
    ) {
        let removed = {
            let mut keys = self.shared.persistent.write();
            keys.iter().position(|k| k.id() == key).map(|index| keys.remove(index))
        };

        if self.config.ignore_nfc_tag_after_use
            && let Some(transport) = transport.upgrade()
            && transport.kind().is_nfc()
            && let Some(watcher) = &self.watcher
        {
            watcher.ignore(&transport);
        }

        let Some(removed) = removed else {
            return;
        };
        debug!(%registration, %key, "Persistent security key disconnected");
        if let Some(active) = self.active_registration(registration) {
            active.callback.on_security_key_disconnected(removed);
        }
    }

    fn has_active_callbacks(&self) -> bool {
        self.registrations
            .iter()
            .any(|registration| !registration.is_bound_forever() && registration.active)
    }

    /// Rescan, or hand the first persistent key some registration takes
    fn trigger_callbacks_actively(&mut self) {
        if self.watcher.as_ref().is_some_and(|watcher| watcher.rescan_devices(true)) {
            return;
        }

        let keys = self.shared.persistent.read().clone();
        for key in keys {
            let target = self
                .registrations
                .iter()
                .find(|registration| registration.can_redeliver(&key))
                .map(|registration| registration.id);
            if let Some(registration) = target {
                debug!(%registration, key = %key.id(), "Redelivering persistent security key");
                self.deliver(registration, key);
                return;
            }
        }
    }

    fn active_registration(&mut self, id: RegistrationId) -> Option<&mut Registration> {
        self.registrations.iter_mut().find(|registration| registration.id == id && registration.active)
    }

    fn publish(&self) {
        *self.shared.registrations.write() =
            self.registrations.iter().map(Registration::view).collect();
    }

    fn send_to_worker(&self, task: WorkerTask) {
        if self.worker.send(task).is_err() {
            debug!("Worker stopped, dropping task");
        }
    }
}
