//! The I/O worker
//!
//! Connects discovered transports and establishes applet connections. All
//! protocol exchanges run here, one at a time. The worker only reads the
//! published registrations; every decision that changes them is sent to the
//! coordinator.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use hwkey_apdu_core::SharedTransport;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    channel::{Pending, Queue, handled},
    coordinator::CoordinatorEvent,
    mode::ConnectionMode,
    registration::{RegistrationId, RegistrationView},
};

/// Tasks handled by the worker
pub(crate) enum WorkerTask {
    /// A transport fresh from a watcher
    Discovered(SharedTransport),
    /// Connect a transport for one registration, after postponement
    Deliver {
        registration: RegistrationId,
        mode: ConnectionMode,
        transport: SharedTransport,
    },
    /// Barrier
    Flush(Sender<()>),
    /// Stop the worker
    Shutdown,
}

pub(crate) struct Worker {
    registrations: Arc<RwLock<Vec<RegistrationView>>>,
    coordinator: Queue<CoordinatorEvent>,
    pending: Pending,
}

impl Worker {
    pub(crate) const fn new(
        registrations: Arc<RwLock<Vec<RegistrationView>>>,
        coordinator: Queue<CoordinatorEvent>,
        pending: Pending,
    ) -> Self {
        Self {
            registrations,
            coordinator,
            pending,
        }
    }

    pub(crate) fn run(self, tasks: Receiver<WorkerTask>) {
        for task in tasks {
            match task {
                WorkerTask::Discovered(transport) => {
                    self.connect_and_deliver_or_postpone(&transport);
                    handled(&self.pending);
                }
                WorkerTask::Deliver {
                    registration,
                    mode,
                    transport,
                } => {
                    self.attempt(registration, &mode, &transport);
                    handled(&self.pending);
                }
                WorkerTask::Flush(done) => {
                    // The flusher may have given up waiting
                    let _ = done.send(());
                }
                WorkerTask::Shutdown => break,
            }
        }
        debug!("Security key worker stopped");
    }

    /// Offer a discovered transport to the registrations, newest first
    ///
    /// Registrations bound forever only get a transport when no owner-bound
    /// registration before them is paused.
    fn connect_and_deliver_or_postpone(&self, transport: &SharedTransport) {
        let kind = transport.kind();
        if let Err(e) = transport.connect() {
            warn!(transport = %kind, error = %e, "Failed initial connection with security key");
            transport.release();
            return;
        }

        let registrations = self.registrations.read().clone();
        let mut has_inactive = false;
        for registration in &registrations {
            has_inactive |= !registration.active;
            if registration.bound_forever && has_inactive {
                continue;
            }
            if !registration.active || !registration.mode.is_relevant_transport(kind) {
                continue;
            }
            if self.attempt(registration.id, &registration.mode, transport) {
                return;
            }
        }

        info!(transport = %kind, "Discovered transport not delivered immediately");

        let postpone_to = registrations.iter().find(|registration| {
            !registration.bound_forever
                && !registration.active
                && registration.mode.is_relevant_transport(kind)
        });
        match postpone_to {
            Some(registration) => self.notify(CoordinatorEvent::Postpone {
                registration: registration.id,
                transport: Arc::clone(transport),
            }),
            None => {
                info!(transport = %kind, "Unhandled transport");
                transport.release();
            }
        }
    }

    /// Establish the mode's applet connection and report the outcome
    ///
    /// Returns `false` only when the mode declined the transport.
    fn attempt(
        &self,
        registration: RegistrationId,
        mode: &ConnectionMode,
        transport: &SharedTransport,
    ) -> bool {
        match mode.establish(Arc::clone(transport)) {
            Ok(None) => false,
            Ok(Some(key)) => {
                debug!(%registration, key = %key.id(), mode = %mode.applet_kind(), "Security key connected");
                self.notify(CoordinatorEvent::Discovered { registration, key });
                true
            }
            Err(error) => {
                warn!(%registration, mode = %mode.applet_kind(), error = %error, "Security key discovery failed");
                self.notify(CoordinatorEvent::DiscoveryFailed {
                    registration,
                    error,
                });
                true
            }
        }
    }

    fn notify(&self, event: CoordinatorEvent) {
        if self.coordinator.send(event).is_err() {
            debug!("Coordinator stopped, dropping event");
        }
    }
}
