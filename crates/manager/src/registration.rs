//! Registrations binding a connection mode and a callback to an owner

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use derive_more::Display;
use hwkey_apdu_core::SharedTransport;

use crate::{callback::SecurityKeyCallback, key::SecurityKey, mode::ConnectionMode};

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("registration-{_0}")]
pub struct RegistrationId(u64);

impl RegistrationId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A registration as owned by the coordinator
pub(crate) struct Registration {
    pub(crate) id: RegistrationId,
    /// Owner id, `None` for registrations bound forever
    pub(crate) owner: Option<u64>,
    pub(crate) mode: ConnectionMode,
    pub(crate) callback: Box<dyn SecurityKeyCallback>,
    pub(crate) active: bool,
    pub(crate) postponed: Option<SharedTransport>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("mode", &self.mode.applet_kind())
            .field("active", &self.active)
            .field("postponed", &self.postponed.is_some())
            .finish()
    }
}

impl Registration {
    pub(crate) const fn is_bound_forever(&self) -> bool {
        self.owner.is_none()
    }

    /// Whether a persistent key may be handed to this registration again
    pub(crate) fn can_redeliver(&self, key: &SecurityKey) -> bool {
        !self.is_bound_forever()
            && self.active
            && self.postponed.is_none()
            && self.mode.is_relevant_key(key)
    }

    pub(crate) fn view(&self) -> RegistrationView {
        RegistrationView {
            id: self.id,
            mode: self.mode.clone(),
            active: self.active,
            bound_forever: self.is_bound_forever(),
        }
    }
}

/// Read-only copy of a registration, published for the worker
#[derive(Debug, Clone)]
pub(crate) struct RegistrationView {
    pub(crate) id: RegistrationId,
    pub(crate) mode: ConnectionMode,
    pub(crate) active: bool,
    pub(crate) bound_forever: bool,
}
