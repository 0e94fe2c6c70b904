//! Release bookkeeping shared by transport implementations

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use super::ReleaseCallback;

/// Tracks whether a transport was released and fires its release callback once
#[derive(Default)]
pub struct ReleaseState {
    released: AtomicBool,
    callback: Mutex<Option<ReleaseCallback>>,
}

impl fmt::Debug for ReleaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseState")
            .field("released", &self.is_released())
            .field("has_callback", &self.callback.lock().is_some())
            .finish()
    }
}

impl ReleaseState {
    /// Create a new, unreleased state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the transport was released
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Install the release callback
    ///
    /// If the transport is already released the callback fires immediately.
    pub fn set_callback(&self, callback: ReleaseCallback) {
        let mut slot = self.callback.lock();
        if self.is_released() {
            drop(slot);
            callback();
        } else {
            *slot = Some(callback);
        }
    }

    /// Mark the transport released
    ///
    /// Returns `true` for the first call only; that call fires the callback.
    pub fn release(&self) -> bool {
        let callback = {
            let mut slot = self.callback.lock();
            if self.released.swap(true, Ordering::AcqRel) {
                return false;
            }
            slot.take()
        };

        if let Some(callback) = callback {
            callback();
        }
        true
    }
}
