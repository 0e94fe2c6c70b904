//! Deadline-bounded execution of link operations
//!
//! Each operation runs on its own short-lived thread so that the caller can
//! stop waiting after a hard wall-clock timeout. On expiry the shared
//! [`Interrupt`] is raised; operations check it between packets and return,
//! dropping their [`LinkRequest`](crate::link::LinkRequest) on the way out.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::{debug, trace};

use crate::{
    error::CtapHidError,
    link::{HidLink, LinkRequest},
};

/// Interval at which blocking reads come back to check for cancellation
pub(crate) const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long a timed-out caller waits for the operation to wind down
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Cooperative cancellation flag shared with a running operation
#[derive(Debug, Clone, Default)]
pub(crate) struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Fail with [`CtapHidError::Interrupted`] once the flag is raised
    pub(crate) fn check(&self) -> Result<(), CtapHidError> {
        if self.0.load(Ordering::Acquire) {
            debug!("Received interrupt, cancelling USB operation");
            return Err(CtapHidError::Interrupted);
        }
        Ok(())
    }
}

/// Run `operation` on a fresh request, bounded by `timeout`
pub(crate) fn run_with_timeout<T, F>(
    link: &Arc<dyn HidLink>,
    timeout: Duration,
    operation: F,
) -> Result<T, CtapHidError>
where
    T: Send + 'static,
    F: FnOnce(&Interrupt, &mut dyn LinkRequest) -> Result<T, CtapHidError> + Send + 'static,
{
    let interrupt = Interrupt::default();
    let (tx, rx) = bounded(1);

    let link = Arc::clone(link);
    let flag = interrupt.clone();
    thread::Builder::new()
        .name("ctaphid-op".into())
        .spawn(move || {
            let result = flag.check().and_then(|()| {
                let mut request = link.open_request()?;
                operation(&flag, request.as_mut())
                // request released here
            });
            let _ = tx.send(result);
        })
        .map_err(|e| CtapHidError::link(format!("failed to spawn operation thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            interrupt.raise();
            // Wait for the operation to drop its request before reporting
            if rx.recv_timeout(CANCEL_GRACE).is_err() {
                debug!("Operation did not acknowledge cancellation in time");
            }
            trace!(?timeout, "Link operation timed out");
            Err(CtapHidError::Timeout)
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(CtapHidError::link("operation thread terminated unexpectedly"))
        }
    }
}

/// Read one packet, polling until it arrives or the operation is interrupted
pub(crate) fn read_packet_interruptible(
    interrupt: &Interrupt,
    request: &mut dyn LinkRequest,
) -> Result<crate::link::Packet, CtapHidError> {
    loop {
        interrupt.check()?;
        if let Some(packet) = request.read_packet(READ_POLL_INTERVAL)? {
            return Ok(packet);
        }
    }
}
