//! Queues between the dispatcher threads
//!
//! Every queued message bumps a shared counter that the receiving thread
//! decrements once the message is handled, so `flush` can tell when the
//! dispatcher is idle. Barriers travel uncounted.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use crate::error::{ManagerError, Result};

/// Counter of messages queued but not yet handled
pub(crate) type Pending = Arc<AtomicUsize>;

/// Sending side of a dispatcher queue
pub(crate) struct Queue<T> {
    sender: Sender<T>,
    pending: Pending,
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("queued", &self.sender.len())
            .field("pending", &self.pending.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Queue<T> {
    /// Queue a message
    pub(crate) fn send(&self, message: T) -> Result<()> {
        self.send_or_return(message).map_err(|_| ManagerError::ShutDown)
    }

    /// Queue a message, handing it back if the receiving thread is gone
    pub(crate) fn send_or_return(&self, message: T) -> std::result::Result<(), T> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.sender.send(message).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            e.into_inner()
        })
    }

    /// Queue a message that is not counted as pending work
    pub(crate) fn send_uncounted(&self, message: T) -> Result<()> {
        self.sender.send(message).map_err(|_| ManagerError::ShutDown)
    }

    /// Wait until every message queued before this call was handled
    pub(crate) fn barrier(&self, flush: impl FnOnce(Sender<()>) -> T) -> Result<()> {
        let (done, wait) = bounded(1);
        self.send_uncounted(flush(done))?;
        wait.recv().map_err(|_| ManagerError::ShutDown)
    }
}

/// Create a queue sharing the given pending counter
pub(crate) fn queue<T>(pending: &Pending) -> (Queue<T>, Receiver<T>) {
    let (sender, receiver) = unbounded();
    (
        Queue {
            sender,
            pending: Arc::clone(pending),
        },
        receiver,
    )
}

/// Mark one counted message as handled
pub(crate) fn handled(pending: &Pending) {
    pending.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    enum Message {
        Work,
        Flush(Sender<()>),
    }

    #[test]
    fn test_barrier_waits_for_counted_work() {
        let pending = Pending::default();
        let (queue, receiver) = queue::<Message>(&pending);

        queue.send(Message::Work).unwrap();
        queue.send(Message::Work).unwrap();
        assert_eq!(pending.load(Ordering::Acquire), 2);

        let counter = Arc::clone(&pending);
        let handle = thread::spawn(move || {
            for message in receiver {
                match message {
                    Message::Work => handled(&counter),
                    Message::Flush(done) => {
                        done.send(()).unwrap();
                        break;
                    }
                }
            }
        });

        queue.barrier(Message::Flush).unwrap();
        assert_eq!(pending.load(Ordering::Acquire), 0);
        handle.join().unwrap();

        assert!(matches!(queue.send(Message::Work), Err(ManagerError::ShutDown)));
        assert_eq!(pending.load(Ordering::Acquire), 0);
    }
}
