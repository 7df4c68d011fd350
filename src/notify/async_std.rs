use std::sync::atomic::{AtomicBool, Ordering};

use async_std::channel::{Receiver, Sender};

/// Notify wraps a channel that is never written to; closing the sender
/// wakes every waiter at once and keeps them awake afterwards.
pub struct Notify {
    sender: Sender<()>,
    receiver: Receiver<()>,
    signaled: AtomicBool,
}

impl Notify {
    pub fn new() -> Self {
        let (sender, receiver) = async_std::channel::bounded(1);
        Self {
            sender,
            receiver,
            signaled: AtomicBool::new(false),
        }
    }

    /// Signals every listener. Returns false if it was already signaled.
    pub fn notify(&self) -> bool {
        if self.signaled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.sender.close();
        true
    }

    pub fn is_notified(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Resolves once [`Notify::notify`] has been called.
    pub async fn wait(&self) {
        // the channel only ever yields an error, on close
        let _ = self.receiver.recv().await;
    }
}
