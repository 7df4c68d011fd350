use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch::{Receiver, Sender};

/// Notify wraps a watch channel flipped exactly once; every waiter,
/// including late ones, observes the flip.
pub struct Notify {
    sender: Sender<bool>,
    receiver: Receiver<bool>,
    signaled: AtomicBool,
}

impl Notify {
    pub fn new() -> Self {
        let (sender, receiver) = tokio::sync::watch::channel(false);
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
        self.sender.send_replace(true);
        true
    }

    pub fn is_notified(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Resolves once [`Notify::notify`] has been called.
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
